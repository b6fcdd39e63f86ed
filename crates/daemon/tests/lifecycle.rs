//! Session lifecycle against real processes.
//!
//! These count the descriptors of the whole test process, so they run
//! serially and live in their own binary.

#![cfg(target_os = "linux")]

use std::time::Duration;

use daemon::auth::Principal;
use daemon::session::{
    DetachReason, RegistryConfig, SessionLimits, SessionRegistry, SessionState, SpawnParams,
};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serial_test::serial;
use tokio::time::timeout;
use uuid::Uuid;

const CYCLES: usize = 50;

/// Descriptors the runtime may open or close on its own between samples.
const FD_SLACK: usize = 8;

fn registry() -> SessionRegistry {
    SessionRegistry::new(RegistryConfig {
        max_sessions: 4,
        idle_timeout: Duration::from_secs(60),
        limits: SessionLimits {
            buffer_capacity: 4096,
            output_watermark: 16,
            terminate_grace: Duration::from_millis(500),
        },
    })
}

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .map(|entries| entries.count())
        .unwrap_or_default()
}

/// Creates a shell and terminates it. Returns its pid.
async fn cycle(registry: &SessionRegistry) -> u32 {
    let params = SpawnParams::shell(Some("/bin/sh".to_string()), 24, 80);
    let session = registry.create(Principal::Anonymous, params).unwrap();
    let pid = session.pid().unwrap();
    registry
        .terminate(session.id(), &Principal::Anonymous)
        .await
        .unwrap();
    pid
}

#[tokio::test]
#[serial]
async fn test_command_output_then_dead() {
    let registry = registry();
    let params = SpawnParams {
        command: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "echo hello".to_string()],
        ..SpawnParams::shell(None, 24, 80)
    };

    let session = registry.create(Principal::Anonymous, params).unwrap();
    let id = session.id().clone();
    let mut attachment = session.attach(Uuid::new_v4()).unwrap();

    let first = timeout(Duration::from_secs(5), attachment.output.recv())
        .await
        .expect("no output")
        .expect("output closed");
    assert!(
        String::from_utf8_lossy(&first).contains("hello"),
        "first output was {first:?}"
    );

    timeout(Duration::from_secs(5), session.wait_dead())
        .await
        .expect("session did not die");
    assert_eq!(session.state(), SessionState::Dead);
    assert_eq!(session.exit_code(), Some(0));
    assert_eq!(
        attachment.detached.await.unwrap(),
        DetachReason::Exited(Some(0))
    );
    assert!(registry.get(&id).is_none());
    assert_eq!(registry.count(), 0);
}

#[tokio::test]
#[serial]
async fn test_create_terminate_cycles_release_descriptors() {
    let registry = registry();

    // First spawn opens descriptors the runtime keeps
    cycle(&registry).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let baseline = open_fds();

    let mut pids = Vec::with_capacity(CYCLES);
    for _ in 0..CYCLES {
        pids.push(cycle(&registry).await);
    }
    assert_eq!(registry.count(), 0);

    // Reader threads drop their end just after the session dies
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let now = open_fds();
        if now <= baseline + FD_SLACK {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "open descriptors grew from {baseline} to {now} over {CYCLES} sessions"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    for pid in pids {
        assert!(kill(Pid::from_raw(pid as i32), None).is_err(), "pid {pid} survived");
    }
}
