//! Table of live sessions.
//!
//! The registry is the only place sessions are created and removed. Every
//! session gets an output pump task that forwards process output and, when
//! the process is gone, removes the session from the table. That pump is the
//! single remover, whether the process exited on its own, was terminated on
//! request, was reaped for idleness, or was stopped at shutdown.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::future::join_all;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::pty::{SessionError, SessionId, SpawnParams};
use super::terminal::{Session, SessionLimits, SessionSummary};
use crate::auth::Principal;

/// Registry policy taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub max_sessions: usize,
    pub idle_timeout: Duration,
    pub limits: SessionLimits,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_sessions: 32,
            idle_timeout: Duration::from_secs(30 * 60),
            limits: SessionLimits::default(),
        }
    }
}

struct RegistryInner {
    sessions: DashMap<SessionId, Arc<Session>>,
    config: RegistryConfig,
    /// Serializes the limit check with insertion.
    create_lock: Mutex<()>,
}

/// Owns all sessions. Cheap to clone; clones share the same table.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: DashMap::new(),
                config,
                create_lock: Mutex::new(()),
            }),
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.inner.config
    }

    /// Resolves an attach request.
    ///
    /// With an id, returns that session if `principal` owns it. Without one,
    /// creates a new session owned by `principal`.
    pub fn get_or_create(
        &self,
        id: Option<&str>,
        principal: &Principal,
        params: SpawnParams,
    ) -> Result<Arc<Session>, SessionError> {
        match id {
            Some(id) => self.get_owned(id, principal),
            None => self.create(principal.clone(), params),
        }
    }

    /// Spawns a new session and starts its output pump.
    pub fn create(
        &self,
        owner: Principal,
        params: SpawnParams,
    ) -> Result<Arc<Session>, SessionError> {
        let (session, output) = {
            let _guard = self
                .inner
                .create_lock
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            let max = self.inner.config.max_sessions;
            if self.inner.sessions.len() >= max {
                tracing::warn!(max_sessions = max, "Session limit reached");
                return Err(SessionError::LimitReached(max));
            }

            let (session, output) = Session::start(owner, params, self.inner.config.limits)?;
            self.inner
                .sessions
                .insert(session.id().clone(), Arc::clone(&session));
            (session, output)
        };

        let registry = self.clone();
        let pumped = Arc::clone(&session);
        tokio::spawn(async move {
            let code = pumped.pump_output(output).await;
            registry.remove(&pumped);
            pumped.on_process_exit(code);
        });

        tracing::info!(
            session_id = %session.id(),
            owner = %session.owner(),
            sessions = self.count(),
            "Created session"
        );

        Ok(session)
    }

    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.inner.sessions.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Looks up a live session owned by `principal`.
    pub fn get_owned(&self, id: &str, principal: &Principal) -> Result<Arc<Session>, SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !principal.may_access(session.owner()) {
            tracing::warn!(session_id = %id, principal = %principal, "Rejected access to session");
            return Err(SessionError::NotAuthorized(id.to_string()));
        }
        if !session.state().is_live() {
            return Err(SessionError::NotFound(id.to_string()));
        }
        Ok(session)
    }

    /// Sessions owned by `principal`, oldest first.
    pub fn list_for_owner(&self, principal: &Principal) -> Vec<SessionSummary> {
        let mut sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| principal.may_access(entry.value().owner()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        sessions.sort_by_key(|s| s.created_instant());
        sessions.iter().map(|s| s.summary()).collect()
    }

    pub fn count(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Terminates a session on behalf of `principal`.
    ///
    /// Returns once the process is dead and the session is removed.
    pub async fn terminate(&self, id: &str, principal: &Principal) -> Result<(), SessionError> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        if !principal.may_access(session.owner()) {
            tracing::warn!(session_id = %id, principal = %principal, "Rejected terminate");
            return Err(SessionError::NotAuthorized(id.to_string()));
        }

        session.terminate().await?;
        tracing::info!(session_id = %id, "Session terminated");
        Ok(())
    }

    /// Terminates detached sessions idle longer than the configured timeout.
    ///
    /// Returns the ids of the sessions being reaped. Their processes are
    /// killed in the background.
    pub fn reap_idle(&self, now: Instant) -> Vec<SessionId> {
        let timeout = self.inner.config.idle_timeout;
        let reaped: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .filter(|entry| entry.value().begin_idle_reap(now, timeout))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        reaped
            .into_iter()
            .map(|session| {
                let id = session.id().clone();
                tracing::info!(session_id = %id, "Reaping idle session");
                tokio::spawn(async move { session.kill_process().await });
                id
            })
            .collect()
    }

    /// Starts a background task that periodically reaps idle sessions.
    pub fn start_reaper(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Idle reaper stopped");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle(Instant::now());
                        if !reaped.is_empty() {
                            tracing::info!(count = reaped.len(), "Reaped idle sessions");
                        }
                    }
                }
            }
        })
    }

    /// Terminates every session. Used at server stop.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = self
            .inner
            .sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        tracing::info!(count = sessions.len(), "Terminating all sessions");
        join_all(sessions.iter().map(|session| async move {
            if let Err(e) = session.terminate().await {
                tracing::debug!(session_id = %session.id(), error = %e, "Terminate during shutdown");
            }
        }))
        .await;
    }

    fn remove(&self, session: &Arc<Session>) {
        let removed = self
            .inner
            .sessions
            .remove_if(session.id(), |_, current| Arc::ptr_eq(current, session));

        if removed.is_none() {
            tracing::error!(
                session_id = %session.id(),
                "Removal of a session that is not in the registry"
            );
        } else {
            tracing::debug!(session_id = %session.id(), "Removed session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(target_os = "linux")]
    use crate::session::pty::session_members;
    use crate::session::SessionState;
    use bytes::Bytes;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    use tokio::time::timeout;
    use uuid::Uuid;

    fn config() -> RegistryConfig {
        RegistryConfig {
            max_sessions: 8,
            idle_timeout: Duration::from_secs(60),
            limits: SessionLimits {
                buffer_capacity: 4096,
                output_watermark: 16,
                terminate_grace: Duration::from_millis(500),
            },
        }
    }

    fn sh() -> SpawnParams {
        SpawnParams::shell(Some("/bin/sh".to_string()), 24, 80)
    }

    fn alice() -> Principal {
        Principal::Token("alice".to_string())
    }

    fn bob() -> Principal {
        Principal::Token("bob".to_string())
    }

    async fn wait_removed(registry: &SessionRegistry, id: &str) -> bool {
        for _ in 0..250 {
            if registry.get(id).is_none() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn recv_until(rx: &mut tokio::sync::mpsc::Receiver<Bytes>, needle: &str) -> bool {
        let mut seen = String::new();
        while !seen.contains(needle) {
            match timeout(Duration::from_secs(5), rx.recv()).await {
                Ok(Some(chunk)) => seen.push_str(&String::from_utf8_lossy(&chunk)),
                _ => return false,
            }
        }
        true
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let registry = SessionRegistry::new(config());
        let session = registry.get_or_create(None, &alice(), sh()).unwrap();

        assert_eq!(registry.count(), 1);
        let found = registry
            .get_or_create(Some(session.id()), &alice(), sh())
            .unwrap();
        assert!(Arc::ptr_eq(&session, &found));

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_id_not_found() {
        let registry = SessionRegistry::new(config());
        let result = registry.get_or_create(Some("no-such-session"), &alice(), sh());
        assert!(matches!(result, Err(SessionError::NotFound(_))));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_other_owner_not_authorized() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let id = session.id().clone();

        assert!(matches!(
            registry.get_or_create(Some(&id), &bob(), sh()),
            Err(SessionError::NotAuthorized(_))
        ));
        assert!(matches!(
            registry.terminate(&id, &bob()).await,
            Err(SessionError::NotAuthorized(_))
        ));

        // Still alive and usable by its owner
        assert!(session.state().is_live());
        registry.terminate(&id, &alice()).await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_removes_session() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let id = session.id().clone();

        timeout(Duration::from_secs(10), registry.terminate(&id, &alice()))
            .await
            .unwrap()
            .unwrap();

        assert!(registry.get(&id).is_none());
        assert_eq!(session.state(), SessionState::Dead);
        assert!(matches!(
            registry.terminate(&id, &alice()).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_process_exit_removes_session() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let id = session.id().clone();

        session
            .feed_input(Bytes::from_static(b"exit 0\n"))
            .await
            .unwrap();

        assert!(wait_removed(&registry, &id).await);
        assert!(matches!(
            registry.get_or_create(Some(&id), &alice(), sh()),
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_session_limit() {
        let mut cfg = config();
        cfg.max_sessions = 2;
        let registry = SessionRegistry::new(cfg);

        registry.create(alice(), sh()).unwrap();
        registry.create(alice(), sh()).unwrap();
        assert!(matches!(
            registry.create(alice(), sh()),
            Err(SessionError::LimitReached(2))
        ));

        registry.shutdown().await;
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_not_registered() {
        let registry = SessionRegistry::new(config());
        let mut params = sh();
        params.command = "/nonexistent/shell".to_string();
        assert!(matches!(
            registry.create(alice(), params),
            Err(SessionError::SpawnFailed(_))
        ));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_list_for_owner() {
        let registry = SessionRegistry::new(config());
        let first = registry.create(alice(), sh()).unwrap();
        let second = registry.create(alice(), sh()).unwrap();
        registry.create(bob(), sh()).unwrap();

        let listed = registry.list_for_owner(&alice());
        assert_eq!(listed.len(), 2);
        assert_eq!(&listed[0].id, first.id());
        assert_eq!(&listed[1].id, second.id());
        assert_eq!(registry.list_for_owner(&bob()).len(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_idle_reap_then_attach_not_found() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let id = session.id().clone();

        assert!(registry.reap_idle(Instant::now()).is_empty());

        let later = Instant::now() + Duration::from_secs(61);
        assert_eq!(registry.reap_idle(later), vec![id.clone()]);

        // Marked before the kill completes; attach already fails
        assert!(matches!(
            registry.get_or_create(Some(&id), &alice(), sh()),
            Err(SessionError::NotFound(_))
        ));
        assert!(wait_removed(&registry, &id).await);
    }

    #[tokio::test]
    async fn test_attached_session_not_reaped() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let _attachment = session.attach(Uuid::new_v4()).unwrap();

        let later = Instant::now() + Duration::from_secs(3600);
        assert!(registry.reap_idle(later).is_empty());
        assert_eq!(registry.count(), 1);

        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reaper_task_stops_on_cancel() {
        let registry = SessionRegistry::new(config());
        let cancel = CancellationToken::new();
        let handle = registry.start_reaper(Duration::from_millis(10), cancel.clone());

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_terminate_with_background_job() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();
        let id = session.id().clone();
        let leader = Pid::from_raw(session.pid().unwrap() as i32);

        let mut attachment = session.attach(Uuid::new_v4()).unwrap();
        session
            .feed_input(Bytes::from_static(b"sleep 300 &\necho job_$((2+3))\n"))
            .await
            .unwrap();
        assert!(recv_until(&mut attachment.output, "job_5").await);
        assert!(session_members(leader).len() >= 2);

        timeout(Duration::from_secs(10), registry.terminate(&id, &alice()))
            .await
            .expect("terminate hung")
            .unwrap();

        assert_eq!(registry.count(), 0);
        assert_eq!(session.state(), SessionState::Dead);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !session_members(leader).is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "background job survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_terminate_removes_exited_pids() {
        let registry = SessionRegistry::new(config());
        let mut pids = Vec::new();

        for _ in 0..10 {
            let session = registry.create(alice(), sh()).unwrap();
            pids.push(session.pid().unwrap());
            let id = session.id().clone();
            registry.terminate(&id, &alice()).await.unwrap();
        }

        assert_eq!(registry.count(), 0);
        for pid in pids {
            // Reaped children no longer exist
            assert!(kill(Pid::from_raw(pid as i32), None).is_err(), "pid {pid} survived");
        }
    }

    #[tokio::test]
    async fn test_concurrent_attach_single_writer() {
        let registry = SessionRegistry::new(config());
        let session = registry.create(alice(), sh()).unwrap();

        let attempts = (0..16).map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move { session.attach(Uuid::new_v4()).ok() })
        });
        let attachments: Vec<_> = join_all(attempts)
            .await
            .into_iter()
            .filter_map(|r| r.ok().flatten())
            .collect();

        assert_eq!(attachments.len(), 1);
        assert_eq!(
            session.attached_connection(),
            Some(attachments[0].connection_id)
        );

        registry.shutdown().await;
    }
}
