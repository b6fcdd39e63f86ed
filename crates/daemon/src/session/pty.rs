//! Pseudo-terminal process wrapper.
//!
//! A [`PtyProcess`] owns exactly one child spawned on the slave side of a pty
//! pair. Output is read on a dedicated thread and handed to async code through
//! a bounded channel, exposed as a [`PtyOutput`] that ends when the process
//! closes the terminal.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;
use portable_pty::{native_pty_system, Child, ChildKiller, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Unique identifier for a session.
pub type SessionId = String;

/// Errors that can occur during session operations.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The process could not be started.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// The session does not exist, or is already terminating.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// Another connection is attached to the session.
    #[error("session already attached: {0}")]
    AlreadyAttached(SessionId),

    /// The session could not be bound to this connection.
    #[error("session is held by another connection: {0}")]
    BindConflict(SessionId),

    /// The requesting principal does not own the session.
    #[error("not authorized for session: {0}")]
    NotAuthorized(SessionId),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// Failed to resize the PTY.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The registry is full.
    #[error("session limit reached ({0})")]
    LimitReached(usize),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Wire error category for this failure.
    pub fn error_code(&self) -> protocol::ErrorCode {
        use protocol::ErrorCode;
        match self {
            SessionError::SpawnFailed(_) => ErrorCode::SpawnFailed,
            SessionError::NotFound(_) | SessionError::AlreadyTerminated(_) => {
                ErrorCode::SessionNotFound
            }
            SessionError::AlreadyAttached(_) | SessionError::BindConflict(_) => {
                ErrorCode::BindConflict
            }
            SessionError::NotAuthorized(_) => ErrorCode::NotAuthorized,
            SessionError::WriteFailed(_) => ErrorCode::InputRejected,
            SessionError::LimitReached(_) => ErrorCode::LimitReached,
            SessionError::ResizeFailed(_) | SessionError::Io(_) => ErrorCode::Internal,
        }
    }
}

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 8192;

/// Chunks buffered between the reader thread and the session pump.
const OUTPUT_CHANNEL_CAPACITY: usize = 64;

/// How long to wait for a SIGKILLed child before giving up.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Exit code once the child has been reaped (`Some(None)` if unknown).
type ExitState = Option<Option<i32>>;

/// What to run and how to size its terminal.
#[derive(Debug, Clone)]
pub struct SpawnParams {
    pub command: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: Option<PathBuf>,
    pub rows: u16,
    pub cols: u16,
}

impl SpawnParams {
    /// Parameters for an interactive shell.
    pub fn shell(shell: Option<String>, rows: u16, cols: u16) -> Self {
        Self {
            command: detect_shell(shell),
            args: Vec::new(),
            env: Vec::new(),
            cwd: None,
            rows,
            cols,
        }
    }
}

/// Output of a pty process. Ends when every holder of the terminal is gone.
#[derive(Debug)]
pub struct PtyOutput {
    rx: mpsc::Receiver<Bytes>,
}

impl PtyOutput {
    /// Next chunk of output, or `None` at end of stream.
    pub async fn next(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

/// A child process running on a pseudo-terminal.
///
/// The child is owned by a waiter thread that reaps it as soon as it exits,
/// so exit is observable even while background jobs keep the terminal open.
pub struct PtyProcess {
    pid: Option<u32>,
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    writer: Mutex<Option<Box<dyn Write + Send>>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    exit: watch::Receiver<ExitState>,
}

impl std::fmt::Debug for PtyProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PtyProcess").field("pid", &self.pid).finish()
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PtyProcess {
    /// Spawns `params.command` on a new pty of the requested size.
    pub fn spawn(params: SpawnParams) -> Result<(Self, PtyOutput), SessionError> {
        let pty_system = native_pty_system();

        let pair = pty_system
            .openpty(PtySize {
                rows: params.rows,
                cols: params.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::SpawnFailed(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&params.command);
        cmd.args(&params.args);
        cmd.env("TERM", "xterm-256color");
        for (key, value) in &params.env {
            cmd.env(key, value);
        }
        if let Some(ref dir) = params.cwd {
            cmd.cwd(dir);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::SpawnFailed(format!("{}: {}", params.command, e)))?;

        // Only the child may hold the slave, otherwise EOF never arrives
        drop(pair.slave);

        let pid = child.process_id();
        let mut killer = child.clone_killer();

        let io = pair
            .master
            .try_clone_reader()
            .and_then(|reader| Ok((reader, pair.master.take_writer()?)));
        let (reader, writer) = match io {
            Ok(io) => io,
            Err(e) => {
                let _ = killer.kill();
                spawn_waiter(child, watch::channel(None).0, pid)?;
                return Err(SessionError::SpawnFailed(e.to_string()));
            }
        };

        let (exit_tx, exit_rx) = watch::channel(None);
        if let Err(e) = spawn_waiter(child, exit_tx, pid) {
            let _ = killer.kill();
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        if let Err(e) = spawn_reader(reader, tx, pid) {
            let _ = killer.kill();
            return Err(e);
        }

        tracing::debug!(
            pid = ?pid,
            command = %params.command,
            rows = params.rows,
            cols = params.cols,
            "Spawned PTY process"
        );

        Ok((
            Self {
                pid,
                master: Mutex::new(Some(pair.master)),
                writer: Mutex::new(Some(writer)),
                killer: Mutex::new(killer),
                exit: exit_rx,
            },
            PtyOutput { rx },
        ))
    }

    /// Returns the process ID, if available.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Writes data to the process's terminal.
    ///
    /// Blocks while the pty input buffer is full.
    pub fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.has_exited() {
            return Err(SessionError::WriteFailed("process has exited".to_string()));
        }

        let mut writer = lock(&self.writer);
        let writer = writer
            .as_mut()
            .ok_or_else(|| SessionError::WriteFailed("terminal is closed".to_string()))?;
        writer
            .write_all(data)
            .map_err(|e| SessionError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| SessionError::WriteFailed(e.to_string()))
    }

    /// Changes the terminal window size.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        lock(&self.master)
            .as_ref()
            .ok_or_else(|| SessionError::ResizeFailed("terminal is closed".to_string()))?
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))
    }

    /// Sends `signal` to every process of the terminal session.
    ///
    /// Background jobs run in their own process groups, so signalling the
    /// child's group alone would leave them holding the terminal.
    pub fn terminate(&self, signal: Signal) {
        let Some(pid) = self.pid else {
            if !self.has_exited() {
                let _ = lock(&self.killer).kill();
            }
            return;
        };
        let leader = Pid::from_raw(pid as i32);

        for member in session_members(leader) {
            if let Err(e) = kill(member, signal) {
                if e != Errno::ESRCH {
                    tracing::debug!(pid = %member, error = %e, "Failed to signal session member");
                }
            }
        }

        if self.has_exited() {
            return;
        }
        match killpg(leader, signal) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => {
                tracing::debug!(pid, error = %e, "killpg failed, killing child directly");
                if let Err(e) = lock(&self.killer).kill() {
                    tracing::debug!(pid, error = %e, "Failed to kill child");
                }
            }
        }
    }

    /// Exit code if the child has been reaped.
    pub fn try_wait(&self) -> ExitState {
        *self.exit.borrow()
    }

    /// Resolves once the child has been reaped, with its exit code.
    pub async fn exited(&self) -> Option<i32> {
        let mut exit = self.exit.clone();
        let reaped = exit.wait_for(Option::is_some).await;
        reaped.ok().and_then(|state| *state).flatten()
    }

    /// Waits for the child to exit, escalating to SIGKILL after `grace`.
    pub async fn wait_exit(&self, grace: Duration) -> Option<i32> {
        if let Ok(code) = tokio::time::timeout(grace, self.exited()).await {
            return code;
        }

        tracing::warn!(pid = ?self.pid, "Process did not exit within grace period, sending SIGKILL");
        self.terminate(Signal::SIGKILL);

        match tokio::time::timeout(KILL_WAIT, self.exited()).await {
            Ok(code) => code,
            Err(_) => {
                tracing::error!(pid = ?self.pid, "Process survived SIGKILL");
                None
            }
        }
    }

    /// Returns whether the child has been reaped.
    pub fn has_exited(&self) -> bool {
        self.try_wait().is_some()
    }

    /// Releases the master side of the terminal.
    pub fn close(&self) {
        lock(&self.writer).take();
        lock(&self.master).take();
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        if self.has_exited() {
            return;
        }
        // The waiter thread reaps the child
        self.terminate(Signal::SIGKILL);
        let _ = lock(&self.killer).kill();
        tracing::debug!(pid = ?self.pid, "Killed PTY process on drop");
    }
}

/// Pids of the live processes whose session id is `leader`.
#[cfg(target_os = "linux")]
pub(crate) fn session_members(leader: Pid) -> Vec<Pid> {
    let Ok(entries) = std::fs::read_dir("/proc") else {
        return Vec::new();
    };
    entries
        .filter_map(Result::ok)
        .filter_map(|entry| entry.file_name().to_str()?.parse::<i32>().ok())
        .filter(|&pid| live_session_id(pid) == Some(leader.as_raw()))
        .map(Pid::from_raw)
        .collect()
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn session_members(_leader: Pid) -> Vec<Pid> {
    Vec::new()
}

/// Session id from `/proc/{pid}/stat`, or `None` for zombies.
#[cfg(target_os = "linux")]
fn live_session_id(pid: i32) -> Option<i32> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // comm may contain spaces and parentheses
    let mut fields = stat[stat.rfind(')')? + 1..].split_whitespace();
    let state = fields.next()?;
    if state == "Z" || state == "X" {
        return None;
    }
    // ppid, pgrp, session
    fields.nth(2)?.parse().ok()
}

fn spawn_waiter(
    mut child: Box<dyn Child + Send + Sync>,
    exit: watch::Sender<ExitState>,
    pid: Option<u32>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name(format!("pty-wait-{}", pid.unwrap_or_default()))
        .spawn(move || {
            let code = match child.wait() {
                Ok(status) => Some(status.exit_code() as i32),
                Err(e) => {
                    tracing::warn!(pid = ?pid, error = %e, "Failed to wait for child");
                    None
                }
            };
            tracing::trace!(pid = ?pid, exit_code = ?code, "PTY child reaped");
            exit.send_replace(Some(code));
        })
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}

fn spawn_reader(
    mut reader: Box<dyn Read + Send>,
    tx: mpsc::Sender<Bytes>,
    pid: Option<u32>,
) -> Result<(), SessionError> {
    std::thread::Builder::new()
        .name(format!("pty-reader-{}", pid.unwrap_or_default()))
        .spawn(move || {
            let mut buffer = vec![0u8; READ_BUFFER_SIZE];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        if tx.blocking_send(Bytes::copy_from_slice(&buffer[..n])).is_err() {
                            break;
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    // EIO once the slave side is closed
                    Err(_) => break,
                }
            }
            tracing::trace!(pid = ?pid, "PTY reader finished");
        })
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}

/// Detects the shell to use.
///
/// Returns the shell in this order of preference:
/// 1. The provided shell if Some
/// 2. The $SHELL environment variable
/// 3. /bin/sh as fallback
pub fn detect_shell(shell: Option<String>) -> String {
    if let Some(s) = shell.filter(|s| !s.is_empty()) {
        return s;
    }

    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn sh() -> SpawnParams {
        SpawnParams::shell(Some("/bin/sh".to_string()), 24, 80)
    }

    async fn read_until(output: &mut PtyOutput, needle: &str) -> bool {
        let mut seen = String::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match timeout(Duration::from_millis(200), output.next()).await {
                Ok(Some(chunk)) => {
                    seen.push_str(&String::from_utf8_lossy(&chunk));
                    if seen.contains(needle) {
                        return true;
                    }
                }
                Ok(None) => return false,
                Err(_) => {}
            }
        }
        false
    }

    #[test]
    fn test_detect_shell_with_provided() {
        assert_eq!(detect_shell(Some("/bin/bash".to_string())), "/bin/bash");
    }

    #[test]
    fn test_detect_shell_fallback() {
        assert!(!detect_shell(None).is_empty());
        assert!(!detect_shell(Some(String::new())).is_empty());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let mut params = sh();
        params.command = "/nonexistent/definitely-not-a-shell".to_string();
        let result = PtyProcess::spawn(params);
        assert!(matches!(result, Err(SessionError::SpawnFailed(_))));
    }

    #[tokio::test]
    async fn test_write_and_read() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();
        assert!(process.pid().is_some());

        process.write(b"echo pty_marker_$((20+22))\n").unwrap();
        assert!(read_until(&mut output, "pty_marker_42").await);

        process.terminate(Signal::SIGKILL);
    }

    #[tokio::test]
    async fn test_term_variable_set() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();
        process.write(b"echo term=$TERM\n").unwrap();
        assert!(read_until(&mut output, "term=xterm-256color").await);
        process.terminate(Signal::SIGKILL);
    }

    #[tokio::test]
    async fn test_env_and_args() {
        let params = SpawnParams {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "echo value=$PTY_TEST_VAR".to_string()],
            env: vec![("PTY_TEST_VAR".to_string(), "abc".to_string())],
            cwd: None,
            rows: 24,
            cols: 80,
        };
        let (_process, mut output) = PtyProcess::spawn(params).unwrap();
        assert!(read_until(&mut output, "value=abc").await);
    }

    #[tokio::test]
    async fn test_output_ends_and_exit_code() {
        let params = SpawnParams {
            command: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), "exit 7".to_string()],
            env: Vec::new(),
            cwd: None,
            rows: 24,
            cols: 80,
        };
        let (process, mut output) = PtyProcess::spawn(params).unwrap();

        let ended = timeout(Duration::from_secs(5), async {
            while output.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "output stream did not end");

        let code = process.wait_exit(Duration::from_secs(2)).await;
        assert_eq!(code, Some(7));
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_resize() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();
        process.resize(40, 120).unwrap();
        process.write(b"stty size\n").unwrap();
        assert!(read_until(&mut output, "40 120").await);
        process.terminate(Signal::SIGKILL);
    }

    #[tokio::test]
    async fn test_terminate_is_idempotent() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();

        process.terminate(Signal::SIGKILL);
        while output.next().await.is_some() {}
        process.wait_exit(Duration::from_secs(2)).await;

        process.terminate(Signal::SIGHUP);
        process.terminate(Signal::SIGKILL);
        assert!(process.has_exited());
    }

    #[tokio::test]
    async fn test_write_after_exit_fails() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();
        process.terminate(Signal::SIGKILL);
        while output.next().await.is_some() {}
        process.wait_exit(Duration::from_secs(2)).await;

        let result = process.write(b"echo hi\n");
        assert!(matches!(result, Err(SessionError::WriteFailed(_))));
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_exit_observed_while_background_job_holds_terminal() {
        let (process, mut output) = PtyProcess::spawn(sh()).unwrap();
        let leader = Pid::from_raw(process.pid().unwrap() as i32);

        process.write(b"sleep 300 &\necho bg_$((1+1))\n").unwrap();
        assert!(read_until(&mut output, "bg_2").await);
        assert!(session_members(leader).len() >= 2);

        process.write(b"exit 0\n").unwrap();
        let code = timeout(Duration::from_secs(5), process.exited())
            .await
            .expect("shell exit not observed");
        assert_eq!(code, Some(0));
        assert!(process.has_exited());

        // The job outlived the shell; terminate still reaches it
        process.terminate(Signal::SIGKILL);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !session_members(leader).is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "session members survived");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let ended = timeout(Duration::from_secs(5), async {
            while output.next().await.is_some() {}
        })
        .await;
        assert!(ended.is_ok(), "output stream did not end");
    }

    #[tokio::test]
    async fn test_close_releases_terminal() {
        let (process, _output) = PtyProcess::spawn(sh()).unwrap();
        process.close();

        assert!(matches!(
            process.resize(30, 100),
            Err(SessionError::ResizeFailed(_))
        ));
        assert!(matches!(
            process.write(b"echo hi\n"),
            Err(SessionError::WriteFailed(_))
        ));
        process.terminate(Signal::SIGKILL);
        assert!(timeout(Duration::from_secs(5), process.exited()).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_kills_and_reaps_off_runtime() {
        let (process, _output) = PtyProcess::spawn(sh()).unwrap();
        let pid = Pid::from_raw(process.pid().unwrap() as i32);

        let started = std::time::Instant::now();
        drop(process);
        assert!(started.elapsed() < Duration::from_millis(200));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while kill(pid, None).is_ok() {
            assert!(tokio::time::Instant::now() < deadline, "dropped child not reaped");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(
            SessionError::NotFound("x".into()).error_code(),
            protocol::ErrorCode::SessionNotFound
        );
        assert_eq!(
            SessionError::LimitReached(3).error_code(),
            protocol::ErrorCode::LimitReached
        );
    }
}
