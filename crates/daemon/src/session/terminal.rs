//! A terminal session: one pty process, its replay buffer, and at most one
//! attached connection.
//!
//! All mutable state sits behind a single mutex so attach, detach, output
//! delivery and lifecycle transitions are serialized per session. Nothing
//! awaits while holding it.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use nix::sys::signal::Signal;
use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use super::pty::{PtyOutput, PtyProcess, SessionError, SessionId, SpawnParams};
use super::scrollback::OutputRing;
use crate::auth::Principal;

/// Identifies one websocket connection.
pub type ConnectionId = Uuid;

/// Input chunks queued for the writer thread.
const INPUT_CHANNEL_CAPACITY: usize = 256;

/// How long to wait for death after SIGKILL.
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Output still in flight when the child is reaped.
const DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Starting,
    Attached,
    Detached,
    Terminating,
    Dead,
}

impl SessionState {
    /// Whether connections may attach.
    pub fn is_live(self) -> bool {
        matches!(self, SessionState::Attached | SessionState::Detached)
    }
}

/// Why an attached connection lost the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    /// A newer connection took the session over.
    Replaced,
    /// The connection fell too far behind the process output.
    Overflow,
    /// The process exited.
    Exited(Option<i32>),
    /// The session was terminated.
    Terminated,
}

/// Per-session policy taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionLimits {
    /// Replay buffer size in bytes.
    pub buffer_capacity: usize,
    /// Output chunks queued for a connection before it is evicted.
    pub output_watermark: usize,
    /// Time between SIGHUP and SIGKILL on terminate.
    pub terminate_grace: Duration,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            buffer_capacity: 256 * 1024,
            output_watermark: 256,
            terminate_grace: Duration::from_secs(2),
        }
    }
}

/// Handed to the connection that attached.
///
/// `output` yields the replay snapshot first, then live output. `detached`
/// fires if the session takes the attachment away.
#[derive(Debug)]
pub struct Attachment {
    pub connection_id: ConnectionId,
    pub output: mpsc::Receiver<Bytes>,
    pub detached: oneshot::Receiver<DetachReason>,
}

/// Listing view of a session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub state: SessionState,
    pub rows: u16,
    pub cols: u16,
    pub pid: Option<u32>,
    /// Creation time, seconds since the Unix epoch.
    pub created_at: u64,
    /// Seconds since the last I/O or attach.
    pub idle_secs: u64,
    pub attached: bool,
    pub exit_code: Option<i32>,
    /// Bytes the process has written since it started.
    pub output_bytes: u64,
    /// Output bytes no longer available for replay.
    pub evicted_bytes: u64,
}

struct AttachedConnection {
    id: ConnectionId,
    output: mpsc::Sender<Bytes>,
    detached: oneshot::Sender<DetachReason>,
}

struct Inner {
    state: SessionState,
    attached: Option<AttachedConnection>,
    ring: OutputRing,
    rows: u16,
    cols: u16,
    last_activity: Instant,
    exit_code: Option<i32>,
    input: Option<mpsc::Sender<Bytes>>,
}

impl Inner {
    /// Detached with no activity for longer than `timeout`.
    fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        self.state == SessionState::Detached
            && now.saturating_duration_since(self.last_activity) > timeout
    }

    /// Drops the attachment, telling it why. Returns the evicted connection.
    fn evict(&mut self, reason: DetachReason) -> Option<ConnectionId> {
        let attached = self.attached.take()?;
        let _ = attached.detached.send(reason);
        if self.state == SessionState::Attached {
            self.state = SessionState::Detached;
        }
        Some(attached.id)
    }
}

pub struct Session {
    id: SessionId,
    owner: Principal,
    created_at: SystemTime,
    created_instant: Instant,
    process: Arc<PtyProcess>,
    limits: SessionLimits,
    inner: Mutex<Inner>,
    dead: watch::Sender<bool>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Spawns the process and returns the session with its output stream.
    ///
    /// The caller drives the output through [`Session::pump_output`].
    pub fn start(
        owner: Principal,
        params: SpawnParams,
        limits: SessionLimits,
    ) -> Result<(Arc<Self>, PtyOutput), SessionError> {
        let id = Uuid::new_v4().to_string();
        let (rows, cols) = (params.rows, params.cols);
        let (process, output) = PtyProcess::spawn(params)?;
        let process = Arc::new(process);

        let (input_tx, input_rx) = mpsc::channel(INPUT_CHANNEL_CAPACITY);
        spawn_writer(&id, Arc::clone(&process), input_rx)?;

        let now = Instant::now();
        let session = Arc::new(Self {
            id,
            owner,
            created_at: SystemTime::now(),
            created_instant: now,
            process,
            limits,
            inner: Mutex::new(Inner {
                state: SessionState::Starting,
                attached: None,
                ring: OutputRing::new(limits.buffer_capacity),
                rows,
                cols,
                last_activity: now,
                exit_code: None,
                input: Some(input_tx),
            }),
            dead: watch::channel(false).0,
        });

        // No readiness signal exists for a shell; spawned means usable.
        session.lock().state = SessionState::Detached;

        tracing::info!(
            session_id = %session.id,
            pid = ?session.process.pid(),
            rows,
            cols,
            "Session started"
        );

        Ok((session, output))
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn owner(&self) -> &Principal {
        &self.owner
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.pid()
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn dimensions(&self) -> (u16, u16) {
        let inner = self.lock();
        (inner.rows, inner.cols)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.lock().exit_code
    }

    /// Monotonic creation time, for ordering.
    pub fn created_instant(&self) -> Instant {
        self.created_instant
    }

    /// Connection currently attached, if any.
    pub fn attached_connection(&self) -> Option<ConnectionId> {
        self.lock().attached.as_ref().map(|a| a.id)
    }

    /// Binds `connection_id` as the sole attachment.
    ///
    /// The replay snapshot is queued ahead of any live output.
    pub fn attach(&self, connection_id: ConnectionId) -> Result<Attachment, SessionError> {
        let mut inner = self.lock();

        if !inner.state.is_live() {
            return Err(SessionError::NotFound(self.id.clone()));
        }
        if inner.attached.is_some() {
            return Err(SessionError::AlreadyAttached(self.id.clone()));
        }

        let (output_tx, output_rx) = mpsc::channel(self.limits.output_watermark.max(1));
        let snapshot = inner.ring.snapshot();
        if !snapshot.is_empty() {
            // Fresh channel with capacity >= 1; cannot be full
            let _ = output_tx.try_send(snapshot);
        }

        let (detached_tx, detached_rx) = oneshot::channel();
        inner.attached = Some(AttachedConnection {
            id: connection_id,
            output: output_tx,
            detached: detached_tx,
        });
        inner.state = SessionState::Attached;
        inner.last_activity = Instant::now();

        tracing::info!(
            session_id = %self.id,
            connection_id = %connection_id,
            replay_bytes = inner.ring.len(),
            "Connection attached"
        );

        Ok(Attachment {
            connection_id,
            output: output_rx,
            detached: detached_rx,
        })
    }

    /// Detaches `connection_id` if it is the attached connection.
    ///
    /// Returns false when another connection (or none) holds the session.
    pub fn detach(&self, connection_id: ConnectionId) -> bool {
        let mut inner = self.lock();

        match &inner.attached {
            Some(attached) if attached.id == connection_id => {}
            _ => return false,
        }

        inner.attached = None;
        if inner.state == SessionState::Attached {
            inner.state = SessionState::Detached;
        }
        inner.last_activity = Instant::now();

        tracing::info!(
            session_id = %self.id,
            connection_id = %connection_id,
            "Connection detached"
        );
        true
    }

    /// Forcibly detaches the current connection.
    pub fn evict(&self, reason: DetachReason) -> Option<ConnectionId> {
        let evicted = self.lock().evict(reason);
        if let Some(connection_id) = evicted {
            tracing::info!(
                session_id = %self.id,
                connection_id = %connection_id,
                reason = ?reason,
                "Connection evicted"
            );
        }
        evicted
    }

    /// Queues input for the process. Ordered with respect to earlier calls.
    pub async fn feed_input(&self, data: Bytes) -> Result<(), SessionError> {
        let input = {
            let mut inner = self.lock();
            inner.last_activity = Instant::now();
            inner.input.clone()
        };

        let input =
            input.ok_or_else(|| SessionError::WriteFailed("process is not running".to_string()))?;
        input
            .send(data)
            .await
            .map_err(|_| SessionError::WriteFailed("process input closed".to_string()))
    }

    /// Resizes the terminal.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), SessionError> {
        let mut inner = self.lock();
        if !inner.state.is_live() {
            return Err(SessionError::AlreadyTerminated(self.id.clone()));
        }
        self.process.resize(rows, cols)?;
        inner.rows = rows;
        inner.cols = cols;
        inner.last_activity = Instant::now();

        tracing::debug!(session_id = %self.id, rows, cols, "Resized session");
        Ok(())
    }

    /// Records process output and forwards it to the attachment.
    ///
    /// Never blocks: a connection whose queue is full is evicted and the
    /// session keeps accumulating into its buffer.
    pub fn on_process_output(&self, chunk: Bytes) {
        let mut inner = self.lock();
        inner.ring.push(&chunk);
        inner.last_activity = Instant::now();

        let sent = match &inner.attached {
            Some(attached) => attached.output.try_send(chunk),
            None => return,
        };

        match sent {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if let Some(connection_id) = inner.evict(DetachReason::Overflow) {
                    tracing::warn!(
                        session_id = %self.id,
                        connection_id = %connection_id,
                        "Connection too slow, evicted"
                    );
                }
            }
            Err(TrySendError::Closed(_)) => {
                // Receiver vanished without detaching
                inner.attached = None;
                if inner.state == SessionState::Attached {
                    inner.state = SessionState::Detached;
                }
            }
        }
    }

    /// Marks the session dead and releases the attachment.
    pub fn on_process_exit(&self, code: Option<i32>) {
        let (output_bytes, evicted_bytes) = {
            let mut inner = self.lock();
            inner.state = SessionState::Dead;
            inner.exit_code = code;
            inner.input = None;
            inner.evict(DetachReason::Exited(code));
            (inner.ring.total_written(), inner.ring.evicted())
        };
        self.dead.send_replace(true);

        tracing::info!(
            session_id = %self.id,
            exit_code = ?code,
            output_bytes,
            evicted_bytes,
            "Session ended"
        );
    }

    /// Forwards process output until the process is gone, then releases
    /// the terminal.
    ///
    /// Exit is detected by whichever comes first: end of output or the
    /// child being reaped. Processes the child left behind in its terminal
    /// session are killed so the output stream ends. Returns the exit code.
    /// The caller finishes with [`Session::on_process_exit`].
    pub async fn pump_output(&self, mut output: PtyOutput) -> Option<i32> {
        let code = loop {
            tokio::select! {
                biased;
                chunk = output.next() => match chunk {
                    Some(chunk) => self.on_process_output(chunk),
                    None => {
                        tracing::debug!(session_id = %self.id, "Process output ended");
                        break self.process.wait_exit(self.limits.terminate_grace).await;
                    }
                },
                code = self.process.exited() => {
                    tracing::debug!(session_id = %self.id, exit_code = ?code, "Process reaped");
                    if !self.drain_output(&mut output, DRAIN_TIMEOUT).await {
                        tracing::info!(
                            session_id = %self.id,
                            "Killing processes left in the terminal session"
                        );
                        self.process.terminate(Signal::SIGKILL);
                        if !self.drain_output(&mut output, KILL_WAIT).await {
                            tracing::error!(session_id = %self.id, "Terminal still open after SIGKILL");
                        }
                    }
                    break code;
                }
            }
        };

        self.process.close();
        code
    }

    /// Forwards remaining output. Returns false if the stream is still open
    /// after `limit`.
    async fn drain_output(&self, output: &mut PtyOutput, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(deadline, output.next()).await {
                Ok(Some(chunk)) => self.on_process_output(chunk),
                Ok(None) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Terminates the session: SIGHUP, then SIGKILL after the grace period.
    ///
    /// Returns once the process has been observed dead.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        let started = {
            let mut inner = self.lock();
            match inner.state {
                SessionState::Dead => return Err(SessionError::AlreadyTerminated(self.id.clone())),
                SessionState::Terminating => false,
                _ => {
                    inner.state = SessionState::Terminating;
                    inner.input = None;
                    inner.evict(DetachReason::Terminated);
                    true
                }
            }
        };

        if started {
            self.kill_process().await;
        } else {
            self.wait_dead().await;
        }
        Ok(())
    }

    /// Marks a detached session idle past `timeout` as terminating.
    ///
    /// Returns true if the caller must now call [`Session::kill_process`].
    /// Runs under the session lock so a racing attach sees the session gone.
    pub fn begin_idle_reap(&self, now: Instant, timeout: Duration) -> bool {
        let mut inner = self.lock();
        if !inner.is_idle(now, timeout) {
            return false;
        }
        inner.state = SessionState::Terminating;
        inner.input = None;
        true
    }

    /// Signals the process group and waits for the session to die.
    pub async fn kill_process(&self) {
        self.process.terminate(Signal::SIGHUP);
        if tokio::time::timeout(self.limits.terminate_grace, self.wait_dead())
            .await
            .is_ok()
        {
            return;
        }

        tracing::warn!(session_id = %self.id, "Session ignored SIGHUP, sending SIGKILL");
        self.process.terminate(Signal::SIGKILL);
        if tokio::time::timeout(KILL_WAIT, self.wait_dead()).await.is_err() {
            tracing::error!(session_id = %self.id, "Session did not die after SIGKILL");
        }
    }

    /// Resolves once the session is dead.
    pub async fn wait_dead(&self) {
        let mut rx = self.dead.subscribe();
        let _ = rx.wait_for(|dead| *dead).await;
    }

    pub fn summary(&self) -> SessionSummary {
        let inner = self.lock();
        SessionSummary {
            id: self.id.clone(),
            state: inner.state,
            rows: inner.rows,
            cols: inner.cols,
            pid: self.process.pid(),
            created_at: self
                .created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
            idle_secs: inner.last_activity.elapsed().as_secs(),
            attached: inner.attached.is_some(),
            exit_code: inner.exit_code,
            output_bytes: inner.ring.total_written(),
            evicted_bytes: inner.ring.evicted(),
        }
    }
}

fn spawn_writer(
    session_id: &str,
    process: Arc<PtyProcess>,
    mut input: mpsc::Receiver<Bytes>,
) -> Result<(), SessionError> {
    let session_id = session_id.to_string();
    std::thread::Builder::new()
        .name("pty-writer".to_string())
        .spawn(move || {
            while let Some(data) = input.blocking_recv() {
                if let Err(e) = process.write(&data) {
                    tracing::debug!(session_id = %session_id, error = %e, "PTY writer stopped");
                    break;
                }
            }
        })
        .map(|_| ())
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}
