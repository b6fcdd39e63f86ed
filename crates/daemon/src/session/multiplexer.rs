//! Per-connection stream multiplexer.
//!
//! A [`Multiplexer`] binds one transport to one [`Session`] and pumps both
//! directions until either side ends: process output flows out as
//! [`ServerFrame::Output`], client frames flow in as input, resizes and
//! control requests. The transport is any `Sink`/`Stream` pair, so the same
//! engine runs over a websocket or an in-memory channel.
//!
//! Backpressure: the session never waits for a connection. Output is queued
//! on the attachment channel up to the configured watermark; a connection
//! that falls further behind is evicted and can reattach to replay.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use protocol::{ClientFrame, ErrorCode, ProtocolError, ServerFrame, Utf8StreamDecoder};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use super::pty::SessionError;
use super::terminal::{Attachment, ConnectionId, DetachReason, Session};

/// What to do when a connection attaches to a session that is already held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttachPolicy {
    /// The newest connection wins; the previous one is told it was replaced.
    #[default]
    TakeOver,
    /// The attach fails with a bind conflict.
    Reject,
}

/// Multiplexer lifecycle, for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MuxState {
    Binding,
    Streaming,
    Closing,
    Closed,
}

/// Why a multiplexer stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxOutcome {
    /// The transport ended.
    ClientClosed,
    /// The client asked to detach.
    Detached,
    /// The client terminated the session.
    Terminated,
    /// Another connection took the session.
    Replaced,
    /// The connection could not keep up with output.
    Overflow,
    /// The process exited.
    ProcessExited(Option<i32>),
    /// Sending to or receiving from the transport failed.
    TransportError,
}

impl From<DetachReason> for MuxOutcome {
    fn from(reason: DetachReason) -> Self {
        match reason {
            DetachReason::Replaced => MuxOutcome::Replaced,
            DetachReason::Overflow => MuxOutcome::Overflow,
            DetachReason::Exited(code) => MuxOutcome::ProcessExited(code),
            DetachReason::Terminated => MuxOutcome::Terminated,
        }
    }
}

/// One message received from the transport.
#[derive(Debug)]
pub enum Inbound {
    /// A parsed control or input frame.
    Frame(ClientFrame),
    /// Raw keystrokes (binary websocket message).
    Input(Bytes),
    /// A text message that failed to parse or validate.
    Invalid(ProtocolError),
}

impl Inbound {
    /// Parses a text message.
    pub fn parse(text: &str) -> Self {
        match ClientFrame::parse(text) {
            Ok(frame) => Inbound::Frame(frame),
            Err(e) => Inbound::Invalid(e),
        }
    }
}

/// Result of an await that the session may interrupt.
enum Interrupted<T> {
    Done(T),
    Detached(MuxOutcome),
}

pub struct Multiplexer {
    session: Arc<Session>,
    attachment: Attachment,
    decoder: Utf8StreamDecoder,
    state: MuxState,
}

impl Multiplexer {
    /// Attaches `connection_id` to `session` under `policy`.
    pub fn bind(
        session: Arc<Session>,
        connection_id: ConnectionId,
        policy: AttachPolicy,
    ) -> Result<Self, SessionError> {
        tracing::debug!(
            session_id = %session.id(),
            connection_id = %connection_id,
            state = ?MuxState::Binding,
            "Binding connection"
        );

        let attachment = match session.attach(connection_id) {
            Ok(attachment) => attachment,
            Err(SessionError::AlreadyAttached(id)) => match policy {
                AttachPolicy::Reject => return Err(SessionError::BindConflict(id)),
                AttachPolicy::TakeOver => {
                    session.evict(DetachReason::Replaced);
                    session.attach(connection_id).map_err(|e| match e {
                        SessionError::AlreadyAttached(id) => SessionError::BindConflict(id),
                        other => other,
                    })?
                }
            },
            Err(e) => return Err(e),
        };

        Ok(Self {
            session,
            attachment,
            decoder: Utf8StreamDecoder::new(),
            state: MuxState::Binding,
        })
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.attachment.connection_id
    }

    /// Pumps both directions until one side ends.
    ///
    /// Never terminates the session unless the client asks for it.
    pub async fn run<Si, St, E>(&mut self, sink: &mut Si, stream: &mut St) -> MuxOutcome
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
        St: Stream<Item = Result<Inbound, E>> + Unpin,
        E: Display,
    {
        self.transition(MuxState::Streaming);
        let outcome = self.pump(sink, stream).await;
        self.transition(MuxState::Closing);

        // Id-checked: a no-op if we were evicted
        self.session.detach(self.attachment.connection_id);

        self.transition(MuxState::Closed);
        tracing::info!(
            session_id = %self.session.id(),
            connection_id = %self.attachment.connection_id,
            outcome = ?outcome,
            "Connection closed"
        );
        outcome
    }

    async fn pump<Si, St, E>(&mut self, sink: &mut Si, stream: &mut St) -> MuxOutcome
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
        St: Stream<Item = Result<Inbound, E>> + Unpin,
        E: Display,
    {
        loop {
            tokio::select! {
                reason = &mut self.attachment.detached => {
                    return self.finish_detached(reason, sink).await;
                }
                chunk = self.attachment.output.recv() => {
                    let Some(chunk) = chunk else {
                        // Session dropped the attachment; the reason is already queued
                        let reason = (&mut self.attachment.detached).await;
                        return self.finish_detached(reason, sink).await;
                    };
                    let text = self.decoder.decode(&chunk);
                    if text.is_empty() {
                        continue;
                    }
                    match self.guarded(sink.send(ServerFrame::output(text))).await {
                        Interrupted::Done(Ok(())) => {}
                        Interrupted::Done(Err(e)) => return self.transport_failed(e),
                        Interrupted::Detached(outcome) => return outcome,
                    }
                }
                inbound = stream.next() => {
                    let inbound = match inbound {
                        None => return MuxOutcome::ClientClosed,
                        Some(Err(e)) => return self.transport_failed(e),
                        Some(Ok(inbound)) => inbound,
                    };
                    if let Some(outcome) = self.handle_inbound(inbound, sink).await {
                        return outcome;
                    }
                }
            }
        }
    }

    async fn handle_inbound<Si>(&mut self, inbound: Inbound, sink: &mut Si) -> Option<MuxOutcome>
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
    {
        let reply = match inbound {
            Inbound::Input(data) => return self.feed(data).await,
            Inbound::Frame(ClientFrame::Input { data }) => return self.feed(Bytes::from(data)).await,
            Inbound::Frame(ClientFrame::Resize { rows, cols }) => {
                match self.session.resize(rows, cols) {
                    Ok(()) => None,
                    Err(e) => Some(ServerFrame::error(e.error_code(), e.to_string())),
                }
            }
            Inbound::Frame(ClientFrame::Ping) => Some(ServerFrame::Pong),
            Inbound::Frame(ClientFrame::Detach) => return Some(MuxOutcome::Detached),
            Inbound::Frame(ClientFrame::Terminate) => {
                tracing::info!(session_id = %self.session.id(), "Client requested terminate");
                if let Err(e) = self.session.terminate().await {
                    tracing::debug!(session_id = %self.session.id(), error = %e, "Terminate");
                }
                return Some(MuxOutcome::Terminated);
            }
            Inbound::Frame(ClientFrame::Attach { .. }) => Some(ServerFrame::error(
                ErrorCode::InvalidFrame,
                "connection is already attached",
            )),
            Inbound::Invalid(e) => {
                tracing::debug!(session_id = %self.session.id(), error = %e, "Invalid frame");
                Some(ServerFrame::error(ErrorCode::InvalidFrame, e.to_string()))
            }
        };

        let frame = reply?;
        match self.guarded(sink.send(frame)).await {
            Interrupted::Done(Ok(())) => None,
            Interrupted::Done(Err(e)) => Some(self.transport_failed(e)),
            Interrupted::Detached(outcome) => Some(outcome),
        }
    }

    async fn feed(&mut self, data: Bytes) -> Option<MuxOutcome> {
        let session = Arc::clone(&self.session);
        match self.guarded(session.feed_input(data)).await {
            Interrupted::Done(Ok(())) => None,
            Interrupted::Done(Err(e)) => {
                tracing::debug!(session_id = %session.id(), error = %e, "Input rejected");
                Some(MuxOutcome::ProcessExited(session.exit_code()))
            }
            Interrupted::Detached(outcome) => Some(outcome),
        }
    }

    /// Awaits `fut` unless the session detaches this connection first.
    async fn guarded<F: Future>(&mut self, fut: F) -> Interrupted<F::Output> {
        tokio::select! {
            out = fut => Interrupted::Done(out),
            reason = &mut self.attachment.detached => {
                Interrupted::Detached(match reason {
                    Ok(reason) => reason.into(),
                    Err(_) => MuxOutcome::ProcessExited(self.session.exit_code()),
                })
            }
        }
    }

    async fn finish_detached<Si>(
        &mut self,
        reason: Result<DetachReason, oneshot::error::RecvError>,
        sink: &mut Si,
    ) -> MuxOutcome
    where
        Si: Sink<ServerFrame> + Unpin,
        Si::Error: Display,
    {
        let outcome = match reason {
            Ok(reason) => MuxOutcome::from(reason),
            Err(_) => MuxOutcome::ProcessExited(self.session.exit_code()),
        };

        if let MuxOutcome::ProcessExited(code) = outcome {
            // Deliver what the process wrote before it exited
            let mut text = String::new();
            while let Ok(chunk) = self.attachment.output.try_recv() {
                text.push_str(&self.decoder.decode(&chunk));
            }
            text.push_str(&self.decoder.finish());
            if !text.is_empty() {
                if let Err(e) = sink.send(ServerFrame::output(text)).await {
                    return self.transport_failed(e);
                }
            }
            if let Err(e) = sink.send(ServerFrame::Exit { code }).await {
                return self.transport_failed(e);
            }
        }

        outcome
    }

    fn transport_failed(&self, error: impl Display) -> MuxOutcome {
        tracing::debug!(
            session_id = %self.session.id(),
            connection_id = %self.attachment.connection_id,
            error = %error,
            "Transport error"
        );
        MuxOutcome::TransportError
    }

    fn transition(&mut self, state: MuxState) {
        tracing::trace!(
            session_id = %self.session.id(),
            from = ?self.state,
            to = ?state,
            "Multiplexer state"
        );
        self.state = state;
    }
}
