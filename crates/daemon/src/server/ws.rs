//! Websocket endpoint: one terminal session per connection.
//!
//! The first client message must be an attach frame naming the session to
//! resume, or none for a fresh one. After the server answers with a
//! `session` frame the connection is handed to a [`Multiplexer`] until either
//! side ends, and the outcome decides the close code.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::Extension;
use futures_util::stream::SplitSink;
use futures_util::{future, SinkExt, Stream, StreamExt};
use protocol::{
    close_code, AttachTarget, ClientFrame, ErrorCode, ProtocolError, ServerFrame, MAX_INPUT_BYTES,
};
use thiserror::Error;
use uuid::Uuid;

use super::state::AppState;
use crate::auth::Principal;
use crate::session::{ConnectionId, Inbound, MuxOutcome, Multiplexer, SpawnParams};

type WsSink = SplitSink<WebSocket, Message>;

#[derive(Debug, Error)]
enum SendError {
    #[error(transparent)]
    Transport(#[from] axum::Error),
    #[error(transparent)]
    Encode(#[from] ProtocolError),
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Extension(principal): Extension<Principal>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, principal))
}

async fn handle_socket(socket: WebSocket, state: AppState, principal: Principal) {
    let connection_id = Uuid::new_v4();
    tracing::debug!(connection_id = %connection_id, principal = %principal, "Websocket connected");

    let (mut ws_tx, ws_rx) = socket.split();
    let mut inbound = Box::pin(inbound_stream(ws_rx));

    let Some((rows, cols, target)) = handshake(&state, &mut ws_tx, &mut inbound).await else {
        return;
    };

    let params = SpawnParams::shell(
        Some(state.config.session.default_shell.clone()),
        rows,
        cols,
    );
    let (reattach, session_id) = match target {
        AttachTarget::New => (false, None),
        AttachTarget::Existing(id) => (true, Some(id)),
    };

    let session = match state
        .registry
        .get_or_create(session_id.as_deref(), &principal, params)
    {
        Ok(session) => session,
        Err(e) => {
            tracing::info!(connection_id = %connection_id, error = %e, "Attach refused");
            reject(&mut ws_tx, e.error_code(), e.to_string()).await;
            return;
        }
    };

    if reattach {
        if let Err(e) = session.resize(rows, cols) {
            tracing::debug!(session_id = %session.id(), error = %e, "Resize on reattach failed");
        }
    }

    let mut mux = match Multiplexer::bind(
        session.clone(),
        connection_id,
        state.config.session.attach_policy,
    ) {
        Ok(mux) => mux,
        Err(e) => {
            tracing::info!(connection_id = %connection_id, error = %e, "Bind refused");
            reject(&mut ws_tx, e.error_code(), e.to_string()).await;
            return;
        }
    };

    let (rows, cols) = session.dimensions();
    let hello = ServerFrame::Session {
        id: session.id().clone(),
        rows,
        cols,
    };
    if send_frame(&mut ws_tx, &hello).await.is_err() {
        session.detach(connection_id);
        return;
    }

    let outcome = {
        let mut frames = (&mut ws_tx).with(|frame: ServerFrame| {
            future::ready(
                frame
                    .to_json()
                    .map(|json| Message::Text(json.into()))
                    .map_err(SendError::from),
            )
        });
        mux.run(&mut frames, &mut inbound).await
    };

    finish(&mut ws_tx, connection_id, outcome).await;
}

/// Waits for the attach frame. Returns requested dimensions and target.
async fn handshake<St>(
    state: &AppState,
    ws_tx: &mut WsSink,
    inbound: &mut St,
) -> Option<(u16, u16, AttachTarget)>
where
    St: Stream<Item = Result<Inbound, axum::Error>> + Unpin,
{
    let timeout = state.config.session.handshake_timeout();

    let frame = match tokio::time::timeout(timeout, inbound.next()).await {
        Err(_) => {
            close(ws_tx, close_code::HANDSHAKE_TIMEOUT, "attach timeout").await;
            return None;
        }
        Ok(None) | Ok(Some(Err(_))) => return None,
        Ok(Some(Ok(Inbound::Invalid(e)))) => {
            reject(ws_tx, ErrorCode::InvalidFrame, e.to_string()).await;
            return None;
        }
        Ok(Some(Ok(Inbound::Frame(frame)))) => frame,
        Ok(Some(Ok(Inbound::Input(_)))) => {
            reject(ws_tx, ErrorCode::InvalidFrame, "expected attach frame").await;
            return None;
        }
    };

    let ClientFrame::Attach { rows, cols, .. } = &frame else {
        reject(ws_tx, ErrorCode::InvalidFrame, "expected attach frame").await;
        return None;
    };

    let rows = rows.unwrap_or(state.config.session.default_rows);
    let cols = cols.unwrap_or(state.config.session.default_cols);
    let target = frame.attach_target()?;
    Some((rows, cols, target))
}

/// Maps websocket messages to multiplexer input. Ends at a close frame.
fn inbound_stream<St>(ws_rx: St) -> impl Stream<Item = Result<Inbound, axum::Error>>
where
    St: Stream<Item = Result<Message, axum::Error>>,
{
    ws_rx
        .take_while(|msg| future::ready(!matches!(msg, Ok(Message::Close(_)))))
        .filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Inbound::parse(text.as_str()))),
                Ok(Message::Binary(data)) if data.len() > MAX_INPUT_BYTES => {
                    Some(Ok(Inbound::Invalid(ProtocolError::InputTooLarge {
                        size: data.len(),
                        max: MAX_INPUT_BYTES,
                    })))
                }
                Ok(Message::Binary(data)) => Some(Ok(Inbound::Input(data))),
                Ok(_) => None,
                Err(e) => Some(Err(e)),
            })
        })
}

/// Sends the final status for `outcome` and closes with its code.
async fn finish(ws_tx: &mut WsSink, connection_id: ConnectionId, outcome: MuxOutcome) {
    let (code, status) = match outcome {
        MuxOutcome::ClientClosed | MuxOutcome::TransportError => return,
        MuxOutcome::Detached => (close_code::NORMAL, "detached"),
        MuxOutcome::Terminated => (close_code::TERMINATED, "session terminated"),
        MuxOutcome::Replaced => (close_code::REPLACED, "session attached elsewhere"),
        MuxOutcome::Overflow => (
            close_code::OUTPUT_OVERFLOW,
            "connection too slow; reattach to resume",
        ),
        MuxOutcome::ProcessExited(_) => (close_code::PROCESS_EXITED, "process exited"),
    };

    tracing::debug!(connection_id = %connection_id, code, "Closing websocket");
    if code != close_code::NORMAL {
        let frame = ServerFrame::Status {
            message: status.to_string(),
        };
        if send_frame(ws_tx, &frame).await.is_err() {
            return;
        }
    }
    close(ws_tx, code, status).await;
}

async fn reject(ws_tx: &mut WsSink, code: ErrorCode, message: impl Into<String>) {
    let message = message.into();
    if send_frame(ws_tx, &ServerFrame::error(code, message.clone()))
        .await
        .is_ok()
    {
        close(ws_tx, code.close_code(), &message).await;
    }
}

async fn send_frame(ws_tx: &mut WsSink, frame: &ServerFrame) -> Result<(), SendError> {
    let json = frame.to_json()?;
    ws_tx.send(Message::Text(json.into())).await?;
    Ok(())
}

async fn close(ws_tx: &mut WsSink, code: u16, reason: &str) {
    // Close reasons are limited to 123 bytes
    let reason: String = reason.chars().take(120).collect();
    let _ = ws_tx
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
