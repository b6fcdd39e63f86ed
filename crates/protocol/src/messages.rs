//! Websocket frame definitions for webterm.
//!
//! Every text message on the terminal websocket is one JSON object tagged by
//! its `type` field. Client frames are validated here, at the transport
//! boundary, so the session engine only ever sees well-formed requests.

use serde::{Deserialize, Serialize};

use crate::error::{ProtocolError, Result};

/// Largest terminal dimension accepted in either direction.
pub const MAX_DIMENSION: u16 = 1000;

/// Largest input payload accepted in a single frame.
pub const MAX_INPUT_BYTES: usize = 64 * 1024;

/// Session id value that explicitly requests a fresh session.
pub const NEW_SESSION: &str = "new";

/// Websocket close codes used by the server.
///
/// 4000-4999 is the range reserved for application use by RFC 6455.
pub mod close_code {
    /// Client detached cleanly.
    pub const NORMAL: u16 = 1000;
    /// The session's process exited.
    pub const PROCESS_EXITED: u16 = 4000;
    /// The session was terminated on request.
    pub const TERMINATED: u16 = 4001;
    /// A frame could not be parsed or validated.
    pub const INVALID_FRAME: u16 = 4400;
    /// The principal may not use the requested session.
    pub const NOT_AUTHORIZED: u16 = 4403;
    /// The requested session does not exist (expired, reaped, or never existed).
    pub const SESSION_NOT_FOUND: u16 = 4404;
    /// No initial attach frame arrived in time.
    pub const HANDSHAKE_TIMEOUT: u16 = 4408;
    /// Another connection holds the session and could not be displaced.
    pub const BIND_CONFLICT: u16 = 4409;
    /// This connection was displaced by a newer attach to the same session.
    pub const REPLACED: u16 = 4410;
    /// The connection could not keep up with the session's output.
    pub const OUTPUT_OVERFLOW: u16 = 4413;
    /// The server refuses to create more sessions.
    pub const LIMIT_REACHED: u16 = 4429;
    /// The session's process could not be spawned.
    pub const SPAWN_FAILED: u16 = 4500;
}

/// Frames sent from the browser to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Initial control frame: reattach to `session_id` or create a new session.
    Attach {
        /// Target session; absent or `"new"` creates a session.
        #[serde(default)]
        session_id: Option<String>,
        /// Initial rows for a new session (resize for an existing one).
        #[serde(default)]
        rows: Option<u16>,
        /// Initial columns for a new session (resize for an existing one).
        #[serde(default)]
        cols: Option<u16>,
    },
    /// Keystrokes for the process.
    Input {
        /// Raw input text, forwarded verbatim.
        data: String,
    },
    /// Terminal window size change.
    Resize {
        /// New rows.
        rows: u16,
        /// New columns.
        cols: u16,
    },
    /// Application-level keepalive.
    Ping,
    /// Leave the session running and close this connection.
    Detach,
    /// Terminate the session and its process.
    Terminate,
}

/// What an attach frame asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttachTarget {
    /// Create a new session.
    New,
    /// Reattach to the given session id.
    Existing(String),
}

impl ClientFrame {
    /// Parse and validate a text frame.
    pub fn parse(text: &str) -> Result<Self> {
        let frame: ClientFrame = serde_json::from_str(text)?;
        frame.validate()?;
        Ok(frame)
    }

    /// Check the frame's values against protocol limits.
    pub fn validate(&self) -> Result<()> {
        match self {
            ClientFrame::Resize { rows, cols } => check_dimensions(*rows, *cols),
            ClientFrame::Attach { rows, cols, .. } => match (rows, cols) {
                (Some(rows), Some(cols)) => check_dimensions(*rows, *cols),
                (None, None) => Ok(()),
                _ => Err(ProtocolError::InvalidFrame(
                    "rows and cols must be given together".to_string(),
                )),
            },
            ClientFrame::Input { data } if data.len() > MAX_INPUT_BYTES => {
                Err(ProtocolError::InputTooLarge {
                    size: data.len(),
                    max: MAX_INPUT_BYTES,
                })
            }
            _ => Ok(()),
        }
    }

    /// Interpret an attach frame's target. Returns `None` for other frames.
    pub fn attach_target(&self) -> Option<AttachTarget> {
        match self {
            ClientFrame::Attach { session_id, .. } => Some(match session_id.as_deref() {
                None | Some("") | Some(NEW_SESSION) => AttachTarget::New,
                Some(id) => AttachTarget::Existing(id.to_string()),
            }),
            _ => None,
        }
    }
}

fn check_dimensions(rows: u16, cols: u16) -> Result<()> {
    if rows == 0 || cols == 0 || rows > MAX_DIMENSION || cols > MAX_DIMENSION {
        return Err(ProtocolError::InvalidDimensions {
            rows,
            cols,
            max: MAX_DIMENSION,
        });
    }
    Ok(())
}

/// Machine-readable error category carried by `ServerFrame::Error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Frame could not be parsed or failed validation.
    InvalidFrame,
    /// The target session does not exist.
    SessionNotFound,
    /// The principal does not own the session.
    NotAuthorized,
    /// Process spawn failed.
    SpawnFailed,
    /// The session is held by another connection.
    BindConflict,
    /// Session limit reached.
    LimitReached,
    /// Input could not be delivered to the process.
    InputRejected,
    /// Unexpected server-side failure.
    Internal,
}

impl ErrorCode {
    /// Websocket close code used when this error ends a connection.
    pub fn close_code(self) -> u16 {
        match self {
            ErrorCode::InvalidFrame => close_code::INVALID_FRAME,
            ErrorCode::SessionNotFound => close_code::SESSION_NOT_FOUND,
            ErrorCode::NotAuthorized => close_code::NOT_AUTHORIZED,
            ErrorCode::SpawnFailed | ErrorCode::Internal => close_code::SPAWN_FAILED,
            ErrorCode::BindConflict => close_code::BIND_CONFLICT,
            ErrorCode::LimitReached => close_code::LIMIT_REACHED,
            ErrorCode::InputRejected => close_code::PROCESS_EXITED,
        }
    }
}

/// Frames sent from the server to the browser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Sent once on bind so the client can persist the id for reattachment.
    Session {
        /// Session identifier.
        id: String,
        /// Current rows.
        rows: u16,
        /// Current columns.
        cols: u16,
    },
    /// Process output (replayed scrollback first, then live).
    Output {
        /// Output text.
        data: String,
    },
    /// The process exited.
    Exit {
        /// Exit code, when the platform reported one.
        code: Option<i32>,
    },
    /// Informational status line.
    Status {
        /// Human-readable message.
        message: String,
    },
    /// A request failed.
    Error {
        /// Error category.
        code: ErrorCode,
        /// Human-readable message.
        message: String,
    },
    /// Reply to `ClientFrame::Ping`.
    Pong,
}

impl ServerFrame {
    /// Build an output frame.
    pub fn output(data: impl Into<String>) -> Self {
        ServerFrame::Output { data: data.into() }
    }

    /// Build an error frame.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerFrame::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the JSON text sent on the websocket.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Parse a server frame (used by clients and tests).
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
