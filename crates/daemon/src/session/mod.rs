//! Terminal session engine.
//!
//! Sessions are pty-backed processes that outlive the connections attached
//! to them. The registry owns them, the multiplexer connects one transport at
//! a time to one of them.

pub mod multiplexer;
pub mod pty;
pub mod registry;
pub mod scrollback;
pub mod terminal;

pub use multiplexer::{AttachPolicy, Inbound, MuxOutcome, Multiplexer};
pub use pty::{detect_shell, PtyOutput, PtyProcess, SessionError, SessionId, SpawnParams};
pub use registry::{RegistryConfig, SessionRegistry};
pub use scrollback::OutputRing;
pub use terminal::{
    Attachment, ConnectionId, DetachReason, Session, SessionLimits, SessionState, SessionSummary,
};
