//! # webterm daemon
//!
//! Serves interactive shell sessions to browsers over websockets.
//!
//! A session owns one shell process running under a pseudo-terminal. It
//! outlives the websocket that created it: the connection can drop and a
//! later connection can attach to the same session, first receiving the
//! recent output from the session's ring buffer and then the live stream.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        axum Router                            │
//! │   /health  /auth/*      │  /ws  /api/sessions  /api/files     │
//! │      (public)           │        (auth_middleware)            │
//! ├──────────────────────────────────────────────────────────────┤
//! │   Multiplexer (one per websocket)    DirectoryBrowser          │
//! ├──────────────────────────────────────────────────────────────┤
//! │   SessionRegistry ── Session ── OutputRing + PtyProcess       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use daemon::Config;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load_default()?;
//!     config.apply_env_overrides();
//!     config.validate()?;
//!
//!     let shutdown = CancellationToken::new();
//!     daemon::server::serve(config, shutdown).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`auth`]: Token and cookie authentication
//! - [`session`]: PTY sessions, the registry and the per-connection multiplexer
//! - [`files`]: Read-only file browsing
//! - [`server`]: HTTP routes and the websocket endpoint

pub mod auth;
pub mod config;
pub mod files;
pub mod server;
pub mod session;

// Re-export protocol for convenience
pub use protocol;

pub use auth::{AuthGate, Principal};
pub use config::Config;
pub use files::{DirectoryBrowser, DirectoryEntry};
pub use server::{build_router, AppState};
pub use session::{
    Multiplexer, MuxOutcome, Session, SessionError, SessionId, SessionRegistry, SessionState,
};
