//! # webterm Protocol Library
//!
//! Wire definitions shared by the webterm daemon and its clients.
//!
//! ## Overview
//!
//! A browser talks to the daemon over a single websocket per terminal. Text
//! messages carry JSON frames tagged by `type`; binary messages from the
//! client are raw keystrokes.
//!
//! ```text
//! client → server   {"type":"attach","session_id":"new","rows":24,"cols":80}
//! server → client   {"type":"session","id":"…","rows":24,"cols":80}
//! client → server   {"type":"input","data":"ls\n"}
//! server → client   {"type":"output","data":"…"}
//! client → server   {"type":"resize","rows":40,"cols":120}
//! client → server   {"type":"detach"} | {"type":"terminate"}
//! ```
//!
//! ## Example Usage
//!
//! ```rust
//! use protocol::{ClientFrame, ServerFrame, Utf8StreamDecoder};
//!
//! let frame = ClientFrame::parse(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap();
//! assert_eq!(frame, ClientFrame::Resize { rows: 40, cols: 120 });
//!
//! let mut decoder = Utf8StreamDecoder::new();
//! let text = decoder.decode(b"hello\n");
//! let json = ServerFrame::output(text).to_json().unwrap();
//! assert!(json.contains("hello"));
//! ```
//!
//! ## Modules
//!
//! - [`messages`]: client and server frames, close codes
//! - [`utf8`]: chunk-boundary-safe output decoding
//! - [`error`]: Error types

pub mod error;
pub mod messages;
pub mod utf8;

pub use error::{ProtocolError, Result};
pub use messages::{
    close_code, AttachTarget, ClientFrame, ErrorCode, ServerFrame, MAX_DIMENSION,
    MAX_INPUT_BYTES, NEW_SESSION,
};
pub use utf8::Utf8StreamDecoder;
