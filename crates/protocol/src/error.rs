//! Error types for the protocol crate.

use thiserror::Error;

/// Protocol error type covering all possible failure modes at the wire boundary.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Failed to serialize a frame.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a frame.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The frame parsed but its content is not acceptable.
    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    /// Terminal dimensions outside the accepted range.
    #[error("invalid dimensions: {rows}x{cols} (rows x cols must be within 1..={max})")]
    InvalidDimensions {
        /// Requested rows.
        rows: u16,
        /// Requested columns.
        cols: u16,
        /// Maximum accepted value for either dimension.
        max: u16,
    },

    /// An input frame exceeded the per-frame limit.
    #[error("input too large: {size} bytes exceeds maximum of {max} bytes")]
    InputTooLarge {
        /// Actual input size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}
