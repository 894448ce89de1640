//! Protocol error types.

use thiserror::Error;

/// Result alias for protocol parsing.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors raised while parsing or validating protocol messages.
///
/// None of these carry secret material; they are safe to log.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Wire message bytes are not a valid encoding
    #[error("malformed wire message: {0}")]
    MalformedWire(String),

    /// Signaling JSON is not a known message
    #[error("malformed signaling message: {0}")]
    MalformedSignal(String),

    /// A byte field was not valid base64
    #[error("invalid base64 in field {field}")]
    InvalidBase64 {
        /// Field that failed to decode
        field: &'static str,
    },

    /// A fixed-size field had the wrong length
    #[error("invalid length for {field}: expected {expected}, got {actual}")]
    InvalidLength {
        /// Field with the wrong length
        field: &'static str,
        /// Required length in bytes
        expected: usize,
        /// Length actually received
        actual: usize,
    },

    /// Encoded message exceeds the transport limit
    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge {
        /// Size of the rejected message
        size: usize,
        /// Maximum accepted size
        max: usize,
    },
}
