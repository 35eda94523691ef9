//! Error types for the sync protocol.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol messages.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A message could not be encoded.
    #[error("encode error: {0}")]
    Encode(String),

    /// A message could not be decoded.
    #[error("decode error: {0}")]
    Decode(String),

    /// A frame header announced a body larger than allowed.
    #[error("frame too large: {len} bytes exceeds limit of {max}")]
    FrameTooLarge {
        /// Announced body length.
        len: usize,
        /// Maximum accepted body length.
        max: usize,
    },
}
