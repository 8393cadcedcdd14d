//! Protocol error types

use thiserror::Error;

/// Protocol-level errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// JSON encoding or decoding failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Frame length exceeds maximum allowed size
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// Encoded record contains a raw line terminator
    #[error("Record contains a raw newline")]
    EmbeddedNewline,

    /// Frame is not valid UTF-8
    #[error("Frame is not valid UTF-8")]
    InvalidUtf8,

    /// Unknown asset type alias on the wire
    #[error("Unknown asset type: {0}")]
    UnknownAssetType(String),

    /// I/O error during frame operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for protocol results
pub type Result<T> = std::result::Result<T, ProtocolError>;
