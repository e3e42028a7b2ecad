//! Protocol error types

use thiserror::Error;

/// Protocol-specific errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Message too large: {size} > {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Missing message type")]
    MissingType,

    #[error("Invalid {kind} message: {message}")]
    InvalidMessage { kind: String, message: String },

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Result type for protocol operations
pub type ProtocolResult<T> = Result<T, ProtocolError>;
