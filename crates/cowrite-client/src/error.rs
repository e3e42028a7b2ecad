//! Client error types

use thiserror::Error;

/// Sync session errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or connection failure; retried with backoff
    #[error("Transport failure: {0}")]
    Transport(String),

    /// The server refused the credential; never retried
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sync session closed")]
    Closed,
}

impl From<cowrite_protocol::ProtocolError> for SyncError {
    fn from(e: cowrite_protocol::ProtocolError) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

/// Result type for client operations
pub type Result<T> = std::result::Result<T, SyncError>;
