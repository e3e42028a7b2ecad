//! Error types for cowrite Core

use cowrite_storage::StorageError;
use thiserror::Error;

/// Core error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid document ID: {0}")]
    InvalidDocumentId(String),

    #[error("Session closed for document {0}")]
    SessionClosed(String),

    #[error("Failed to load document {id}: {source}")]
    Load {
        id: String,
        #[source]
        source: StorageError,
    },

    #[error("Persistence failure for document {id}: {message}")]
    Persistence { id: String, message: String },

    #[error("Engine is shutting down")]
    ShuttingDown,
}

/// Why a submission was not applied
///
/// Only `MalformedContent` is a failure the submitter should see. A
/// `StaleSubmission` is a retry of something already applied and is answered
/// with the earlier acknowledgement.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejected {
    #[error("Client sequence {client_seq} already acknowledged at revision {acked_revision}")]
    StaleSubmission { client_seq: u64, acked_revision: u64 },

    #[error("Malformed content: {0}")]
    MalformedContent(String),

    #[error("Connection is not attached to this session")]
    NotAttached,

    #[error("Session closed")]
    SessionClosed,
}

impl Rejected {
    /// Stable wire code for the rejection
    pub fn code(&self) -> &'static str {
        match self {
            Rejected::StaleSubmission { .. } => "STALE_SUBMISSION",
            Rejected::MalformedContent(_) => "MALFORMED_CONTENT",
            Rejected::NotAttached => "NOT_ATTACHED",
            Rejected::SessionClosed => "SESSION_CLOSED",
        }
    }
}

/// Result type alias for cowrite Core operations
pub type Result<T> = std::result::Result<T, Error>;
