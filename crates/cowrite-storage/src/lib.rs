//! cowrite Storage Backends
//!
//! The keyed store the sync engine persists documents into:
//! - Memory (default): fast, volatile storage
//! - SQLite: embedded persistence
//!
//! Stores know nothing about sessions or presence. They hold one
//! [`StoredDocument`] per document id and must make `put` atomic per id.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A persisted document record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDocument {
    pub content: String,
    pub revision: u64,
    #[serde(default)]
    pub owner: Option<String>,
    /// Unix millis of the last accepted edit
    pub updated_at: u64,
}

impl StoredDocument {
    pub fn new(content: impl Into<String>, revision: u64) -> Self {
        Self {
            content: content.into(),
            revision,
            owner: None,
            updated_at: 0,
        }
    }
}

/// Storage backend trait
#[async_trait]
pub trait Storage: Send + Sync {
    /// Load a document, `None` if it was never stored
    async fn get(&self, id: &str) -> Result<Option<StoredDocument>, StorageError>;

    /// Store a document, replacing any previous record for the id
    async fn put(&self, id: &str, doc: &StoredDocument) -> Result<(), StorageError>;

    /// Delete a document
    async fn delete(&self, id: &str) -> Result<bool, StorageError>;

    /// List stored document ids matching a pattern (`prefix*`, `*suffix`, exact)
    async fn list(&self, pattern: Option<&str>) -> Result<Vec<String>, StorageError>;

    /// Get storage statistics
    async fn stats(&self) -> Result<StorageStats, StorageError>;
}

/// Storage error types
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

/// Storage statistics
#[derive(Debug, Clone, Default)]
pub struct StorageStats {
    pub document_count: usize,
    pub total_size_bytes: usize,
}

/// Simple glob pattern matching shared by the backends
pub(crate) fn matches_pattern(key: &str, pattern: &str) -> bool {
    if pattern == "*" {
        return true;
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return key.starts_with(prefix);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return key.ends_with(suffix);
    }

    key == pattern
}

pub use memory::MemoryStorage;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStorage;
