//! Document types

use crate::error::{Error, Result};
use cowrite_storage::StoredDocument;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Maximum document size in bytes (16MB default)
pub const MAX_CONTENT_BYTES: usize = 16 * 1024 * 1024;

/// Document identifier - UTF-8 string, max 512 bytes
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    /// Create a new document ID, validating the format
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();

        if id.is_empty() {
            return Err(Error::InvalidDocumentId("Document ID cannot be empty".into()));
        }

        if id.len() > 512 {
            return Err(Error::InvalidDocumentId("Document ID exceeds 512 bytes".into()));
        }

        // Validate pattern: [a-zA-Z0-9:_-]+
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ':' || c == '_' || c == '-')
        {
            return Err(Error::InvalidDocumentId(
                "Document ID must match pattern [a-zA-Z0-9:_-]+".into(),
            ));
        }

        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for DocumentId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// An authoritative `(revision, content)` pair issued by a coordinator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: u64,
    pub content: String,
}

/// A client's proposed new content, computed against `base_revision`
#[derive(Debug, Clone)]
pub struct EditSubmission {
    pub document_id: DocumentId,
    pub user_id: String,
    /// Stable id of the submitting client instance; scopes `client_seq`
    pub client_id: String,
    pub base_revision: u64,
    pub content: String,
    pub client_seq: u64,
}

/// The authoritative state of one document
///
/// Only the owning session coordinator holds a `Document`; everyone else sees
/// snapshots.
#[derive(Debug, Clone)]
pub struct Document {
    id: DocumentId,
    content: String,
    revision: u64,
    updated_at: u64,
    owner: Option<String>,
}

impl Document {
    /// A brand new, empty document at revision 0
    pub fn new(id: DocumentId) -> Self {
        Self {
            id,
            content: String::new(),
            revision: 0,
            updated_at: now_millis(),
            owner: None,
        }
    }

    /// Rebuild a document from its stored record
    pub fn from_stored(id: DocumentId, stored: StoredDocument) -> Self {
        Self {
            id,
            content: stored.content,
            revision: stored.revision,
            updated_at: stored.updated_at,
            owner: stored.owner,
        }
    }

    pub fn to_stored(&self) -> StoredDocument {
        StoredDocument {
            content: self.content.clone(),
            revision: self.revision,
            owner: self.owner.clone(),
            updated_at: self.updated_at,
        }
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn updated_at(&self) -> u64 {
        self.updated_at
    }

    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref()
    }

    /// Record an owner if the document has none yet
    pub fn claim_owner(&mut self, user_id: &str) {
        if self.owner.is_none() {
            self.owner = Some(user_id.to_string());
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            content: self.content.clone(),
        }
    }

    /// Replace the content and advance the revision by exactly one
    pub(crate) fn apply(&mut self, content: String) -> u64 {
        self.content = content;
        self.revision += 1;
        self.updated_at = now_millis();
        self.revision
    }
}

/// Check that content is structurally acceptable
///
/// Rejects content larger than `limit` bytes and content carrying NUL
/// characters, which the storage backends cannot round-trip.
pub fn validate_content(content: &str, limit: usize) -> std::result::Result<(), String> {
    if content.len() > limit {
        return Err(format!(
            "content size exceeds limit: {} > {}",
            content.len(),
            limit
        ));
    }

    if content.contains('\0') {
        return Err("content contains NUL characters".into());
    }

    Ok(())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_id_valid() {
        assert!(DocumentId::new("doc1").is_ok());
        assert!(DocumentId::new("team:notes_2024-01").is_ok());
        assert!(DocumentId::new("6f1c2d3e-8a9b-4c5d-9e0f-112233445566").is_ok());
    }

    #[test]
    fn test_document_id_invalid() {
        assert!(DocumentId::new("").is_err());
        assert!(DocumentId::new("docs/1").is_err());
        assert!(DocumentId::new("a".repeat(513)).is_err());
    }

    #[test]
    fn test_apply_advances_revision_by_one() {
        let mut doc = Document::new(DocumentId::new("doc1").unwrap());
        assert_eq!(doc.revision(), 0);
        assert_eq!(doc.content(), "");

        assert_eq!(doc.apply("Hello".into()), 1);
        assert_eq!(doc.apply("Hello world".into()), 2);
        assert_eq!(doc.snapshot(), Snapshot { revision: 2, content: "Hello world".into() });
    }

    #[test]
    fn test_stored_roundtrip_keeps_owner() {
        let mut doc = Document::new(DocumentId::new("doc1").unwrap());
        doc.claim_owner("alice");
        doc.claim_owner("bob");
        doc.apply("text".into());

        let restored = Document::from_stored(doc.id().clone(), doc.to_stored());
        assert_eq!(restored.owner(), Some("alice"));
        assert_eq!(restored.revision(), 1);
        assert_eq!(restored.content(), "text");
    }

    #[test]
    fn test_validate_content() {
        assert!(validate_content("fine", 16).is_ok());
        assert!(validate_content("way too long for this", 8).is_err());
        assert!(validate_content("nul\0byte", 64).is_err());
    }
}
