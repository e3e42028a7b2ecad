//! cowrite Core - Session Coordination, Presence and Autosave
//!
//! This crate provides the server-side engine for cowrite:
//! - A single-writer session coordinator per actively edited document
//! - Presence tracking with heartbeat-based expiry
//! - Debounced, bounded-latency autosave to a pluggable storage backend

pub mod ack;
pub mod autosave;
pub mod config;
pub mod document;
pub mod error;
pub mod manager;
pub mod merge;
pub mod presence;
pub mod session;

pub use ack::{AckLedger, SharedAcks};
pub use autosave::{AutosaveHandle, SaveEvent, SaveStatus, SaveTask};
pub use config::{AutosaveConfig, EngineConfig, PresenceConfig, SessionConfig};
pub use document::{validate_content, Document, DocumentId, EditSubmission, Snapshot};
pub use error::{Error, Rejected, Result};
pub use manager::{Attachment, ManagerStats, SessionManager};
pub use merge::{LastAppliedWins, MergePolicy, MergeStrategy, SpliceMerge};
pub use presence::{ConnectionToken, PresenceChange, PresenceEntry, PresenceRegistry};
pub use session::{Applied, Outbox, Session, SessionEvent, SessionHandle};
