//! Presence registry - who is connected to which document
//!
//! Purely in-memory. After a restart it is rebuilt from the connections that
//! come back.

use crate::config::PresenceConfig;
use crate::document::{now_millis, DocumentId};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tokio::sync::broadcast;
use tokio::time::Instant;
use uuid::Uuid;

/// Color tokens handed out to participants of a document
pub const PALETTE: [&str; 8] = [
    "#e06c75", "#61afef", "#98c379", "#c678dd", "#e5c07b", "#56b6c2", "#d19a66", "#be5046",
];

/// Identifies one live connection to one document
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionToken(Uuid);

impl ConnectionToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConnectionToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

/// One participant of a document session
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub connection: ConnectionToken,
    /// Unix millis
    pub joined_at: u64,
    /// Unix millis
    pub last_seen: u64,
    seen_at: Instant,
}

/// What changed in a document's presence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceChange {
    Joined(ConnectionToken),
    Left(ConnectionToken),
    Expired(Vec<ConnectionToken>),
}

/// Notification published on every membership change
#[derive(Debug, Clone)]
pub struct PresenceChanged {
    pub document_id: DocumentId,
    pub change: PresenceChange,
}

/// Presence registry
pub struct PresenceRegistry {
    config: PresenceConfig,
    /// Entries per document, in join order
    rooms: DashMap<DocumentId, Vec<PresenceEntry>>,
    /// Reverse index token -> document
    tokens: DashMap<ConnectionToken, DocumentId>,
    events: broadcast::Sender<PresenceChanged>,
}

impl PresenceRegistry {
    pub fn new(config: PresenceConfig) -> Self {
        let (events, _) = broadcast::channel(1024);

        Self {
            config,
            rooms: DashMap::new(),
            tokens: DashMap::new(),
            events,
        }
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    /// Subscribe to presence-changed notifications
    pub fn subscribe(&self) -> broadcast::Receiver<PresenceChanged> {
        self.events.subscribe()
    }

    /// Register a participant and hand back its connection token
    pub fn join(
        &self,
        document_id: &DocumentId,
        user_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> ConnectionToken {
        let token = ConnectionToken::new();
        let now = now_millis();

        {
            let mut room = self.rooms.entry(document_id.clone()).or_default();
            let color = pick_color(&room);
            room.push(PresenceEntry {
                user_id: user_id.into(),
                display_name: display_name.into(),
                color,
                connection: token,
                joined_at: now,
                last_seen: now,
                seen_at: Instant::now(),
            });
        }
        self.tokens.insert(token, document_id.clone());

        self.publish(document_id.clone(), PresenceChange::Joined(token));
        token
    }

    /// Remove a participant; returns the removed entry
    pub fn leave(&self, token: ConnectionToken) -> Option<PresenceEntry> {
        let (_, document_id) = self.tokens.remove(&token)?;

        let removed = {
            let mut room = self.rooms.get_mut(&document_id)?;
            let index = room.iter().position(|e| e.connection == token)?;
            room.remove(index)
        };
        self.rooms.remove_if(&document_id, |_, room| room.is_empty());

        self.publish(document_id, PresenceChange::Left(token));
        Some(removed)
    }

    /// Refresh a participant's liveness; false for unknown tokens
    pub fn heartbeat(&self, token: ConnectionToken) -> bool {
        let document_id = match self.tokens.get(&token) {
            Some(entry) => entry.value().clone(),
            None => return false,
        };

        let Some(mut room) = self.rooms.get_mut(&document_id) else {
            return false;
        };
        match room.iter_mut().find(|e| e.connection == token) {
            Some(entry) => {
                entry.seen_at = Instant::now();
                entry.last_seen = now_millis();
                true
            }
            None => false,
        }
    }

    /// Participants of a document, ascending join time
    pub fn list_active(&self, document_id: &DocumentId) -> Vec<PresenceEntry> {
        self.rooms
            .get(document_id)
            .map(|room| room.value().clone())
            .unwrap_or_default()
    }

    /// Look up one participant
    pub fn entry(&self, token: ConnectionToken) -> Option<PresenceEntry> {
        let document_id = self.tokens.get(&token)?.value().clone();
        let room = self.rooms.get(&document_id)?;
        room.iter().find(|e| e.connection == token).cloned()
    }

    /// Remove entries not seen within the liveness timeout
    pub fn sweep(&self) -> Vec<DocumentId> {
        self.sweep_at(Instant::now())
    }

    /// Remove entries whose last heartbeat is older than `now - timeout`.
    /// Returns the documents that lost participants; each gets exactly one
    /// notification.
    pub fn sweep_at(&self, now: Instant) -> Vec<DocumentId> {
        let timeout = self.config.liveness_timeout();
        let mut expired: Vec<(DocumentId, Vec<ConnectionToken>)> = Vec::new();

        for mut room in self.rooms.iter_mut() {
            let mut gone = Vec::new();
            room.value_mut().retain(|entry| {
                let alive = now.saturating_duration_since(entry.seen_at) <= timeout;
                if !alive {
                    gone.push(entry.connection);
                }
                alive
            });
            if !gone.is_empty() {
                expired.push((room.key().clone(), gone));
            }
        }

        let mut changed = Vec::with_capacity(expired.len());
        for (document_id, gone) in expired {
            for token in &gone {
                self.tokens.remove(token);
            }
            self.rooms.remove_if(&document_id, |_, room| room.is_empty());
            tracing::debug!(doc_id = %document_id, expired = gone.len(), "Presence entries expired");
            self.publish(document_id.clone(), PresenceChange::Expired(gone));
            changed.push(document_id);
        }
        changed
    }

    /// Number of live entries across all documents
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    fn publish(&self, document_id: DocumentId, change: PresenceChange) {
        // No receivers is fine; notifications are best-effort
        let _ = self.events.send(PresenceChanged {
            document_id,
            change,
        });
    }
}

impl Default for PresenceRegistry {
    fn default() -> Self {
        Self::new(PresenceConfig::default())
    }
}

/// First palette color not in use, otherwise a random one
fn pick_color(room: &[PresenceEntry]) -> String {
    let used: HashSet<&str> = room.iter().map(|e| e.color.as_str()).collect();

    match PALETTE.iter().find(|c| !used.contains(*c)) {
        Some(color) => color.to_string(),
        None => PALETTE[rand::thread_rng().gen_range(0..PALETTE.len())].to_string(),
    }
}
