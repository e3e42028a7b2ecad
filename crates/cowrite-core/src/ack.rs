//! Acknowledged submissions per document
//!
//! The ledger remembers the last acknowledged `clientSeq` of every client
//! instance that edited a document. It is owned by the session manager and
//! shared with each coordinator of that document, so a resend after the
//! session retired is still recognized as a duplicate.

use crate::document::DocumentId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Ledger shared between the manager and the resident coordinator
pub type SharedAcks = Arc<Mutex<AckLedger>>;

/// Identifies a client instance; the user is the authenticated one
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClientKey {
    user_id: String,
    client_id: String,
}

#[derive(Debug, Clone, Copy)]
struct AckEntry {
    seq: u64,
    revision: u64,
    touched: Instant,
}

/// Bounded table of the last acknowledged seq per client instance
#[derive(Debug)]
pub struct AckLedger {
    entries: HashMap<ClientKey, AckEntry>,
    capacity: usize,
    ttl: Duration,
}

impl AckLedger {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            capacity: capacity.max(1),
            ttl,
        }
    }

    pub fn shared(capacity: usize, ttl: Duration) -> SharedAcks {
        Arc::new(Mutex::new(Self::new(capacity, ttl)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Revision that acknowledged `seq` or a later one, if any
    pub fn acked(&mut self, user_id: &str, client_id: &str, seq: u64) -> Option<u64> {
        let key = ClientKey {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
        };
        let now = Instant::now();
        let entry = self.entries.get_mut(&key)?;
        if now.duration_since(entry.touched) >= self.ttl {
            self.entries.remove(&key);
            return None;
        }
        entry.touched = now;
        (seq <= entry.seq).then_some(entry.revision)
    }

    pub fn record(&mut self, user_id: &str, client_id: &str, seq: u64, revision: u64) {
        let key = ClientKey {
            user_id: user_id.to_string(),
            client_id: client_id.to_string(),
        };
        let touched = Instant::now();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.prune();
            if self.entries.len() >= self.capacity {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            AckEntry {
                seq,
                revision,
                touched,
            },
        );
    }

    /// Drop entries not used within the ttl; returns how many were dropped
    pub fn prune(&mut self) -> usize {
        let now = Instant::now();
        let ttl = self.ttl;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| now.duration_since(entry.touched) < ttl);
        before - self.entries.len()
    }

    fn evict_oldest(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, entry)| entry.touched)
            .map(|(key, _)| key.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }
}

/// Prune every ledger and drop the empty ones no coordinator holds
pub(crate) fn prune_ledgers(ledgers: &DashMap<DocumentId, SharedAcks>) -> usize {
    let mut dropped = 0;
    ledgers.retain(|_, ledger| {
        let mut guard = ledger.lock();
        dropped += guard.prune();
        !guard.is_empty() || Arc::strong_count(ledger) > 1
    });
    dropped
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    #[tokio::test(start_paused = true)]
    async fn test_seq_at_or_below_last_ack_is_stale() {
        let mut ledger = AckLedger::new(16, HOUR);
        assert_eq!(ledger.acked("alice", "tab-1", 1), None);

        ledger.record("alice", "tab-1", 2, 5);
        assert_eq!(ledger.acked("alice", "tab-1", 1), Some(5));
        assert_eq!(ledger.acked("alice", "tab-1", 2), Some(5));
        assert_eq!(ledger.acked("alice", "tab-1", 3), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_sharing_a_client_id_are_separate() {
        let mut ledger = AckLedger::new(16, HOUR);
        ledger.record("mallory", "tab-1", 1_000, 9);

        assert_eq!(ledger.acked("alice", "tab-1", 1), None);
        assert_eq!(ledger.acked("mallory", "tab-1", 1), Some(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_least_recently_used() {
        let mut ledger = AckLedger::new(2, HOUR);
        ledger.record("alice", "a", 1, 1);
        tokio::time::advance(Duration::from_secs(1)).await;
        ledger.record("bob", "b", 1, 2);
        tokio::time::advance(Duration::from_secs(1)).await;

        // Touching alice makes bob the oldest
        assert_eq!(ledger.acked("alice", "a", 1), Some(1));
        tokio::time::advance(Duration::from_secs(1)).await;
        ledger.record("carol", "c", 1, 3);

        assert_eq!(ledger.len(), 2);
        assert_eq!(ledger.acked("bob", "b", 1), None);
        assert_eq!(ledger.acked("alice", "a", 1), Some(1));
        assert_eq!(ledger.acked("carol", "c", 1), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_after_ttl() {
        let mut ledger = AckLedger::new(16, Duration::from_secs(60));
        ledger.record("alice", "a", 1, 1);
        ledger.record("bob", "b", 1, 2);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(ledger.acked("bob", "b", 1), Some(2));

        tokio::time::advance(Duration::from_secs(45)).await;
        assert_eq!(ledger.prune(), 1);
        assert_eq!(ledger.acked("alice", "a", 1), None);
        assert_eq!(ledger.acked("bob", "b", 1), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_prune_ledgers_keeps_held_ones() {
        let ledgers: DashMap<DocumentId, SharedAcks> = DashMap::new();
        let ttl = Duration::from_secs(60);
        let held = AckLedger::shared(16, ttl);
        ledgers.insert(DocumentId::new("held").unwrap(), held.clone());
        ledgers.insert(DocumentId::new("idle").unwrap(), AckLedger::shared(16, ttl));

        let stale = AckLedger::shared(16, ttl);
        stale.lock().record("alice", "a", 1, 1);
        ledgers.insert(DocumentId::new("stale").unwrap(), stale);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(prune_ledgers(&ledgers), 1);
        assert_eq!(ledgers.len(), 1);
        assert!(ledgers.contains_key(&DocumentId::new("held").unwrap()));
    }
}
