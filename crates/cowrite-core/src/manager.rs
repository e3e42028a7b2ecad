//! Session Manager - owns the table of resident coordinators
//!
//! Routes attaches to the coordinator of a document, opening one from storage
//! when none is resident, and wires the presence registry and autosave
//! coordinator into the sessions.

use crate::ack::{self, AckLedger, SharedAcks};
use crate::autosave::{AutosaveHandle, SaveStatus};
use crate::config::EngineConfig;
use crate::document::{Document, DocumentId, Snapshot};
use crate::error::{Error, Result};
use crate::merge::MergePolicy;
use crate::presence::{ConnectionToken, PresenceChange, PresenceRegistry};
use crate::session::{Session, SessionEvent, SessionHandle, SessionTable};
use cowrite_storage::Storage;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Attempts before an attach racing with retirement gives up
const ATTACH_ATTEMPTS: usize = 3;

/// A client's membership in one document session
#[derive(Debug)]
pub struct Attachment {
    pub token: ConnectionToken,
    pub snapshot: Snapshot,
    pub color: String,
    pub session: SessionHandle,
    /// Broadcasts, presence and save status for this client, in order
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

/// Session manager handles all resident sessions
pub struct SessionManager {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    policy: Arc<dyn MergePolicy>,
    presence: Arc<PresenceRegistry>,
    autosave: AutosaveHandle,
    sessions: SessionTable,
    /// Ack ledgers by document, kept across coordinator generations
    acks: Arc<DashMap<DocumentId, SharedAcks>>,
    generation: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionManager {
    /// Create a manager; must be called inside a tokio runtime
    pub fn new(storage: Arc<dyn Storage>, config: EngineConfig) -> Self {
        let autosave = AutosaveHandle::spawn(storage.clone(), config.autosave.clone());
        let presence = Arc::new(PresenceRegistry::new(config.presence.clone()));

        Self {
            policy: config.session.merge.policy(),
            config,
            storage,
            presence,
            autosave,
            sessions: Arc::new(DashMap::new()),
            acks: Arc::new(DashMap::new()),
            generation: AtomicU64::new(0),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn autosave(&self) -> &AutosaveHandle {
        &self.autosave
    }

    /// Start the presence sweeper and the notification routers
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();

        let presence = self.presence.clone();
        let acks = self.acks.clone();
        let interval = self.config.presence.sweep_interval();
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                presence.sweep();
                let dropped = ack::prune_ledgers(&acks);
                if dropped > 0 {
                    debug!(dropped, "Pruned idle client acks");
                }
            }
        }));

        // Joins and leaves are pushed by the sessions themselves; only
        // expiries originate outside a coordinator.
        let sessions = self.sessions.clone();
        let mut presence_rx = self.presence.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match presence_rx.recv().await {
                    Ok(event) => {
                        if let PresenceChange::Expired(_) = event.change {
                            if let Some(session) = sessions.get(&event.document_id) {
                                session.presence_changed();
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(skipped = n, "Presence router lagged, refreshing all sessions");
                        for session in sessions.iter() {
                            session.presence_changed();
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        let sessions = self.sessions.clone();
        let mut save_rx = self.autosave.subscribe();
        tasks.push(tokio::spawn(async move {
            loop {
                match save_rx.recv().await {
                    Ok(event) => {
                        if let Some(session) = sessions.get(&event.document_id) {
                            session.save_status(event.status);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "Save status router lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));

        info!(
            sweep_interval_ms = interval.as_millis() as u64,
            merge = %self.config.session.merge,
            "Session manager started"
        );
    }

    /// The resident coordinator of a document, opening one if needed
    pub async fn open(&self, id: &DocumentId) -> Result<SessionHandle> {
        if let Some(existing) = self.sessions.get(id) {
            if !existing.is_closed() {
                return Ok(existing.clone());
            }
        }

        let stored = self
            .storage
            .get(id.as_str())
            .await
            .map_err(|source| Error::Load {
                id: id.to_string(),
                source,
            })?;
        let document = match stored {
            Some(stored) => Document::from_stored(id.clone(), stored),
            None => Document::new(id.clone()),
        };

        let handle = match self.sessions.entry(id.clone()) {
            Entry::Occupied(entry) if !entry.get().is_closed() => entry.get().clone(),
            Entry::Occupied(mut entry) => {
                let handle = self.spawn_session(document);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_session(document);
                entry.insert(handle.clone());
                handle
            }
        };
        Ok(handle)
    }

    fn spawn_session(&self, document: Document) -> SessionHandle {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            doc_id = %document.id(),
            revision = document.revision(),
            generation,
            "Opening session"
        );

        let acks = self
            .acks
            .entry(document.id().clone())
            .or_insert_with(|| {
                AckLedger::shared(self.config.session.ack_capacity, self.config.session.ack_ttl())
            })
            .value()
            .clone();

        let session = Session::new(
            document,
            self.config.session.clone(),
            self.policy.clone(),
            self.presence.clone(),
            Some(self.autosave.clone()),
        )
        .with_acks(acks);
        SessionHandle::spawn(session, generation, self.sessions.clone())
    }

    /// Join presence and attach to the document's coordinator
    pub async fn attach(
        &self,
        id: &DocumentId,
        user_id: &str,
        display_name: &str,
    ) -> Result<Attachment> {
        let token = self.presence.join(id, user_id, display_name);
        let color = self
            .presence
            .entry(token)
            .map(|entry| entry.color)
            .unwrap_or_default();

        for attempt in 1..=ATTACH_ATTEMPTS {
            let session = match self.open(id).await {
                Ok(session) => session,
                Err(e) => {
                    self.presence.leave(token);
                    return Err(e);
                }
            };

            let (outbox, events) = mpsc::unbounded_channel();
            match session.attach(token, user_id, outbox).await {
                Ok(snapshot) => {
                    return Ok(Attachment {
                        token,
                        snapshot,
                        color,
                        session,
                        events,
                    })
                }
                Err(Error::SessionClosed(_)) => {
                    debug!(doc_id = %id, attempt, "Session retired during attach, reopening");
                }
                Err(e) => {
                    self.presence.leave(token);
                    return Err(e);
                }
            }
        }

        self.presence.leave(token);
        Err(Error::SessionClosed(id.to_string()))
    }

    /// Detach a connection, clearing its presence even if the session is gone
    pub fn detach(&self, session: &SessionHandle, token: ConnectionToken) {
        if !session.detach(token) {
            self.presence.leave(token);
        }
    }

    /// Refresh a connection's liveness
    pub fn heartbeat(&self, token: ConnectionToken) -> bool {
        self.presence.heartbeat(token)
    }

    /// Current state of a document, resident or stored
    pub async fn snapshot(&self, id: &DocumentId) -> Result<Option<Snapshot>> {
        let resident = self.sessions.get(id).map(|s| s.value().clone());
        if let Some(session) = resident {
            if let Ok(snapshot) = session.snapshot().await {
                return Ok(Some(snapshot));
            }
        }

        let stored = self
            .storage
            .get(id.as_str())
            .await
            .map_err(|source| Error::Load {
                id: id.to_string(),
                source,
            })?;
        Ok(stored.map(|s| Snapshot {
            revision: s.revision,
            content: s.content,
        }))
    }

    pub async fn save_status(&self, id: &DocumentId) -> SaveStatus {
        self.autosave.status(id).await
    }

    /// Is a coordinator resident for the document
    pub fn is_resident(&self, id: &DocumentId) -> bool {
        self.sessions.get(id).map_or(false, |s| !s.is_closed())
    }

    /// Get statistics
    pub fn stats(&self) -> ManagerStats {
        ManagerStats {
            session_count: self.sessions.len(),
            connection_count: self.presence.len(),
        }
    }

    /// Flush and stop every session, then the autosave coordinator
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let sessions: Vec<SessionHandle> = self
            .sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        info!(sessions = sessions.len(), "Shutting down sessions");

        for session in sessions {
            session.shutdown().await;
        }
        self.autosave.shutdown().await;
    }
}

/// Manager statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerStats {
    pub session_count: usize,
    pub connection_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PresenceConfig;
    use crate::document::EditSubmission;
    use crate::error::Rejected;
    use cowrite_storage::{MemoryStorage, StoredDocument};
    use std::time::Duration;

    fn doc(id: &str) -> DocumentId {
        DocumentId::new(id).unwrap()
    }

    fn setup() -> (Arc<MemoryStorage>, SessionManager) {
        let storage = Arc::new(MemoryStorage::new());
        let manager = SessionManager::new(storage.clone(), EngineConfig::default());
        (storage, manager)
    }

    fn edit(id: &DocumentId, client: &str, base: u64, content: &str, seq: u64) -> EditSubmission {
        EditSubmission {
            document_id: id.clone(),
            user_id: client.to_string(),
            client_id: client.to_string(),
            base_revision: base,
            content: content.to_string(),
            client_seq: seq,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_reuses_resident_session() {
        let (_storage, manager) = setup();
        let id = doc("doc1");

        let first = manager.open(&id).await.unwrap();
        let second = manager.open(&id).await.unwrap();
        assert_eq!(first.generation(), second.generation());
        assert_eq!(manager.stats().session_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_loads_stored_document() {
        let (storage, manager) = setup();
        storage
            .put("doc1", &StoredDocument::new("stored text", 7))
            .await
            .unwrap();

        let attachment = manager.attach(&doc("doc1"), "alice", "Alice").await.unwrap();
        assert_eq!(attachment.snapshot.revision, 7);
        assert_eq!(attachment.snapshot.content, "stored text");
        assert!(!attachment.color.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_reaches_other_attached_client() {
        let (_storage, manager) = setup();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        let mut bob = manager.attach(&id, "bob", "Bob").await.unwrap();

        let applied = alice
            .session
            .submit(alice.token, edit(&id, "alice", 0, "Hello", 1))
            .await
            .unwrap();
        assert_eq!(applied.revision, 1);

        loop {
            match bob.events.recv().await.unwrap() {
                SessionEvent::Broadcast {
                    revision,
                    content,
                    from_user,
                    ..
                } => {
                    assert_eq!(revision, 1);
                    assert_eq!(content, "Hello");
                    assert_eq!(from_user, "alice");
                    break;
                }
                _ => continue,
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reattach_after_retirement_sees_persisted_state() {
        let (storage, manager) = setup();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        let first_generation = alice.session.generation();
        alice
            .session
            .submit(alice.token, edit(&id, "alice", 0, "Hello", 1))
            .await
            .unwrap();
        manager.detach(&alice.session, alice.token);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_resident(&id));
        assert_eq!(storage.get("doc1").await.unwrap().unwrap().revision, 1);
        assert!(manager.presence().is_empty());

        let again = manager.attach(&id, "alice", "Alice").await.unwrap();
        assert_ne!(again.session.generation(), first_generation);
        assert_eq!(again.snapshot.revision, 1);
        assert_eq!(again.snapshot.content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_after_retirement_is_still_a_duplicate() {
        let (storage, manager) = setup();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        let applied = alice
            .session
            .submit(alice.token, edit(&id, "alice", 0, "Hello", 1))
            .await
            .unwrap();
        assert_eq!(applied.revision, 1);
        manager.detach(&alice.session, alice.token);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.is_resident(&id));

        let again = manager.attach(&id, "alice", "Alice").await.unwrap();
        let retry = again
            .session
            .submit(again.token, edit(&id, "alice", 0, "Hello", 1))
            .await;
        assert_eq!(
            retry,
            Err(Rejected::StaleSubmission {
                client_seq: 1,
                acked_revision: 1
            })
        );

        let next = again
            .session
            .submit(again.token, edit(&id, "alice", 1, "Hello again", 2))
            .await
            .unwrap();
        assert_eq!(next.revision, 2);

        manager.shutdown().await;
        assert_eq!(storage.get("doc1").await.unwrap().unwrap().revision, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_users_sharing_a_client_id_do_not_collide() {
        let (_storage, manager) = setup();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        let mallory = manager.attach(&id, "mallory", "Mallory").await.unwrap();

        // Same client id as alice, far ahead in sequence
        mallory
            .session
            .submit(mallory.token, edit(&id, "alice", 0, "spam", 1_000))
            .await
            .unwrap();

        let applied = alice
            .session
            .submit(alice.token, edit(&id, "alice", 1, "Hello", 1))
            .await
            .unwrap();
        assert_eq!(applied.revision, 2);
        assert_eq!(applied.content, "Hello");
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_ack_ledgers_are_pruned() {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = EngineConfig::default();
        config.session = config
            .session
            .with_ack_limits(16, Duration::from_secs(60));
        let manager = SessionManager::new(storage, config);
        manager.start();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        alice
            .session
            .submit(alice.token, edit(&id, "alice", 0, "Hello", 1))
            .await
            .unwrap();
        manager.detach(&alice.session, alice.token);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(!manager.is_resident(&id));
        assert_eq!(manager.acks.len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert!(manager.acks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_connection_is_dropped_from_session() {
        let storage = Arc::new(MemoryStorage::new());
        let mut config = EngineConfig::default();
        config.presence = PresenceConfig::default()
            .with_liveness_timeout(Duration::from_secs(30))
            .with_sweep_interval(Duration::from_secs(5));
        let manager = SessionManager::new(storage, config);
        manager.start();
        let id = doc("doc1");

        let mut alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        let mut bob = manager.attach(&id, "bob", "Bob").await.unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(manager.heartbeat(bob.token));
        tokio::time::sleep(Duration::from_secs(16)).await;

        // Alice's outbox is closed once her entry expires
        while alice.events.recv().await.is_some() {}

        let mut last_presence = None;
        while let Ok(event) = bob.events.try_recv() {
            if let SessionEvent::Presence(entries) = event {
                last_presence = Some(entries);
            }
        }
        let entries = last_presence.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].user_id, "bob");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_pending_edits() {
        let (storage, manager) = setup();
        let id = doc("doc1");

        let alice = manager.attach(&id, "alice", "Alice").await.unwrap();
        alice
            .session
            .submit(alice.token, edit(&id, "alice", 0, "unsaved", 1))
            .await
            .unwrap();
        assert_eq!(storage.put_count(), 0);

        manager.shutdown().await;
        let stored = storage.get("doc1").await.unwrap().unwrap();
        assert_eq!(stored.content, "unsaved");
        assert_eq!(manager.stats().session_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_falls_back_to_storage() {
        let (storage, manager) = setup();
        storage
            .put("doc2", &StoredDocument::new("cold", 3))
            .await
            .unwrap();

        let snapshot = manager.snapshot(&doc("doc2")).await.unwrap().unwrap();
        assert_eq!(snapshot.revision, 3);
        assert!(manager.snapshot(&doc("missing")).await.unwrap().is_none());
    }
}
