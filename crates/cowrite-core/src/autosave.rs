//! Autosave coordinator
//!
//! Persists confirmed document states on a debounce / max-latency policy.
//! The coordinator is a single task that owns a table keyed by document id;
//! each row holds at most one pending [`SaveTask`] and at most one write in
//! flight, so two writes for the same document never overlap.

use crate::config::AutosaveConfig;
use crate::document::DocumentId;
use crate::error::{Error, Result};
use cowrite_storage::{Storage, StoredDocument};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, error, info, warn};

/// Write attempts per document once shutdown has begun
const SHUTDOWN_ATTEMPTS: u32 = 3;

/// A document state waiting to be persisted
#[derive(Debug, Clone)]
pub struct SaveTask {
    pub document_id: DocumentId,
    pub revision: u64,
    pub stored: StoredDocument,
}

/// Persistence state of one document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SaveStatus {
    pub persisted_revision: Option<u64>,
    /// A newer state than `persisted_revision` is waiting or being written
    pub pending: bool,
    /// The last write attempt failed
    pub failing: bool,
}

/// Published after every write attempt
#[derive(Debug, Clone)]
pub struct SaveEvent {
    pub document_id: DocumentId,
    pub status: SaveStatus,
}

enum Command {
    Changed(SaveTask),
    Flush {
        document_id: DocumentId,
        reply: oneshot::Sender<Result<()>>,
    },
    Status {
        document_id: DocumentId,
        reply: oneshot::Sender<SaveStatus>,
    },
    Forget(DocumentId),
    Dirty {
        reply: oneshot::Sender<Vec<DocumentId>>,
    },
    Completed {
        document_id: DocumentId,
        task: SaveTask,
        result: std::result::Result<(), String>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cheap cloneable front of the autosave task
#[derive(Clone)]
pub struct AutosaveHandle {
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SaveEvent>,
}

impl AutosaveHandle {
    /// Spawn the coordinator task; must be called inside a tokio runtime
    pub fn spawn(storage: Arc<dyn Storage>, config: AutosaveConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(1024);

        let coordinator = AutosaveCoordinator {
            storage,
            config,
            slots: HashMap::new(),
            rx,
            tx: tx.clone(),
            events: events.clone(),
            shutdown: None,
        };
        tokio::spawn(coordinator.run());

        Self { tx, events }
    }

    /// Record a new confirmed state, superseding any pending one
    pub fn notify(&self, task: SaveTask) {
        if self.tx.send(Command::Changed(task)).is_err() {
            warn!("Autosave coordinator stopped; change not scheduled");
        }
    }

    /// Write anything pending for the document now and wait for the outcome
    pub async fn flush(&self, document_id: &DocumentId) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Flush {
                document_id: document_id.clone(),
                reply,
            })
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)?
    }

    /// Write every pending task now and wait for all of them
    pub async fn flush_all(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Dirty { reply })
            .map_err(|_| Error::ShuttingDown)?;
        let dirty = rx.await.map_err(|_| Error::ShuttingDown)?;

        let mut first_error = None;
        for document_id in dirty {
            if let Err(e) = self.flush(&document_id).await {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub async fn status(&self, document_id: &DocumentId) -> SaveStatus {
        let (reply, rx) = oneshot::channel();
        let sent = self.tx.send(Command::Status {
            document_id: document_id.clone(),
            reply,
        });
        if sent.is_err() {
            return SaveStatus::default();
        }
        rx.await.unwrap_or_default()
    }

    /// Drop the table row of a clean document
    pub fn forget(&self, document_id: &DocumentId) {
        let _ = self.tx.send(Command::Forget(document_id.clone()));
    }

    /// Flush every document, then stop the coordinator
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown { reply }).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SaveEvent> {
        self.events.subscribe()
    }
}

/// One row of the table
struct Slot {
    pending: Option<SaveTask>,
    in_flight: bool,
    persisted: Option<u64>,
    last_change: Instant,
    /// Last successful save, or the first change after the row went clean
    dirty_since: Instant,
    failures: u32,
    retry_at: Option<Instant>,
    waiters: Vec<oneshot::Sender<Result<()>>>,
}

impl Slot {
    fn new(now: Instant) -> Self {
        Self {
            pending: None,
            in_flight: false,
            persisted: None,
            last_change: now,
            dirty_since: now,
            failures: 0,
            retry_at: None,
            waiters: Vec::new(),
        }
    }

    fn is_clean(&self) -> bool {
        self.pending.is_none() && !self.in_flight
    }

    fn status(&self) -> SaveStatus {
        SaveStatus {
            persisted_revision: self.persisted,
            pending: !self.is_clean(),
            failing: self.failures > 0,
        }
    }

    /// When the pending task should be written, if it can be started
    fn deadline(&self, config: &AutosaveConfig) -> Option<Instant> {
        if self.pending.is_none() || self.in_flight {
            return None;
        }
        if !self.waiters.is_empty() {
            return Some(self.last_change.min(Instant::now()));
        }
        if let Some(retry_at) = self.retry_at {
            return Some(retry_at);
        }
        let debounced = self.last_change + config.debounce();
        let ceiling = self.dirty_since + config.max_latency();
        Some(debounced.min(ceiling))
    }
}

struct AutosaveCoordinator {
    storage: Arc<dyn Storage>,
    config: AutosaveConfig,
    slots: HashMap<DocumentId, Slot>,
    rx: mpsc::UnboundedReceiver<Command>,
    tx: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SaveEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl AutosaveCoordinator {
    async fn run(mut self) {
        loop {
            let next = self
                .slots
                .values()
                .filter_map(|slot| slot.deadline(&self.config))
                .min();

            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = sleep_until(next.unwrap_or_else(Instant::now)), if next.is_some() => {}
            }

            self.start_due_writes();

            if self.shutdown.is_some() && self.slots.values().all(Slot::is_clean) {
                break;
            }
        }

        if let Some(reply) = self.shutdown.take() {
            info!("Autosave coordinator flushed and stopped");
            let _ = reply.send(());
        }
    }

    fn handle(&mut self, cmd: Command) {
        let now = Instant::now();

        match cmd {
            Command::Changed(task) => {
                let slot = self
                    .slots
                    .entry(task.document_id.clone())
                    .or_insert_with(|| Slot::new(now));

                if slot.is_clean() {
                    slot.dirty_since = now;
                }
                if slot.persisted.map_or(false, |rev| rev >= task.revision) {
                    return;
                }
                if let Some(old) = &slot.pending {
                    if old.revision >= task.revision {
                        return;
                    }
                    debug!(doc_id = %task.document_id, superseded = old.revision, revision = task.revision, "Save task superseded");
                }
                slot.last_change = now;
                slot.pending = Some(task);
            }
            Command::Flush { document_id, reply } => match self.slots.get_mut(&document_id) {
                Some(slot) if !slot.is_clean() => slot.waiters.push(reply),
                _ => {
                    let _ = reply.send(Ok(()));
                }
            },
            Command::Status { document_id, reply } => {
                let status = self
                    .slots
                    .get(&document_id)
                    .map(Slot::status)
                    .unwrap_or_default();
                let _ = reply.send(status);
            }
            Command::Forget(document_id) => {
                if self.slots.get(&document_id).map_or(false, Slot::is_clean) {
                    self.slots.remove(&document_id);
                }
            }
            Command::Dirty { reply } => {
                let dirty = self
                    .slots
                    .iter()
                    .filter(|(_, slot)| !slot.is_clean())
                    .map(|(id, _)| id.clone())
                    .collect();
                let _ = reply.send(dirty);
            }
            Command::Completed {
                document_id,
                task,
                result,
            } => self.complete(document_id, task, result, now),
            Command::Shutdown { reply } => {
                for slot in self.slots.values_mut() {
                    slot.retry_at = None;
                }
                self.shutdown = Some(reply);
            }
        }
    }

    fn complete(
        &mut self,
        document_id: DocumentId,
        task: SaveTask,
        result: std::result::Result<(), String>,
        now: Instant,
    ) {
        let Some(slot) = self.slots.get_mut(&document_id) else {
            return;
        };
        slot.in_flight = false;

        match result {
            Ok(()) => {
                debug!(doc_id = %document_id, revision = task.revision, "Document persisted");
                slot.persisted = Some(slot.persisted.map_or(task.revision, |r| r.max(task.revision)));
                slot.failures = 0;
                slot.retry_at = None;
                slot.dirty_since = now;

                if slot.pending.is_none() {
                    for waiter in slot.waiters.drain(..) {
                        let _ = waiter.send(Ok(()));
                    }
                }
            }
            Err(message) => {
                slot.failures += 1;
                let delay = self.config.retry_delay(slot.failures);
                slot.retry_at = Some(now + delay);
                warn!(
                    doc_id = %document_id,
                    revision = task.revision,
                    attempt = slot.failures,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %message,
                    "Autosave failed, will retry"
                );

                // Keep the failed state unless something newer superseded it
                if slot.pending.is_none() {
                    slot.pending = Some(task);
                }
                if self.shutdown.is_some() && slot.failures >= SHUTDOWN_ATTEMPTS {
                    if let Some(lost) = slot.pending.take() {
                        error!(
                            doc_id = %document_id,
                            revision = lost.revision,
                            "Giving up on autosave during shutdown; latest revision not persisted"
                        );
                    }
                }
                for waiter in slot.waiters.drain(..) {
                    let _ = waiter.send(Err(Error::Persistence {
                        id: document_id.to_string(),
                        message: message.clone(),
                    }));
                }
            }
        }

        let _ = self.events.send(SaveEvent {
            document_id,
            status: slot.status(),
        });
    }

    fn start_due_writes(&mut self) {
        let now = Instant::now();
        let shutting_down = self.shutdown.is_some();

        for (document_id, slot) in self.slots.iter_mut() {
            let due = match slot.deadline(&self.config) {
                Some(deadline) => deadline <= now,
                None => false,
            };
            // While shutting down, anything not backing off is written right away
            let forced = shutting_down && slot.retry_at.is_none() && !slot.in_flight;
            if !due && !forced {
                continue;
            }
            let Some(task) = slot.pending.take() else {
                continue;
            };
            slot.in_flight = true;

            let storage = self.storage.clone();
            let tx = self.tx.clone();
            let document_id = document_id.clone();
            tokio::spawn(async move {
                let result = storage
                    .put(document_id.as_str(), &task.stored)
                    .await
                    .map_err(|e| e.to_string());
                let _ = tx.send(Command::Completed {
                    document_id,
                    task,
                    result,
                });
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_storage::MemoryStorage;
    use std::time::Duration;

    fn task(id: &DocumentId, revision: u64, content: &str) -> SaveTask {
        SaveTask {
            document_id: id.clone(),
            revision,
            stored: StoredDocument::new(content, revision),
        }
    }

    fn setup() -> (Arc<MemoryStorage>, AutosaveHandle, DocumentId) {
        let storage = Arc::new(MemoryStorage::new());
        let handle = AutosaveHandle::spawn(storage.clone(), AutosaveConfig::default());
        (storage, handle, DocumentId::new("doc1").unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_edits_in_one_window_save_once() {
        let (storage, autosave, id) = setup();

        for rev in 1..=10 {
            autosave.notify(task(&id, rev, &format!("edit {}", rev)));
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(storage.put_count(), 0);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert_eq!(storage.put_log(), vec![("doc1".to_string(), 10, "edit 10".to_string())]);

        let status = autosave.status(&id).await;
        assert_eq!(status.persisted_revision, Some(10));
        assert!(!status.pending);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_latency_bounds_continuous_editing() {
        let (storage, autosave, id) = setup();

        // A change every 500ms never leaves a 2s quiet window
        for rev in 1..=21 {
            autosave.notify(task(&id, rev, "typing"));
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        assert_eq!(storage.put_count(), 1);
        let (_, revision, _) = storage.put_log()[0].clone();
        assert!(revision >= 19);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_is_retried() {
        let (storage, autosave, id) = setup();
        storage.fail_next_puts(2);

        autosave.notify(task(&id, 1, "Hello"));
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(storage.put_count(), 0);
        let status = autosave.status(&id).await;
        assert!(status.pending);
        assert!(status.failing);

        // Retries after 500ms and then 1000ms
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(storage.put_log(), vec![("doc1".to_string(), 1, "Hello".to_string())]);
        let status = autosave.status(&id).await;
        assert_eq!(status.persisted_revision, Some(1));
        assert!(!status.failing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_writes_immediately_and_reports_failure() {
        let (storage, autosave, id) = setup();

        storage.set_failing(true);
        autosave.notify(task(&id, 1, "draft"));
        assert!(autosave.flush(&id).await.is_err());
        assert!(autosave.status(&id).await.pending);

        storage.set_failing(false);
        autosave.flush(&id).await.unwrap();
        assert_eq!(storage.put_count(), 1);
        assert!(!autosave.status(&id).await.pending);

        // Nothing pending: flushing is a no-op
        autosave.flush(&id).await.unwrap();
        assert_eq!(storage.put_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_change_supersedes_pending() {
        let (storage, autosave, id) = setup();

        autosave.notify(task(&id, 2, "second"));
        autosave.notify(task(&id, 1, "first"));
        autosave.flush(&id).await.unwrap();

        assert_eq!(storage.put_log(), vec![("doc1".to_string(), 2, "second".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_everything() {
        let (storage, autosave, id) = setup();
        let other = DocumentId::new("doc2").unwrap();

        autosave.notify(task(&id, 3, "a"));
        autosave.notify(task(&other, 7, "b"));
        autosave.shutdown().await;

        assert_eq!(storage.put_count(), 2);
        assert_eq!(storage.get("doc2").await.unwrap().unwrap().revision, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_all_keeps_coordinator_running() {
        let (storage, autosave, id) = setup();
        let other = DocumentId::new("doc2").unwrap();

        autosave.notify(task(&id, 1, "a"));
        autosave.notify(task(&other, 1, "b"));
        autosave.flush_all().await.unwrap();
        assert_eq!(storage.put_count(), 2);

        autosave.notify(task(&id, 2, "a2"));
        autosave.flush(&id).await.unwrap();
        assert_eq!(storage.get("doc1").await.unwrap().unwrap().content, "a2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_report_status() {
        let (_storage, autosave, id) = setup();
        let mut events = autosave.subscribe();

        autosave.notify(task(&id, 4, "x"));
        autosave.flush(&id).await.unwrap();

        let event = events.recv().await.unwrap();
        assert_eq!(event.document_id, id);
        assert_eq!(event.status.persisted_revision, Some(4));
        assert!(!event.status.pending);
    }
}
