//! Session coordinator - the single writer of one document
//!
//! [`Session`] holds the sequencing state and is plain synchronous code. The
//! coordinator task wraps it, owns it exclusively and processes commands one
//! at a time, which is what makes revisions dense and broadcasts ordered.
//! [`SessionHandle`] is the cloneable front used by connections.

use crate::ack::{AckLedger, SharedAcks};
use crate::autosave::{AutosaveHandle, SaveStatus, SaveTask};
use crate::config::SessionConfig;
use crate::document::{validate_content, Document, DocumentId, EditSubmission, Snapshot};
use crate::error::{Error, Rejected, Result};
use crate::merge::{MergeInput, MergePolicy};
use crate::presence::{ConnectionToken, PresenceEntry, PresenceRegistry};
use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

/// Minimum time a fresh coordinator waits for its first attach
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// Pushed by a coordinator to one attached client
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Another client's accepted edit
    Broadcast {
        revision: u64,
        content: String,
        from_user: String,
        overwrite: bool,
    },
    /// Current participants, ascending join time
    Presence(Vec<PresenceEntry>),
    SaveStatus(SaveStatus),
}

/// Per-client delivery channel
pub type Outbox = mpsc::UnboundedSender<SessionEvent>;

/// An accepted submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Applied {
    pub revision: u64,
    /// Content at `revision`; differs from the submitted text after a merge
    pub content: String,
    /// A concurrent edit was overwritten
    pub overwrote: bool,
}

struct Attached {
    token: ConnectionToken,
    user_id: String,
    outbox: Outbox,
}

/// Sequencing state of one document
pub struct Session {
    document: Document,
    config: SessionConfig,
    policy: Arc<dyn MergePolicy>,
    presence: Arc<PresenceRegistry>,
    autosave: Option<AutosaveHandle>,
    /// Attached clients in attach order
    clients: Vec<Attached>,
    /// Last acknowledged seq per (user, client id); outlives this session
    acks: SharedAcks,
    /// Recent past states, oldest first
    history: VecDeque<Snapshot>,
}

impl Session {
    pub fn new(
        document: Document,
        config: SessionConfig,
        policy: Arc<dyn MergePolicy>,
        presence: Arc<PresenceRegistry>,
        autosave: Option<AutosaveHandle>,
    ) -> Self {
        let acks = AckLedger::shared(config.ack_capacity, config.ack_ttl());
        Self {
            document,
            config,
            policy,
            presence,
            autosave,
            clients: Vec::new(),
            acks,
            history: VecDeque::new(),
        }
    }

    /// Use a ledger kept by the caller across coordinators of this document
    pub fn with_acks(mut self, acks: SharedAcks) -> Self {
        self.acks = acks;
        self
    }

    pub fn id(&self) -> &DocumentId {
        self.document.id()
    }

    pub fn document(&self) -> &Document {
        &self.document
    }

    pub fn snapshot(&self) -> Snapshot {
        self.document.snapshot()
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Register a client; it receives every broadcast after the returned snapshot
    pub fn attach(&mut self, token: ConnectionToken, user_id: &str, outbox: Outbox) -> Snapshot {
        self.document.claim_owner(user_id);

        match self.clients.iter_mut().find(|c| c.token == token) {
            Some(existing) => existing.outbox = outbox,
            None => self.clients.push(Attached {
                token,
                user_id: user_id.to_string(),
                outbox,
            }),
        }
        debug!(doc_id = %self.id(), connection = %token, clients = self.clients.len(), "Client attached");

        self.push_presence();
        self.snapshot()
    }

    /// Sequence one submission
    pub fn submit(
        &mut self,
        token: ConnectionToken,
        submission: EditSubmission,
    ) -> std::result::Result<Applied, Rejected> {
        let from_user = match self.clients.iter().find(|c| c.token == token) {
            Some(client) => client.user_id.clone(),
            None => return Err(Rejected::NotAttached),
        };

        let acked = self
            .acks
            .lock()
            .acked(&from_user, &submission.client_id, submission.client_seq);
        if let Some(acked_revision) = acked {
            return Err(Rejected::StaleSubmission {
                client_seq: submission.client_seq,
                acked_revision,
            });
        }

        validate_content(&submission.content, self.config.max_content_bytes)
            .map_err(Rejected::MalformedContent)?;

        let current_revision = self.document.revision();
        let base = if submission.base_revision == current_revision {
            Some(self.document.content())
        } else {
            self.history
                .iter()
                .find(|s| s.revision == submission.base_revision)
                .map(|s| s.content.as_str())
        };
        let merged = self.policy.merge(MergeInput {
            base_revision: submission.base_revision,
            base,
            current_revision,
            current: self.document.content(),
            submitted: &submission.content,
        });

        let depth = self.policy.history_depth();
        if depth > 0 {
            self.history.push_back(self.document.snapshot());
            while self.history.len() > depth {
                self.history.pop_front();
            }
        }

        let revision = self.document.apply(merged.content.clone());
        self.acks
            .lock()
            .record(&from_user, &submission.client_id, submission.client_seq, revision);

        if merged.overwrote {
            info!(
                doc_id = %self.id(),
                revision,
                base_revision = submission.base_revision,
                user = %from_user,
                "Concurrent edit overwritten"
            );
        }

        if let Some(autosave) = &self.autosave {
            autosave.notify(SaveTask {
                document_id: self.id().clone(),
                revision,
                stored: self.document.to_stored(),
            });
        }

        let event = SessionEvent::Broadcast {
            revision,
            content: merged.content.clone(),
            from_user,
            overwrite: merged.overwrote,
        };
        self.send_all(Some(token), event);

        Ok(Applied {
            revision,
            content: merged.content,
            overwrote: merged.overwrote,
        })
    }

    /// Unregister a client; false if it was not attached
    pub fn detach(&mut self, token: ConnectionToken) -> bool {
        let Some(index) = self.clients.iter().position(|c| c.token == token) else {
            return false;
        };
        self.clients.remove(index);
        self.presence.leave(token);
        debug!(doc_id = %self.id(), connection = %token, clients = self.clients.len(), "Client detached");

        self.push_presence();
        true
    }

    /// Drop clients whose presence entry expired, then push presence
    pub fn presence_changed(&mut self) {
        let presence = &self.presence;
        let before = self.clients.len();
        self.clients.retain(|c| presence.entry(c.token).is_some());

        let dropped = before - self.clients.len();
        if dropped > 0 {
            debug!(doc_id = %self.id(), dropped, "Dropped clients with expired presence");
        }
        self.push_presence();
    }

    /// Send the current participant list to every client
    pub fn push_presence(&mut self) {
        let entries = self.presence.list_active(self.document.id());
        self.send_all(None, SessionEvent::Presence(entries));
    }

    pub fn push_save_status(&mut self, status: SaveStatus) {
        self.send_all(None, SessionEvent::SaveStatus(status));
    }

    /// Deliver to every client except `skip`, in attach order
    fn send_all(&mut self, skip: Option<ConnectionToken>, event: SessionEvent) {
        let mut gone = Vec::new();
        self.clients.retain(|client| {
            if Some(client.token) == skip {
                return true;
            }
            let alive = client.outbox.send(event.clone()).is_ok();
            if !alive {
                gone.push(client.token);
            }
            alive
        });

        if gone.is_empty() {
            return;
        }
        for token in gone {
            debug!(doc_id = %self.id(), connection = %token, "Dropping client with closed outbox");
            self.presence.leave(token);
        }
        self.push_presence();
    }
}

enum Command {
    Attach {
        token: ConnectionToken,
        user_id: String,
        outbox: Outbox,
        reply: oneshot::Sender<Result<Snapshot>>,
    },
    Submit {
        token: ConnectionToken,
        submission: EditSubmission,
        reply: oneshot::Sender<std::result::Result<Applied, Rejected>>,
    },
    Detach(ConnectionToken),
    PresenceChanged,
    SaveStatus(SaveStatus),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown(oneshot::Sender<()>),
}

/// Table of resident coordinators, shared with the session manager
pub(crate) type SessionTable = Arc<DashMap<DocumentId, SessionHandle>>;

/// Cloneable front of one coordinator task
#[derive(Clone)]
pub struct SessionHandle {
    id: DocumentId,
    generation: u64,
    tx: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("generation", &self.generation)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionHandle {
    /// Start the coordinator task for `session`
    pub(crate) fn spawn(session: Session, generation: u64, table: SessionTable) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = Self {
            id: session.id().clone(),
            generation,
            tx,
        };

        let coordinator = Coordinator {
            session,
            generation,
            table,
            rx,
        };
        tokio::spawn(coordinator.run());

        handle
    }

    pub fn id(&self) -> &DocumentId {
        &self.id
    }

    /// Distinguishes successive coordinators of the same document
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once the coordinator has retired or shut down
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn attach(
        &self,
        token: ConnectionToken,
        user_id: &str,
        outbox: Outbox,
    ) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Attach {
                token,
                user_id: user_id.to_string(),
                outbox,
                reply,
            })
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())?
    }

    pub async fn submit(
        &self,
        token: ConnectionToken,
        submission: EditSubmission,
    ) -> std::result::Result<Applied, Rejected> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Submit {
                token,
                submission,
                reply,
            })
            .map_err(|_| Rejected::SessionClosed)?;
        rx.await.map_err(|_| Rejected::SessionClosed)?
    }

    /// Returns false when the coordinator is already gone
    pub fn detach(&self, token: ConnectionToken) -> bool {
        self.tx.send(Command::Detach(token)).is_ok()
    }

    pub fn presence_changed(&self) {
        let _ = self.tx.send(Command::PresenceChanged);
    }

    pub fn save_status(&self, status: SaveStatus) {
        let _ = self.tx.send(Command::SaveStatus(status));
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Command::Snapshot(reply))
            .map_err(|_| self.closed())?;
        rx.await.map_err(|_| self.closed())
    }

    /// Flush and stop regardless of attached clients
    pub async fn shutdown(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    fn closed(&self) -> Error {
        Error::SessionClosed(self.id.to_string())
    }
}

struct Coordinator {
    session: Session,
    generation: u64,
    table: SessionTable,
    rx: mpsc::UnboundedReceiver<Command>,
}

impl Coordinator {
    async fn run(mut self) {
        let grace = self.session.config.idle_grace();
        let mut idle_deadline = Some(Instant::now() + grace.max(STARTUP_GRACE));

        loop {
            tokio::select! {
                biased;
                cmd = self.rx.recv() => match cmd {
                    Some(Command::Shutdown(reply)) => {
                        if let Err(e) = self.flush().await {
                            warn!(doc_id = %self.session.id(), error = %e, "Flush on shutdown failed");
                        }
                        self.close();
                        let _ = reply.send(());
                        return;
                    }
                    Some(cmd) => {
                        self.handle(cmd);
                        if self.session.client_count() > 0 {
                            idle_deadline = None;
                        } else if idle_deadline.is_none() {
                            idle_deadline = Some(Instant::now() + grace);
                        }
                    }
                    None => return,
                },
                _ = sleep_until(idle_deadline.unwrap_or_else(Instant::now)), if idle_deadline.is_some() => {
                    match self.flush().await {
                        Ok(()) => {
                            self.close();
                            return;
                        }
                        Err(e) => {
                            let retry = self.session.config.retire_retry();
                            warn!(
                                doc_id = %self.session.id(),
                                error = %e,
                                retry_in_ms = retry.as_millis() as u64,
                                "Retirement postponed, document not persisted"
                            );
                            idle_deadline = Some(Instant::now() + retry);
                        }
                    }
                }
            }
        }
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Attach {
                token,
                user_id,
                outbox,
                reply,
            } => {
                let snapshot = self.session.attach(token, &user_id, outbox);
                let _ = reply.send(Ok(snapshot));
            }
            Command::Submit {
                token,
                submission,
                reply,
            } => {
                let _ = reply.send(self.session.submit(token, submission));
            }
            Command::Detach(token) => {
                self.session.detach(token);
            }
            Command::PresenceChanged => self.session.presence_changed(),
            Command::SaveStatus(status) => self.session.push_save_status(status),
            Command::Snapshot(reply) => {
                let _ = reply.send(self.session.snapshot());
            }
            // Handled by the run loop
            Command::Shutdown(reply) => {
                let _ = reply.send(());
            }
        }
    }

    async fn flush(&self) -> Result<()> {
        match &self.session.autosave {
            Some(autosave) => autosave.flush(self.session.id()).await,
            None => Ok(()),
        }
    }

    /// Leave the table and answer whatever is still queued
    fn close(&mut self) {
        let id = self.session.id().clone();
        if let Some(autosave) = &self.session.autosave {
            autosave.forget(&id);
        }
        let generation = self.generation;
        self.table.remove_if(&id, |_, handle| handle.generation == generation);
        self.rx.close();

        while let Ok(cmd) = self.rx.try_recv() {
            match cmd {
                Command::Attach { reply, .. } => {
                    let _ = reply.send(Err(Error::SessionClosed(id.to_string())));
                }
                Command::Submit { reply, .. } => {
                    let _ = reply.send(Err(Rejected::SessionClosed));
                }
                Command::Snapshot(reply) => {
                    let _ = reply.send(self.session.snapshot());
                }
                Command::Shutdown(reply) => {
                    let _ = reply.send(());
                }
                Command::Detach(token) => {
                    self.session.presence.leave(token);
                }
                Command::PresenceChanged | Command::SaveStatus(_) => {}
            }
        }

        info!(
            doc_id = %id,
            revision = self.session.document.revision(),
            "Session retired"
        );
    }
}
