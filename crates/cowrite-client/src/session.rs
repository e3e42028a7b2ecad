//! Client sync session
//!
//! One background task per document, driven through [`SyncHandle`]. The task
//! walks an explicit state machine:
//!
//! ```text
//! Disconnected -> Connecting -> Syncing -> Live
//!                     ^                     |
//!                     +---- transport lost -+
//! ```
//!
//! It only returns to `Disconnected` when closed or when the server refuses
//! the credential.

use crate::backoff::Backoff;
use crate::config::{DeliveryPolicy, SyncConfig};
use crate::connector::{ConnectRequest, Connection, Connector};
use crate::error::{Result, SyncError};
use cowrite_protocol::{ClientMessage, PresenceUser, ServerMessage};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Used when neither the config nor the server name an interval
const DEFAULT_HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Syncing,
    Live,
}

/// What the user should see
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalView {
    /// Last revision confirmed by the server
    pub revision: u64,
    /// Content including unacknowledged local edits
    pub content: String,
    /// Number of unacknowledged local edits
    pub pending: usize,
}

/// Everything observable about a sync session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    StateChanged(ConnectionState),
    Attached {
        revision: u64,
        connection_token: String,
        color: String,
    },
    /// Another user's edit was applied to the view
    Remote {
        revision: u64,
        content: String,
        from_user: String,
        overwrite: bool,
    },
    Acked {
        client_seq: u64,
        revision: u64,
    },
    /// A remote edit replaced unacknowledged local content
    Overwritten {
        revision: u64,
        from_user: String,
    },
    Rejected {
        client_seq: u64,
        code: String,
        message: String,
    },
    Presence(Vec<PresenceUser>),
    SaveStatus {
        persisted_revision: Option<u64>,
        pending: bool,
    },
    /// Unacknowledged edits dropped in favour of the server snapshot
    Discarded {
        count: usize,
    },
    Closed {
        reason: String,
    },
}

enum Command {
    Edit(String),
    Close(oneshot::Sender<()>),
}

/// Cloneable front of a sync session
#[derive(Clone)]
pub struct SyncHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    view: watch::Receiver<LocalView>,
    client_id: String,
}

impl SyncHandle {
    /// Replace the document content locally and send it when live
    pub fn edit(&self, content: impl Into<String>) -> Result<()> {
        self.commands
            .send(Command::Edit(content.into()))
            .map_err(|_| SyncError::Closed)
    }

    /// Stop the session; pending timers are cancelled, sent edits stand
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Close(reply)).is_ok() {
            let _ = rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn view(&self) -> LocalView {
        self.view.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<LocalView> {
        self.view.clone()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }
}

/// Start a sync session; must be called inside a tokio runtime
pub fn spawn(
    connector: Arc<dyn Connector>,
    config: SyncConfig,
) -> (SyncHandle, mpsc::UnboundedReceiver<SyncEvent>) {
    let (commands_tx, commands) = mpsc::unbounded_channel();
    let (events, events_rx) = mpsc::unbounded_channel();
    let (state, state_rx) = watch::channel(ConnectionState::Disconnected);
    let (view, view_rx) = watch::channel(LocalView::default());

    let handle = SyncHandle {
        commands: commands_tx,
        state: state_rx,
        view: view_rx,
        client_id: config.client_id.clone(),
    };

    let driver = Driver {
        request: ConnectRequest {
            document_id: config.document_id.clone(),
            token: config.token.clone(),
            client_id: config.client_id.clone(),
        },
        backoff: Backoff::new(config.backoff_base, config.backoff_cap),
        connector,
        config,
        commands,
        events,
        state,
        view,
        next_seq: 1,
        revision: 0,
        content: String::new(),
        confirmed: String::new(),
        pending: VecDeque::new(),
    };
    tokio::spawn(driver.run());

    (handle, events_rx)
}

/// A local edit not yet acknowledged
struct PendingEdit {
    seq: u64,
    base_revision: u64,
    content: String,
}

impl PendingEdit {
    fn message(&self) -> ClientMessage {
        ClientMessage::Edit {
            base_revision: self.base_revision,
            content: self.content.clone(),
            client_seq: self.seq,
        }
    }
}

enum Step<T> {
    Done(T),
    Close(Option<oneshot::Sender<()>>),
}

enum End {
    Close(Option<oneshot::Sender<()>>),
    Lost(String),
}

struct Driver {
    connector: Arc<dyn Connector>,
    config: SyncConfig,
    request: ConnectRequest,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<SyncEvent>,
    state: watch::Sender<ConnectionState>,
    view: watch::Sender<LocalView>,
    backoff: Backoff,
    /// Survives reconnects; the server deduplicates on it
    next_seq: u64,
    revision: u64,
    content: String,
    /// Server content at `revision`
    confirmed: String,
    pending: VecDeque<PendingEdit>,
}

impl Driver {
    async fn run(mut self) {
        loop {
            self.set_state(ConnectionState::Connecting);

            let connector = self.connector.clone();
            let request = self.request.clone();
            let connected = match self
                .until_close(async move { connector.connect(&request).await })
                .await
            {
                Step::Done(result) => result,
                Step::Close(reply) => return self.finish(reply, "closed by client".into()),
            };

            let failure = match connected {
                Ok(conn) => match self.attached(conn).await {
                    End::Close(reply) => return self.finish(reply, "closed by client".into()),
                    End::Lost(reason) => reason,
                },
                Err(SyncError::Auth(reason)) => {
                    warn!(doc_id = %self.request.document_id, reason = %reason, "Authentication refused");
                    return self.finish(None, format!("authentication failed: {}", reason));
                }
                Err(e) => e.to_string(),
            };

            let delay = self.backoff.next_delay();
            info!(
                doc_id = %self.request.document_id,
                attempt = self.backoff.attempt(),
                delay_ms = delay.as_millis() as u64,
                reason = %failure,
                "Connection lost, reconnecting"
            );
            if let Step::Close(reply) = self.until_close(tokio::time::sleep(delay)).await {
                return self.finish(reply, "closed by client".into());
            }
        }
    }

    /// Drive `fut` while recording local edits; stops early on close
    async fn until_close<F: Future>(&mut self, fut: F) -> Step<F::Output> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Edit(content)) => {
                        self.record_edit(content);
                    }
                    Some(Command::Close(reply)) => return Step::Close(Some(reply)),
                    None => return Step::Close(None),
                },
                out = &mut fut => return Step::Done(out),
            }
        }
    }

    /// Syncing and Live over one connection
    async fn attached(&mut self, mut conn: Box<dyn Connection>) -> End {
        self.set_state(ConnectionState::Syncing);

        let attach_timeout = self.config.attach_timeout;
        let first = match self
            .until_close(tokio::time::timeout(attach_timeout, conn.recv()))
            .await
        {
            Step::Close(reply) => {
                conn.close().await;
                return End::Close(reply);
            }
            Step::Done(Err(_)) => return End::Lost("attach timed out".into()),
            Step::Done(Ok(Err(e))) => return End::Lost(e.to_string()),
            Step::Done(Ok(Ok(None))) => return End::Lost("server closed during attach".into()),
            Step::Done(Ok(Ok(Some(message)))) => message,
        };

        let (revision, content, connection_token, color, advertised) = match first {
            ServerMessage::AttachAck {
                revision,
                content,
                connection_token,
                color,
                heartbeat_interval_ms,
            } => (revision, content, connection_token, color, heartbeat_interval_ms),
            other => {
                conn.close().await;
                return End::Lost(format!("expected attach_ack, got {}", other.kind()));
            }
        };

        self.revision = revision;
        self.content = content.clone();
        self.confirmed = content;

        match self.config.delivery {
            DeliveryPolicy::AtMostOnce => {
                let count = self.pending.len();
                self.pending.clear();
                if count > 0 {
                    info!(doc_id = %self.request.document_id, count, "Discarding unacknowledged edits");
                    self.emit(SyncEvent::Discarded { count });
                }
            }
            DeliveryPolicy::AtLeastOnce => {
                let resend: Vec<ClientMessage> =
                    self.pending.iter().map(PendingEdit::message).collect();
                for message in &resend {
                    if let Err(e) = conn.send(message).await {
                        return End::Lost(e.to_string());
                    }
                }
                if let Some(last) = self.pending.back() {
                    self.content = last.content.clone();
                }
                if !resend.is_empty() {
                    debug!(doc_id = %self.request.document_id, count = resend.len(), "Resent unacknowledged edits");
                }
            }
        }

        self.backoff.reset();
        self.publish_view();
        self.set_state(ConnectionState::Live);
        self.emit(SyncEvent::Attached {
            revision,
            connection_token,
            color,
        });

        let period = self
            .config
            .heartbeat_interval
            .unwrap_or(Duration::from_millis(advertised));
        let period = if period.is_zero() { DEFAULT_HEARTBEAT } else { period };
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                message = conn.recv() => match message {
                    Ok(Some(message)) => self.on_message(message),
                    Ok(None) => return End::Lost("server closed the connection".into()),
                    Err(e) => return End::Lost(e.to_string()),
                },
                cmd = self.commands.recv() => match cmd {
                    Some(Command::Edit(content)) => {
                        let message = self.record_edit(content);
                        if let Err(e) = conn.send(&message).await {
                            return End::Lost(e.to_string());
                        }
                    }
                    Some(Command::Close(reply)) => {
                        conn.close().await;
                        return End::Close(Some(reply));
                    }
                    None => {
                        conn.close().await;
                        return End::Close(None);
                    }
                },
                _ = heartbeat.tick() => {
                    if let Err(e) = conn.send(&ClientMessage::Heartbeat).await {
                        return End::Lost(e.to_string());
                    }
                }
            }
        }
    }

    fn record_edit(&mut self, content: String) -> ClientMessage {
        let edit = PendingEdit {
            seq: self.next_seq,
            base_revision: self.revision,
            content,
        };
        self.next_seq += 1;
        self.content = edit.content.clone();

        let message = edit.message();
        self.pending.push_back(edit);
        self.publish_view();
        message
    }

    fn on_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::EditAck {
                revision,
                client_seq,
                content,
            } => self.on_ack(revision, client_seq, content),
            ServerMessage::Broadcast {
                revision,
                content,
                from_user,
                overwrite,
            } => self.on_broadcast(revision, content, from_user, overwrite),
            ServerMessage::Rejected {
                client_seq,
                code,
                message,
            } => {
                warn!(doc_id = %self.request.document_id, client_seq, code = %code, "Edit rejected");
                self.pending.retain(|edit| edit.seq != client_seq);
                if self.pending.is_empty() {
                    self.content = self.confirmed.clone();
                }
                self.publish_view();
                self.emit(SyncEvent::Rejected {
                    client_seq,
                    code,
                    message,
                });
            }
            ServerMessage::Presence { users } => self.emit(SyncEvent::Presence(users)),
            ServerMessage::SaveStatus {
                persisted_revision,
                pending,
            } => self.emit(SyncEvent::SaveStatus {
                persisted_revision,
                pending,
            }),
            ServerMessage::Heartbeat => {}
            ServerMessage::AttachAck { .. } => {
                debug!(doc_id = %self.request.document_id, "Ignoring attach_ack while live");
            }
        }
    }

    fn on_ack(&mut self, revision: u64, client_seq: u64, content: Option<String>) {
        let mut acked = None;
        while self
            .pending
            .front()
            .map_or(false, |edit| edit.seq <= client_seq)
        {
            if let Some(edit) = self.pending.pop_front() {
                if edit.seq == client_seq {
                    acked = Some(edit.content);
                }
            }
        }

        if revision > self.revision {
            self.revision = revision;
            if let Some(confirmed) = content.or(acked) {
                self.confirmed = confirmed;
            }
        }
        if self.pending.is_empty() {
            self.content = self.confirmed.clone();
        }

        self.publish_view();
        self.emit(SyncEvent::Acked {
            client_seq,
            revision,
        });
    }

    fn on_broadcast(&mut self, revision: u64, content: String, from_user: String, overwrite: bool) {
        if revision <= self.revision {
            debug!(revision, known = self.revision, "Ignoring stale broadcast");
            return;
        }

        self.revision = revision;
        self.confirmed = content.clone();
        self.content = content.clone();
        let displaced = !self.pending.is_empty();

        self.publish_view();
        self.emit(SyncEvent::Remote {
            revision,
            content,
            from_user: from_user.clone(),
            overwrite,
        });
        if displaced {
            self.emit(SyncEvent::Overwritten { revision, from_user });
        }
    }

    fn publish_view(&self) {
        self.view.send_replace(LocalView {
            revision: self.revision,
            content: self.content.clone(),
            pending: self.pending.len(),
        });
    }

    fn set_state(&self, state: ConnectionState) {
        if *self.state.borrow() == state {
            return;
        }
        self.state.send_replace(state);
        self.emit(SyncEvent::StateChanged(state));
    }

    fn emit(&self, event: SyncEvent) {
        // The application may not listen for events
        let _ = self.events.send(event);
    }

    fn finish(&mut self, reply: Option<oneshot::Sender<()>>, reason: String) {
        info!(doc_id = %self.request.document_id, reason = %reason, "Sync session closed");
        self.set_state(ConnectionState::Disconnected);
        self.emit(SyncEvent::Closed { reason });
        if let Some(reply) = reply {
            let _ = reply.send(());
        }
    }
}
