//! Connection handler - maps wire frames onto one attached session

use cowrite_core::{
    Applied, Attachment, ConnectionToken, DocumentId, EditSubmission, Rejected, SessionEvent,
    SessionHandle, SessionManager, Snapshot,
};
use cowrite_protocol::{
    decode_client_with_limit, recover_client_seq, ClientMessage, ProtocolError, ServerMessage,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[cfg(feature = "metrics")]
use crate::metrics::Metrics;

/// What the connection should do after a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Reply(ServerMessage),
    /// Nothing to send
    Ignore,
    /// Close the connection with a reason
    Close(String),
}

/// Handles a single attached client connection
pub struct ConnectionHandler {
    manager: Arc<SessionManager>,
    session: SessionHandle,
    token: ConnectionToken,
    document_id: DocumentId,
    user_id: String,
    /// Scope of the client's sequence numbers
    client_id: String,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<Metrics>>,
}

impl ConnectionHandler {
    /// Wrap an attachment; `client_id` defaults to the connection token
    pub fn new(
        manager: Arc<SessionManager>,
        attachment: &Attachment,
        document_id: DocumentId,
        user_id: impl Into<String>,
        client_id: Option<String>,
    ) -> Self {
        let token = attachment.token;
        Self {
            manager,
            session: attachment.session.clone(),
            token,
            document_id,
            user_id: user_id.into(),
            client_id: client_id.unwrap_or_else(|| token.to_string()),
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Record edit outcomes into `metrics`
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn token(&self) -> ConnectionToken {
        self.token
    }

    /// First frame of the connection
    pub fn attach_ack(&self, snapshot: &Snapshot, color: &str) -> ServerMessage {
        ServerMessage::AttachAck {
            revision: snapshot.revision,
            content: snapshot.content.clone(),
            connection_token: self.token.to_string(),
            color: color.to_string(),
            heartbeat_interval_ms: self.manager.config().presence.heartbeat_interval().as_millis()
                as u64,
        }
    }

    /// Process one text frame from the client
    pub async fn handle_frame(&mut self, frame: &str) -> Outcome {
        let max_content_bytes = self.manager.config().session.max_content_bytes;
        let message = match decode_client_with_limit(frame, max_content_bytes) {
            Ok(message) => message,
            Err(ProtocolError::MessageTooLarge { size, max }) => {
                return self.reject_oversize(frame, size, max);
            }
            Err(e) => {
                debug!(connection = %self.token, error = %e, "Ignoring malformed frame");
                return Outcome::Ignore;
            }
        };

        match message {
            ClientMessage::Edit {
                base_revision,
                content,
                client_seq,
            } => {
                self.manager.heartbeat(self.token);
                self.handle_edit(base_revision, content, client_seq).await
            }
            ClientMessage::Heartbeat => {
                if self.manager.heartbeat(self.token) {
                    Outcome::Reply(ServerMessage::Heartbeat)
                } else {
                    info!(connection = %self.token, doc_id = %self.document_id, "Heartbeat for expired connection");
                    Outcome::Close("presence expired".into())
                }
            }
        }
    }

    async fn handle_edit(&mut self, base_revision: u64, content: String, client_seq: u64) -> Outcome {
        let submission = EditSubmission {
            document_id: self.document_id.clone(),
            user_id: self.user_id.clone(),
            client_id: self.client_id.clone(),
            base_revision,
            content,
            client_seq,
        };
        let submitted_len = submission.content.len();
        let submitted = self
            .session_merges()
            .then(|| submission.content.clone());

        match self.session.submit(self.token, submission).await {
            Ok(Applied {
                revision,
                content,
                overwrote,
            }) => {
                self.record_edit(if overwrote { "overwrite" } else { "accepted" });
                debug!(
                    doc_id = %self.document_id,
                    revision,
                    client_seq,
                    bytes = submitted_len,
                    "Edit accepted"
                );
                let changed = submitted.map_or(false, |s| s != content);
                Outcome::Reply(ServerMessage::EditAck {
                    revision,
                    client_seq,
                    content: changed.then_some(content),
                })
            }
            Err(Rejected::StaleSubmission { acked_revision, .. }) => {
                self.record_edit("duplicate");
                debug!(doc_id = %self.document_id, client_seq, acked_revision, "Duplicate submission");
                Outcome::Reply(ServerMessage::EditAck {
                    revision: acked_revision,
                    client_seq,
                    content: None,
                })
            }
            Err(rejected @ Rejected::MalformedContent(_)) => {
                self.record_edit("malformed");
                warn!(doc_id = %self.document_id, client_seq, reason = %rejected, "Edit rejected");
                Outcome::Reply(ServerMessage::Rejected {
                    client_seq,
                    code: rejected.code().to_string(),
                    message: rejected.to_string(),
                })
            }
            Err(rejected) => Outcome::Close(rejected.to_string()),
        }
    }

    /// An edit too large to decode is still answered when its seq is readable
    fn reject_oversize(&self, frame: &str, size: usize, max: usize) -> Outcome {
        let Some(client_seq) = recover_client_seq(frame) else {
            debug!(connection = %self.token, size, max, "Ignoring oversize frame");
            return Outcome::Ignore;
        };
        self.record_edit("malformed");
        let rejected = Rejected::MalformedContent(format!(
            "frame of {} bytes exceeds the {} byte limit",
            size, max
        ));
        warn!(doc_id = %self.document_id, client_seq, size, "Oversize edit rejected");
        Outcome::Reply(ServerMessage::Rejected {
            client_seq,
            code: rejected.code().to_string(),
            message: rejected.to_string(),
        })
    }

    /// Only a merging policy can change what was submitted
    fn session_merges(&self) -> bool {
        self.manager.config().session.merge != cowrite_core::MergeStrategy::LastAppliedWins
    }

    /// Map a session event to its wire message
    pub fn event_message(&self, event: SessionEvent) -> ServerMessage {
        #[cfg(feature = "metrics")]
        if let (SessionEvent::Broadcast { .. }, Some(metrics)) = (&event, &self.metrics) {
            metrics.broadcasts_sent.inc();
        }
        ServerMessage::from(event)
    }

    /// Leave the session
    pub fn close(self) {
        self.manager.detach(&self.session, self.token);
    }

    fn record_edit(&self, outcome: &'static str) {
        #[cfg(feature = "metrics")]
        if let Some(metrics) = &self.metrics {
            metrics.record_edit(outcome);
        }
        #[cfg(not(feature = "metrics"))]
        let _ = outcome;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::EngineConfig;
    use cowrite_storage::MemoryStorage;
    use std::time::Duration;

    async fn connect(
        manager: &Arc<SessionManager>,
        user: &str,
    ) -> (ConnectionHandler, Attachment) {
        let id = DocumentId::new("doc1").unwrap();
        let attachment = manager.attach(&id, user, user).await.unwrap();
        let handler = ConnectionHandler::new(
            manager.clone(),
            &attachment,
            id,
            user,
            Some(format!("{}-client", user)),
        );
        (handler, attachment)
    }

    fn manager() -> Arc<SessionManager> {
        manager_with(EngineConfig::default())
    }

    fn manager_with(config: EngineConfig) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(Arc::new(MemoryStorage::new()), config))
    }

    fn encoded_edit(base: u64, content: String, seq: u64) -> String {
        cowrite_protocol::encode(&ClientMessage::Edit {
            base_revision: base,
            content,
            client_seq: seq,
        })
        .unwrap()
    }

    fn rejected_code(outcome: Outcome) -> (u64, String) {
        match outcome {
            Outcome::Reply(ServerMessage::Rejected { client_seq, code, .. }) => (client_seq, code),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    fn edit(base: u64, content: &str, seq: u64) -> String {
        format!(
            r#"{{"type":"edit","baseRevision":{},"content":"{}","clientSeq":{}}}"#,
            base, content, seq
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_is_acked() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let outcome = handler.handle_frame(&edit(0, "Hello", 1)).await;
        assert_eq!(
            outcome,
            Outcome::Reply(ServerMessage::EditAck {
                revision: 1,
                client_seq: 1,
                content: None
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_edit_gets_same_ack() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let first = handler.handle_frame(&edit(0, "Hello", 1)).await;
        let retry = handler.handle_frame(&edit(0, "Hello", 1)).await;
        assert_eq!(first, retry);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nul_content_is_rejected() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        match handler.handle_frame(&edit(0, "bad\\u0000", 1)).await {
            Outcome::Reply(ServerMessage::Rejected { client_seq, code, .. }) => {
                assert_eq!(client_seq, 1);
                assert_eq!(code, "MALFORMED_CONTENT");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_heavily_escaped_content_within_limit_is_acked() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let content = "\"".repeat(9 * 1024 * 1024);
        let frame = encoded_edit(0, content, 1);
        assert!(frame.len() > cowrite_core::document::MAX_CONTENT_BYTES);

        assert_eq!(
            handler.handle_frame(&frame).await,
            Outcome::Reply(ServerMessage::EditAck {
                revision: 1,
                client_seq: 1,
                content: None
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_over_limit_is_rejected_to_submitter() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let frame = encoded_edit(0, "x".repeat(17 * 1024 * 1024), 1);
        let outcome = handler.handle_frame(&frame).await;
        assert_eq!(rejected_code(outcome), (1, "MALFORMED_CONTENT".into()));

        // Nothing was sequenced
        assert_eq!(
            handler.handle_frame(&edit(0, "ok", 2)).await,
            Outcome::Reply(ServerMessage::EditAck {
                revision: 1,
                client_seq: 2,
                content: None
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_frame_over_configured_limit_is_rejected() {
        let mut config = EngineConfig::default();
        config.session = config.session.with_max_content_bytes(1024);
        let manager = manager_with(config);
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let frame = encoded_edit(0, "x".repeat(96 * 1024), 3);
        assert!(frame.len() > cowrite_protocol::frame_limit(1024));
        let outcome = handler.handle_frame(&frame).await;
        assert_eq!(rejected_code(outcome), (3, "MALFORMED_CONTENT".into()));

        // Under the frame limit but over the content limit
        let frame = encoded_edit(0, "x".repeat(2048), 4);
        let outcome = handler.handle_frame(&frame).await;
        assert_eq!(rejected_code(outcome), (4, "MALFORMED_CONTENT".into()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_oversize_frame_without_seq_is_ignored() {
        let mut config = EngineConfig::default();
        config.session = config.session.with_max_content_bytes(16);
        let manager = manager_with(config);
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let frame = "x".repeat(cowrite_protocol::frame_limit(16) + 1);
        assert_eq!(handler.handle_frame(&frame).await, Outcome::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_edit_refreshes_presence() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        // Liveness timeout is 30s; only edits arrive, no heartbeats
        tokio::time::advance(Duration::from_secs(20)).await;
        handler.handle_frame(&edit(0, "Hello", 1)).await;
        tokio::time::advance(Duration::from_secs(20)).await;

        assert!(manager.presence().sweep().is_empty());
        assert!(manager.presence().entry(handler.token()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_is_ignored() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        assert_eq!(handler.handle_frame("not json").await, Outcome::Ignore);
        assert_eq!(handler.handle_frame(r#"{"type":"drop_table"}"#).await, Outcome::Ignore);
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_after_close_closes_connection() {
        let manager = manager();
        let (mut handler, _attachment) = connect(&manager, "alice").await;

        let beat = r#"{"type":"heartbeat"}"#;
        assert_eq!(handler.handle_frame(beat).await, Outcome::Reply(ServerMessage::Heartbeat));

        manager.presence().leave(handler.token());
        assert!(matches!(handler.handle_frame(beat).await, Outcome::Close(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attach_ack_carries_snapshot() {
        let manager = manager();
        let (handler, attachment) = connect(&manager, "alice").await;

        match handler.attach_ack(&attachment.snapshot, &attachment.color) {
            ServerMessage::AttachAck {
                revision,
                connection_token,
                heartbeat_interval_ms,
                ..
            } => {
                assert_eq!(revision, 0);
                assert_eq!(connection_token, attachment.token.to_string());
                assert_eq!(heartbeat_interval_ms, 15_000);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
