//! Wire message types

use cowrite_core::{PresenceEntry, SessionEvent};
use serde::{Deserialize, Serialize};

/// Messages a client sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Proposed full content computed against `base_revision`
    #[serde(rename_all = "camelCase")]
    Edit {
        base_revision: u64,
        content: String,
        client_seq: u64,
    },
    Heartbeat,
}

/// Messages the server sends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// First frame after the upgrade: the authoritative snapshot
    #[serde(rename_all = "camelCase")]
    AttachAck {
        revision: u64,
        content: String,
        connection_token: String,
        color: String,
        heartbeat_interval_ms: u64,
    },

    #[serde(rename_all = "camelCase")]
    EditAck {
        revision: u64,
        client_seq: u64,
        /// Set only when the server's content differs from what was submitted
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    Broadcast {
        revision: u64,
        content: String,
        from_user: String,
        overwrite: bool,
    },

    Presence { users: Vec<PresenceUser> },

    #[serde(rename_all = "camelCase")]
    Rejected {
        client_seq: u64,
        code: String,
        message: String,
    },

    #[serde(rename_all = "camelCase")]
    SaveStatus {
        persisted_revision: Option<u64>,
        pending: bool,
    },

    Heartbeat,
}

/// One participant as seen on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceUser {
    pub user_id: String,
    pub display_name: String,
    pub color: String,
    pub connection_id: String,
    pub joined_at: u64,
    pub last_seen: u64,
}

impl From<&PresenceEntry> for PresenceUser {
    fn from(entry: &PresenceEntry) -> Self {
        Self {
            user_id: entry.user_id.clone(),
            display_name: entry.display_name.clone(),
            color: entry.color.clone(),
            connection_id: entry.connection.to_string(),
            joined_at: entry.joined_at,
            last_seen: entry.last_seen,
        }
    }
}

impl From<SessionEvent> for ServerMessage {
    fn from(event: SessionEvent) -> Self {
        match event {
            SessionEvent::Broadcast {
                revision,
                content,
                from_user,
                overwrite,
            } => ServerMessage::Broadcast {
                revision,
                content,
                from_user,
                overwrite,
            },
            SessionEvent::Presence(entries) => ServerMessage::Presence {
                users: entries.iter().map(PresenceUser::from).collect(),
            },
            SessionEvent::SaveStatus(status) => ServerMessage::SaveStatus {
                persisted_revision: status.persisted_revision,
                pending: status.pending,
            },
        }
    }
}

impl ServerMessage {
    /// Message kind as it appears in the `type` tag
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::AttachAck { .. } => "attach_ack",
            ServerMessage::EditAck { .. } => "edit_ack",
            ServerMessage::Broadcast { .. } => "broadcast",
            ServerMessage::Presence { .. } => "presence",
            ServerMessage::Rejected { .. } => "rejected",
            ServerMessage::SaveStatus { .. } => "save_status",
            ServerMessage::Heartbeat => "heartbeat",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cowrite_core::SaveStatus;
    use serde_json::json;

    #[test]
    fn test_edit_uses_camel_case_fields() {
        let msg = ClientMessage::Edit {
            base_revision: 3,
            content: "Hello".into(),
            client_seq: 7,
        };
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "edit", "baseRevision": 3, "content": "Hello", "clientSeq": 7})
        );
    }

    #[test]
    fn test_edit_ack_omits_unchanged_content() {
        let ack = ServerMessage::EditAck {
            revision: 4,
            client_seq: 7,
            content: None,
        };
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({"type": "edit_ack", "revision": 4, "clientSeq": 7})
        );
    }

    #[test]
    fn test_save_status_from_event() {
        let msg = ServerMessage::from(SessionEvent::SaveStatus(SaveStatus {
            persisted_revision: Some(2),
            pending: false,
            failing: false,
        }));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "save_status", "persistedRevision": 2, "pending": false})
        );
        assert_eq!(msg.kind(), "save_status");
    }

    #[test]
    fn test_broadcast_shape() {
        let msg = ServerMessage::from(SessionEvent::Broadcast {
            revision: 2,
            content: "Hello world".into(),
            from_user: "bob".into(),
            overwrite: true,
        });
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "type": "broadcast",
                "revision": 2,
                "content": "Hello world",
                "fromUser": "bob",
                "overwrite": true
            })
        );
    }
}
