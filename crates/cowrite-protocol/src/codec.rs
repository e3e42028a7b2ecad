//! Frame encoding and decoding

use crate::error::{ProtocolError, ProtocolResult};
use crate::message::{ClientMessage, ServerMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Room for the message fields around the content
pub const FRAME_ENVELOPE_BYTES: usize = 64 * 1024;

/// Frame limit for the default content limit
pub const MAX_FRAME_BYTES: usize = frame_limit(cowrite_core::document::MAX_CONTENT_BYTES);

/// Largest frame that can carry `max_content_bytes` of content.
///
/// JSON escaping expands a byte to at most six (`\u001f`), so the limit is
/// measured against the worst-case encoding rather than the raw content.
pub const fn frame_limit(max_content_bytes: usize) -> usize {
    max_content_bytes
        .saturating_mul(6)
        .saturating_add(FRAME_ENVELOPE_BYTES)
}

/// Decode a frame sent by a client
pub fn decode_client(frame: &str) -> ProtocolResult<ClientMessage> {
    decode(frame, MAX_FRAME_BYTES)
}

/// Decode a client frame against a configured content limit
pub fn decode_client_with_limit(
    frame: &str,
    max_content_bytes: usize,
) -> ProtocolResult<ClientMessage> {
    decode(frame, frame_limit(max_content_bytes))
}

/// Decode a frame sent by the server
pub fn decode_server(frame: &str) -> ProtocolResult<ServerMessage> {
    decode(frame, MAX_FRAME_BYTES)
}

/// Best-effort `clientSeq` of an edit frame that could not be decoded
pub fn recover_client_seq(frame: &str) -> Option<u64> {
    const KEY: &str = "\"clientSeq\"";

    let mut search = 0;
    while let Some(found) = frame[search..].find(KEY) {
        let start = search + found;
        search = start + KEY.len();
        // An escaped quote belongs to a string value
        if frame[..start].ends_with('\\') {
            continue;
        }

        let rest = frame[search..].trim_start();
        let Some(value) = rest.strip_prefix(':') else {
            continue;
        };
        let value = value.trim_start();
        let digits = value
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(value.len());
        if let Ok(seq) = value[..digits].parse() {
            return Some(seq);
        }
    }
    None
}

/// Encode a message as a text frame
pub fn encode<T: Serialize>(message: &T) -> ProtocolResult<String> {
    serde_json::to_string(message).map_err(|e| ProtocolError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(frame: &str, max: usize) -> ProtocolResult<T> {
    if frame.len() > max {
        debug!(size = frame.len(), max, "Dropping oversize frame");
        return Err(ProtocolError::MessageTooLarge {
            size: frame.len(),
            max,
        });
    }

    let value: serde_json::Value = serde_json::from_str(frame).map_err(|e| {
        debug!(size = frame.len(), error = %e, "Dropping frame that is not JSON");
        ProtocolError::InvalidJson(e.to_string())
    })?;

    let kind = match value.get("type").and_then(|t| t.as_str()) {
        Some(kind) => kind.to_string(),
        None => return Err(ProtocolError::MissingType),
    };

    serde_json::from_value(value).map_err(|e| ProtocolError::InvalidMessage {
        kind,
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_edit() {
        let msg =
            decode_client(r#"{"type":"edit","baseRevision":1,"content":"Hi","clientSeq":2}"#)
                .unwrap();
        assert_eq!(
            msg,
            ClientMessage::Edit {
                base_revision: 1,
                content: "Hi".into(),
                client_seq: 2,
            }
        );
    }

    #[test]
    fn test_decode_heartbeat() {
        assert_eq!(
            decode_client(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientMessage::Heartbeat
        );
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            decode_client("{not json"),
            Err(ProtocolError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_missing_type() {
        assert!(matches!(
            decode_client(r#"{"content":"x"}"#),
            Err(ProtocolError::MissingType)
        ));
    }

    #[test]
    fn test_unknown_type_and_missing_field() {
        match decode_client(r#"{"type":"delete_everything"}"#) {
            Err(ProtocolError::InvalidMessage { kind, .. }) => assert_eq!(kind, "delete_everything"),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(matches!(
            decode_client(r#"{"type":"edit","content":"x","clientSeq":1}"#),
            Err(ProtocolError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_oversize_frame() {
        let frame = "x".repeat(frame_limit(16) + 1);
        assert!(matches!(
            decode_client_with_limit(&frame, 16),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
        assert_eq!(MAX_FRAME_BYTES, 6 * 16 * 1024 * 1024 + FRAME_ENVELOPE_BYTES);
    }

    #[test]
    fn test_escaped_content_fits_the_frame_limit() {
        let max = 1024;
        let content = "\"".repeat(max);
        let frame = encode(&ClientMessage::Edit {
            base_revision: 0,
            content: content.clone(),
            client_seq: 1,
        })
        .unwrap();
        assert!(frame.len() > 2 * max);

        match decode_client_with_limit(&frame, max).unwrap() {
            ClientMessage::Edit { content: decoded, .. } => assert_eq!(decoded, content),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_control_characters_fit_the_frame_limit() {
        let max = 1024;
        let frame = encode(&ClientMessage::Edit {
            base_revision: 0,
            content: "\u{1f}".repeat(max),
            client_seq: 1,
        })
        .unwrap();
        assert!(frame.len() <= frame_limit(max));
        assert!(decode_client_with_limit(&frame, max).is_ok());
    }

    #[test]
    fn test_configured_limit_applies() {
        let frame = format!(
            r#"{{"type":"edit","baseRevision":0,"content":"{}","clientSeq":4}}"#,
            "x".repeat(frame_limit(16))
        );
        match decode_client_with_limit(&frame, 16) {
            Err(ProtocolError::MessageTooLarge { max, .. }) => assert_eq!(max, frame_limit(16)),
            other => panic!("unexpected: {:?}", other),
        }
        assert_eq!(recover_client_seq(&frame), Some(4));
    }

    #[test]
    fn test_recover_client_seq() {
        assert_eq!(
            recover_client_seq(r#"{"type":"edit","clientSeq" : 42,"content":"#),
            Some(42)
        );
        // Key text inside the content is skipped
        assert_eq!(
            recover_client_seq(r#"{"content":"\"clientSeq\":9","clientSeq":3}"#),
            Some(3)
        );
        assert_eq!(recover_client_seq(r#"{"type":"edit","content":"x"#), None);
        assert_eq!(recover_client_seq(r#"{"clientSeq":"7"}"#), None);
    }

    #[test]
    fn test_server_frame_with_presence() {
        let frame = r##"{"type":"presence","users":[{"userId":"a","displayName":"A","color":"#e06c75","connectionId":"c1","joinedAt":1,"lastSeen":2}]}"##;
        match decode_server(frame).unwrap() {
            ServerMessage::Presence { users } => {
                assert_eq!(users.len(), 1);
                assert_eq!(users[0].display_name, "A");
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
