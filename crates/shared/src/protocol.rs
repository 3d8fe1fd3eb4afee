use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::domain::{ChatMessage, MessageKind, MessageOrigin};

/// The channel payload. The server is an opaque relay: it may echo a
/// client's own payload back, may rewrite ids, and may redeliver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    /// Absent on payloads from servers that strip client ids; the
    /// deduplication store derives one deterministically in that case.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub user: String,
    pub text: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub timestamp: i64,
    #[serde(rename = "clientGeneratedId", default)]
    pub client_generated_id: bool,
}

impl WireMessage {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: Some(message.id.clone()),
            user: message.user.clone(),
            text: message.text.clone(),
            kind: message.kind,
            timestamp: message.timestamp_ms,
            client_generated_id: true,
        }
    }

    pub fn into_message(self, id: String, origin: MessageOrigin) -> ChatMessage {
        ChatMessage {
            id,
            user: self.user,
            kind: self.kind,
            text: self.text,
            timestamp_ms: self.timestamp,
            origin,
        }
    }
}

/// `data:<mime>;base64,<payload>` — the self-describing image encoding
/// carried in the `text` field of image messages.
pub fn encode_data_uri(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", STANDARD.encode(bytes))
}

/// Splits a data-URI back into its mime type and decoded payload.
pub fn decode_data_uri(uri: &str) -> Option<(String, Vec<u8>)> {
    let rest = uri.strip_prefix("data:")?;
    let (mime, payload) = rest.split_once(";base64,")?;
    let bytes = STANDARD.decode(payload).ok()?;
    Some((mime.to_string(), bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_message_uses_camel_case_field_names() {
        let message = ChatMessage {
            id: "alice-1-abcd".into(),
            user: "alice".into(),
            kind: MessageKind::Text,
            text: "hi".into(),
            timestamp_ms: 1_700_000_000_000,
            origin: MessageOrigin::LocalPending,
        };
        let json = serde_json::to_value(WireMessage::from_message(&message)).unwrap();
        assert_eq!(json["id"], "alice-1-abcd");
        assert_eq!(json["type"], "text");
        assert_eq!(json["clientGeneratedId"], true);
        assert_eq!(json["timestamp"], 1_700_000_000_000_i64);
    }

    #[test]
    fn inbound_without_id_or_flag_parses() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"user":"bob","text":"hello","type":"text","timestamp":42}"#,
        )
        .unwrap();
        assert_eq!(wire.id, None);
        assert!(!wire.client_generated_id);
        assert_eq!(wire.kind, MessageKind::Text);
    }

    #[test]
    fn data_uri_round_trip() {
        let uri = encode_data_uri("image/png", b"\x89PNG");
        assert!(uri.starts_with("data:image/png;base64,"));
        let (mime, bytes) = decode_data_uri(&uri).unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, b"\x89PNG");
    }
}
