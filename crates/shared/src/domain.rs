use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Image,
}

/// Local bookkeeping only; never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    LocalPending,
    LocalConfirmed,
    Remote,
}

/// A displayed chat message. The list it lives in is append-only and
/// insertion-ordered; only `origin` changes after append
/// (`LocalPending` -> `LocalConfirmed` once the server echo is recognized).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub id: String,
    pub user: String,
    pub kind: MessageKind,
    /// UTF-8 content for text messages, a data-URI payload for images.
    pub text: String,
    /// Milliseconds since epoch, client-assigned at creation.
    pub timestamp_ms: i64,
    pub origin: MessageOrigin,
}
