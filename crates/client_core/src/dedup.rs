//! Message identity and deduplication under at-least-once delivery.

use std::collections::{HashSet, VecDeque};

use shared::{
    domain::{ChatMessage, MessageKind, MessageOrigin},
    protocol::WireMessage,
};
use uuid::Uuid;

/// Characters of content mixed into ids derived for id-less payloads.
const DERIVED_ID_PREFIX_LEN: usize = 16;

/// Outcome of admitting an inbound payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// First sighting: append to the displayed list.
    Display(ChatMessage),
    /// The id was already seen (server redelivery, or the echo of a send
    /// whose client id the server preserved). Carries the suppressed id.
    Duplicate(String),
    /// Sender, content, and timestamp match the most recent local send even
    /// though the id differs — a server that rewrote our id echoed it back.
    /// Carries the locally stamped id of that send.
    EchoOfLastSend(String),
}

#[derive(Debug, Clone)]
struct LastSend {
    id: String,
    user: String,
    text: String,
    timestamp_ms: i64,
}

/// Stamps outgoing messages and recognizes duplicate inbound deliveries.
///
/// The seen-set is bounded: past `cap` entries it is pruned oldest-first
/// down to `retain`. A very old duplicate can therefore be re-admitted;
/// duplicates in practice arrive within a short window of the original.
///
/// Self-echo suppression compares only the most recent local send. Two
/// rapid sends whose echoes arrive out of order can slip a duplicate
/// through (or wrongly suppress); this mirrors the long-standing behavior
/// of the system rather than widening the window.
pub struct MessageLedger {
    seen: HashSet<String>,
    order: VecDeque<String>,
    last_send: Option<LastSend>,
    cap: usize,
    retain: usize,
}

impl MessageLedger {
    pub fn new(cap: usize, retain: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            last_send: None,
            cap,
            retain: retain.min(cap),
        }
    }

    /// Assigns id and timestamp, records the id as seen before the message
    /// is ever transmitted, and remembers the send for echo matching.
    pub fn stamp_outgoing(&mut self, user: &str, kind: MessageKind, text: String) -> ChatMessage {
        let timestamp_ms = chrono::Utc::now().timestamp_millis();
        let suffix = Uuid::new_v4().simple().to_string();
        let id = format!("{user}-{timestamp_ms}-{}", &suffix[..8]);
        self.remember(id.clone());
        self.last_send = Some(LastSend {
            id: id.clone(),
            user: user.to_string(),
            text: text.clone(),
            timestamp_ms,
        });
        ChatMessage {
            id,
            user: user.to_string(),
            kind,
            text,
            timestamp_ms,
            origin: MessageOrigin::LocalPending,
        }
    }

    /// Yields [`Admission::Display`] at most once per id (up to eviction).
    pub fn admit_inbound(&mut self, wire: &WireMessage) -> Admission {
        let id = wire
            .id
            .as_deref()
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| derived_id(wire));

        if self.seen.contains(&id) {
            return Admission::Duplicate(id);
        }

        if let Some(last) = self.last_send.as_ref() {
            if last.user == wire.user
                && last.timestamp_ms == wire.timestamp
                && last.text == wire.text
            {
                let local_id = last.id.clone();
                self.remember(id);
                return Admission::EchoOfLastSend(local_id);
            }
        }

        self.remember(id.clone());
        Admission::Display(wire.clone().into_message(id, MessageOrigin::Remote))
    }

    fn remember(&mut self, id: String) {
        if self.seen.insert(id.clone()) {
            self.order.push_back(id);
        }
        if self.order.len() > self.cap {
            while self.order.len() > self.retain {
                if let Some(evicted) = self.order.pop_front() {
                    self.seen.remove(&evicted);
                }
            }
        }
    }

    #[cfg(test)]
    fn seen_len(&self) -> usize {
        self.order.len()
    }
}

/// Deterministic identity for payloads the server delivered without an id.
fn derived_id(wire: &WireMessage) -> String {
    let prefix: String = wire.text.chars().take(DERIVED_ID_PREFIX_LEN).collect();
    format!("{}-{}-{prefix}", wire.user, wire.timestamp)
}

#[cfg(test)]
#[path = "tests/dedup_tests.rs"]
mod tests;
