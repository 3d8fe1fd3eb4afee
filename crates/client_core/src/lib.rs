//! Resilient realtime chat client core.
//!
//! Maintains a persistent bidirectional channel to a chat server, survives
//! disconnects via backoff reconnection, displays each logical message
//! exactly once despite server echo and optimistic insertion, and shapes
//! outgoing images to the transport size budget. Presentation layers
//! consume [`ChatSnapshot`] / [`ClientEvent`] and drive the [`ChatClient`]
//! commands; nothing here renders anything.

pub mod config;
pub mod connection;
pub mod dedup;
pub mod image;

use std::sync::{Arc, Mutex as StdMutex, Weak};

use anyhow::Context;
use shared::{
    domain::{ChatMessage, MessageKind, MessageOrigin},
    protocol::WireMessage,
};
use thiserror::Error;
use tokio::{
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
};
use tracing::warn;

pub use crate::config::{BackoffConfig, ClientConfig};
pub use crate::connection::{backoff_delay, ChannelError, ConnectionManager, ConnectionState};
pub use crate::dedup::{Admission, MessageLedger};
pub use crate::image::{EncodedImage, ImageError, RawImage};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("display name must be at least 2 characters")]
    TooShort,
    #[error("display name is already fixed for this session")]
    AlreadyJoined,
}

#[derive(Debug, Error)]
pub enum SendError {
    #[error("join with a display name before sending")]
    NotJoined,
    #[error("no image selected")]
    NoSelection,
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error("failed to encode outgoing payload: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub enum ClientEvent {
    MessageAppended(ChatMessage),
    ConnectionChanged(ConnectionState),
    /// Latest non-fatal error/status string for the dismissible banner.
    Status(String),
}

/// The contract consumed by the presentation layer.
#[derive(Debug, Clone)]
pub struct ChatSnapshot {
    pub messages: Vec<ChatMessage>,
    pub is_connected: bool,
    pub error_message: Option<String>,
}

/// At most one in-flight candidate image awaiting explicit confirmation.
#[derive(Debug, Clone)]
pub struct PendingImage {
    pub bytes: Vec<u8>,
    pub mime: String,
    pub width: u32,
    pub height: u32,
}

struct ClientState {
    user: Option<String>,
    ledger: MessageLedger,
    messages: Vec<ChatMessage>,
    error_message: Option<String>,
    pending_image: Option<PendingImage>,
    /// Bumped by every select/cancel/send so a slow preview decode that
    /// lost the race is recognized as stale and ignored.
    selection_generation: u64,
}

/// Message submission coordinator: owns the message list, the identity
/// ledger, and the pending image selection; delegates transport to
/// [`ConnectionManager`] and shaping to [`image::prepare`].
pub struct ChatClient {
    config: ClientConfig,
    connection: Arc<ConnectionManager>,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl ChatClient {
    /// Starts the channel and the background pumps. The connection keeps
    /// retrying for the life of the client; it never gives up on its own.
    pub fn connect(config: ClientConfig) -> anyhow::Result<Arc<Self>> {
        let endpoint = config
            .endpoint()
            .with_context(|| format!("invalid server url: {}", config.server_url))?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let connection = ConnectionManager::spawn(endpoint, config.backoff.clone(), inbound_tx);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let client = Arc::new(Self {
            inner: Mutex::new(ClientState {
                user: None,
                ledger: MessageLedger::new(config.seen_cap, config.seen_retain),
                messages: Vec::new(),
                error_message: None,
                pending_image: None,
                selection_generation: 0,
            }),
            config,
            connection,
            events,
            tasks: StdMutex::new(Vec::new()),
        });
        client.spawn_inbound_pump(inbound_rx);
        client.spawn_state_watch();
        Ok(client)
    }

    /// Fixes the session's display name, one-time, immutable thereafter.
    pub async fn join(&self, name: &str) -> Result<(), ValidationError> {
        let trimmed = name.trim();
        if trimmed.chars().count() < 2 {
            return Err(ValidationError::TooShort);
        }
        let mut inner = self.inner.lock().await;
        if inner.user.is_some() {
            return Err(ValidationError::AlreadyJoined);
        }
        inner.user = Some(trimmed.to_string());
        Ok(())
    }

    /// Optimistically appends, then attempts the channel send. A closed
    /// channel surfaces a transient status and nudges reconnection; the
    /// message is not requeued (at-most-once local attempt).
    pub async fn send_text(&self, text: &str) -> Result<(), SendError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        self.transmit(MessageKind::Text, trimmed.to_string()).await
    }

    /// Decodes a preview and installs the candidate selection, replacing
    /// any previous one. Nothing is transmitted until
    /// [`send_selected_image`](Self::send_selected_image).
    pub async fn select_image(
        &self,
        bytes: Vec<u8>,
        mime: impl Into<String>,
    ) -> Result<(), ImageError> {
        let mime = mime.into();
        let generation = {
            let mut inner = self.inner.lock().await;
            inner.selection_generation += 1;
            inner.pending_image = None;
            inner.selection_generation
        };

        let decoded = tokio::task::spawn_blocking(move || {
            crate::image::decode_dimensions(&bytes).map(|dims| (bytes, dims))
        })
        .await
        .map_err(|err| ImageError::DecodeFailed(err.to_string()))?;

        let (bytes, (width, height)) = match decoded {
            Ok(result) => result,
            Err(err) => {
                self.set_error(&err.to_string()).await;
                return Err(err);
            }
        };

        let mut inner = self.inner.lock().await;
        if inner.selection_generation != generation {
            // Superseded by a newer select/cancel while decoding.
            return Ok(());
        }
        inner.pending_image = Some(PendingImage {
            bytes,
            mime,
            width,
            height,
        });
        Ok(())
    }

    /// Shapes the pending selection to the configured budget and sends it
    /// as an image message. The selection is cleared regardless of outcome.
    pub async fn send_selected_image(&self) -> Result<(), SendError> {
        let pending = {
            let mut inner = self.inner.lock().await;
            inner.selection_generation += 1;
            inner.pending_image.take()
        };
        let Some(pending) = pending else {
            return Err(SendError::NoSelection);
        };

        let budget = self.config.image_budget_bytes;
        let raw = RawImage {
            bytes: pending.bytes,
            mime: pending.mime,
        };
        let shaped = tokio::task::spawn_blocking(move || crate::image::prepare(&raw, budget))
            .await
            .map_err(|err| ImageError::EncodeFailed(err.to_string()))?;

        match shaped {
            Ok(encoded) => self.transmit(MessageKind::Image, encoded.data_uri).await,
            Err(err) => {
                self.set_error(&err.to_string()).await;
                Err(err.into())
            }
        }
    }

    pub async fn cancel_selection(&self) {
        let mut inner = self.inner.lock().await;
        inner.selection_generation += 1;
        inner.pending_image = None;
    }

    pub async fn pending_selection(&self) -> Option<PendingImage> {
        self.inner.lock().await.pending_image.clone()
    }

    pub async fn snapshot(&self) -> ChatSnapshot {
        let inner = self.inner.lock().await;
        ChatSnapshot {
            messages: inner.messages.clone(),
            is_connected: self.connection.is_open(),
            error_message: inner.error_message.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_open()
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn dismiss_error(&self) {
        self.inner.lock().await.error_message = None;
    }

    /// Deterministic session teardown: closes the channel and stops the
    /// background pumps. Also runs on drop.
    pub fn shutdown(&self) {
        // Pumps stop first so the watch task cannot translate this
        // deliberate close into a "reconnecting" banner.
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.connection.shutdown();
    }

    async fn transmit(&self, kind: MessageKind, body: String) -> Result<(), SendError> {
        let message = {
            let mut inner = self.inner.lock().await;
            let user = inner.user.clone().ok_or(SendError::NotJoined)?;
            let message = inner.ledger.stamp_outgoing(&user, kind, body);
            inner.messages.push(message.clone());
            message
        };
        let _ = self
            .events
            .send(ClientEvent::MessageAppended(message.clone()));

        let payload = serde_json::to_string(&WireMessage::from_message(&message))?;
        match self.connection.send(payload) {
            Ok(()) => Ok(()),
            Err(ChannelError::NotOpen | ChannelError::ShutDown) => {
                self.set_error("not connected: message not delivered, reconnecting")
                    .await;
                self.connection.connect();
                Ok(())
            }
        }
    }

    /// Inbound payloads are handled one at a time in receipt order.
    async fn handle_inbound(&self, raw: &str) {
        let wire: WireMessage = match serde_json::from_str(raw) {
            Ok(wire) => wire,
            Err(err) => {
                warn!(%err, "dropping malformed inbound payload");
                return;
            }
        };

        let mut inner = self.inner.lock().await;
        match inner.ledger.admit_inbound(&wire) {
            Admission::Display(message) => {
                inner.messages.push(message.clone());
                drop(inner);
                let _ = self.events.send(ClientEvent::MessageAppended(message));
            }
            Admission::Duplicate(id) | Admission::EchoOfLastSend(id) => {
                // The echo of an optimistic send confirms it.
                if let Some(local) = inner
                    .messages
                    .iter_mut()
                    .find(|m| m.id == id && m.origin == MessageOrigin::LocalPending)
                {
                    local.origin = MessageOrigin::LocalConfirmed;
                }
            }
        }
    }

    async fn set_error(&self, message: &str) {
        self.inner.lock().await.error_message = Some(message.to_string());
        let _ = self.events.send(ClientEvent::Status(message.to_string()));
    }

    fn spawn_inbound_pump(self: &Arc<Self>, mut inbound_rx: mpsc::UnboundedReceiver<String>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(raw) = inbound_rx.recv().await {
                let Some(client) = weak.upgrade() else { break };
                client.handle_inbound(&raw).await;
            }
        });
        self.push_task(task);
    }

    fn spawn_state_watch(self: &Arc<Self>) {
        let mut state_rx = self.connection.subscribe_state();
        let weak: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow_and_update();
                let Some(client) = weak.upgrade() else { break };
                match state {
                    ConnectionState::Open => {
                        // A fresh open clears any queued status indicator.
                        client.inner.lock().await.error_message = None;
                    }
                    ConnectionState::Closed => {
                        client.inner.lock().await.error_message =
                            Some("connection lost, reconnecting".into());
                    }
                    ConnectionState::Connecting => {}
                }
                let _ = client.events.send(ClientEvent::ConnectionChanged(state));
            }
        });
        self.push_task(task);
    }

    fn push_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(task);
        }
    }
}

impl Drop for ChatClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
