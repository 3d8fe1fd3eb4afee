//! Websocket channel lifecycle: connect, health signaling, and
//! exponential-backoff reconnection.

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc, Mutex,
};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch, Notify},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};
use url::Url;

use crate::config::BackoffConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("channel is not open")]
    NotOpen,
    #[error("channel has shut down")]
    ShutDown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
}

/// `min(base * growth^n, max)` for the n-th consecutive close since the
/// last successful open (the first close schedules `base`).
pub fn backoff_delay(backoff: &BackoffConfig, consecutive_closes: u32) -> Duration {
    let millis =
        backoff.base.as_millis() as f64 * backoff.growth.powi(consecutive_closes as i32);
    Duration::from_millis(millis.min(backoff.max.as_millis() as f64).round() as u64)
}

/// Owns the transport channel for the whole session. A single background
/// run loop drives `connecting -> open -> closed -> (backoff) -> connecting`
/// and never gives up; the only terminal state is [`shutdown`].
///
/// [`shutdown`]: ConnectionManager::shutdown
pub struct ConnectionManager {
    endpoint: Url,
    backoff: BackoffConfig,
    state_tx: watch::Sender<ConnectionState>,
    outbound_tx: mpsc::UnboundedSender<String>,
    /// Cancels the pending backoff timer; only one timer exists at a time
    /// because only the run loop ever sleeps.
    connect_now: Notify,
    reconnect_count: AtomicU32,
    run_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionManager {
    /// Starts the run loop. Inbound text payloads are delivered on
    /// `inbound_tx` in receipt order.
    pub fn spawn(
        endpoint: Url,
        backoff: BackoffConfig,
        inbound_tx: mpsc::UnboundedSender<String>,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(Self {
            endpoint,
            backoff,
            state_tx,
            outbound_tx,
            connect_now: Notify::new(),
            reconnect_count: AtomicU32::new(0),
            run_task: Mutex::new(None),
        });

        let task = tokio::spawn(Arc::clone(&manager).run(inbound_tx, outbound_rx));
        if let Ok(mut guard) = manager.run_task.lock() {
            *guard = Some(task);
        }
        manager
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn reconnect_count(&self) -> u32 {
        self.reconnect_count.load(Ordering::SeqCst)
    }

    /// Cancels a pending backoff timer so the next attempt starts now.
    /// No-op unless the channel is in the closed-pending-retry gap, so at
    /// most one live attempt exists at a time.
    pub fn connect(&self) {
        if self.state() == ConnectionState::Closed {
            self.connect_now.notify_one();
        }
    }

    /// Fire-and-forget: enqueues on the channel's internal buffering and
    /// never blocks the caller.
    pub fn send(&self, payload: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::NotOpen);
        }
        self.outbound_tx
            .send(payload)
            .map_err(|_| ChannelError::ShutDown)
    }

    /// Tears the channel down for good. Dropping the socket closes the
    /// transport on every exit path.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.run_task.lock() {
            if let Some(task) = guard.take() {
                task.abort();
            }
        }
        self.state_tx.send_replace(ConnectionState::Closed);
    }

    async fn run(
        self: Arc<Self>,
        inbound_tx: mpsc::UnboundedSender<String>,
        mut outbound_rx: mpsc::UnboundedReceiver<String>,
    ) {
        loop {
            self.state_tx.send_replace(ConnectionState::Connecting);
            match connect_async(self.endpoint.as_str()).await {
                Ok((stream, _)) => {
                    self.reconnect_count.store(0, Ordering::SeqCst);
                    self.state_tx.send_replace(ConnectionState::Open);
                    info!(endpoint = %self.endpoint, "channel open");

                    let (mut sink, mut reader) = stream.split();
                    loop {
                        tokio::select! {
                            outgoing = outbound_rx.recv() => match outgoing {
                                Some(payload) => {
                                    if let Err(err) = sink.send(Message::Text(payload)).await {
                                        warn!(%err, "channel send failed");
                                        break;
                                    }
                                }
                                // All senders gone: the manager itself was
                                // dropped, nothing left to serve.
                                None => return,
                            },
                            incoming = reader.next() => match incoming {
                                Some(Ok(Message::Text(text))) => {
                                    if inbound_tx.send(text).is_err() {
                                        return;
                                    }
                                }
                                Some(Ok(Message::Close(_))) | None => break,
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!(%err, "channel receive failed");
                                    break;
                                }
                            },
                        }
                    }
                }
                Err(err) => {
                    warn!(endpoint = %self.endpoint, %err, "channel connect failed");
                }
            }

            // Closed (from open or from a failed handshake): schedule exactly
            // one retry, cancellable by an explicit connect().
            self.state_tx.send_replace(ConnectionState::Closed);
            // The outbound buffer belongs to a single connection segment.
            // Payloads accepted while the dying socket still looked open are
            // dropped here, never replayed on the next connection.
            while outbound_rx.try_recv().is_ok() {}
            let closes = self.reconnect_count.fetch_add(1, Ordering::SeqCst);
            let delay = backoff_delay(&self.backoff, closes);
            info!(delay_ms = delay.as_millis() as u64, attempt = closes + 1, "scheduling reconnect");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.connect_now.notified() => {}
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
