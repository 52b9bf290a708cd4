use axum::extract::ws::{Message, Utf8Bytes};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Frames a subscriber's write channel may buffer before a broadcast write
/// to it is counted as failed.
pub const SUBSCRIBER_BUFFER: usize = 32;

/// Registry of live push subscribers and the fan-out over them.
///
/// Mutations take the exclusive lock; broadcasting iterates under the shared
/// one. A subscriber is removed only by its own connection loop, never by a
/// failed broadcast write.
pub struct Hub {
    subscribers: RwLock<HashMap<SocketAddr, mpsc::Sender<Message>>>,
    shutdown: CancellationToken,
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: RwLock::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        })
    }

    /// Registers a subscriber's write channel. Returns `false` once the hub
    /// is shutting down; the caller then closes the connection itself.
    pub fn register(&self, addr: SocketAddr, tx: mpsc::Sender<Message>) -> bool {
        if self.shutdown.is_cancelled() {
            return false;
        }
        self.subscribers.write().insert(addr, tx);
        true
    }

    /// Idempotent.
    pub fn remove(&self, addr: SocketAddr) {
        self.subscribers.write().remove(&addr);
    }

    pub fn len(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Signal observed by every subscriber loop; fires once on shutdown.
    pub fn shutdown_signal(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Writes `message` to every currently registered subscriber. A full or
    /// closed write channel drops the message for that subscriber only.
    pub fn broadcast(&self, message: &Utf8Bytes) {
        let subscribers = self.subscribers.read();
        for (addr, tx) in subscribers.iter() {
            if let Err(e) = tx.try_send(Message::Text(message.clone())) {
                tracing::warn!(%addr, "subscriber write failed: {e}");
            }
        }
    }

    /// Rejects new registrations, tells every subscriber loop to close with
    /// a normal-closure frame, and clears the registry.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.subscribers.write().clear();
    }
}

/// Consumes the envelope stream and fans each message out. Cancelling the
/// root token (or the stream closing) shuts the hub down; envelopes arriving
/// during shutdown are dropped.
pub fn run_updater(
    hub: Arc<Hub>,
    cancel: CancellationToken,
    mut updates: mpsc::Receiver<String>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    hub.shutdown();
                    break;
                }
                update = updates.recv() => match update {
                    Some(message) => {
                        if !hub.is_empty() {
                            hub.broadcast(&Utf8Bytes::from(message));
                        }
                    }
                    None => {
                        hub.shutdown();
                        break;
                    }
                },
            }
        }
        tracing::info!("hub updater stopped");
    })
}
