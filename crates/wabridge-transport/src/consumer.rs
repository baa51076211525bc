//! Consumers and the registry that fans events out to them.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use thiserror::Error;
use tokio::sync::{RwLock, mpsc, watch};

use crate::protocol::ServerMessage;

/// Consumer identifier, assigned monotonically from 1.
pub type ConsumerId = u64;

/// Why a frame could not be queued for a consumer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("consumer buffer full")]
    Full,
    #[error("consumer closed")]
    Closed,
}

/// A downstream connection receiving frames.
pub trait Consumer: Send + Sync {
    /// Registry identifier.
    fn id(&self) -> ConsumerId;

    /// Queue a frame without waiting.
    ///
    /// # Errors
    /// Returns error if the queue is full or the consumer is gone.
    fn try_send(&self, frame: Arc<str>) -> Result<(), DeliveryError>;

    /// Ask the connection to close. Idempotent.
    fn close(&self);
}

/// Consumer backed by a bounded channel drained by a socket writer.
pub struct ChannelConsumer {
    id: ConsumerId,
    frames: mpsc::Sender<Arc<str>>,
    closed: watch::Sender<bool>,
}

impl ChannelConsumer {
    /// Create a consumer with a queue of `capacity` frames.
    ///
    /// Returns the consumer, the frame queue for the writer, and a signal
    /// that flips to `true` when the consumer is closed.
    #[must_use]
    pub fn new(
        id: ConsumerId,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Arc<str>>, watch::Receiver<bool>) {
        let (frames, frames_rx) = mpsc::channel(capacity.max(1));
        let (closed, closed_rx) = watch::channel(false);
        (Self { id, frames, closed }, frames_rx, closed_rx)
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

impl Consumer for ChannelConsumer {
    fn id(&self) -> ConsumerId {
        self.id
    }

    fn try_send(&self, frame: Arc<str>) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.frames.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    fn close(&self) {
        self.closed.send_replace(true);
    }
}

/// Registry of live consumers.
///
/// Broadcast iterates under a read lock; consumers that fail delivery are
/// collected and removed after the iteration so nobody else is skipped.
pub struct ConsumerRegistry {
    consumers: RwLock<HashMap<ConsumerId, Arc<dyn Consumer>>>,
    next_id: AtomicU64,
    accepting: AtomicBool,
}

impl ConsumerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            accepting: AtomicBool::new(true),
        }
    }

    /// Allocate the next consumer id.
    pub fn next_id(&self) -> ConsumerId {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Register a consumer. Returns `false` (and closes it) once the
    /// registry has been shut down.
    pub async fn register(&self, consumer: Arc<dyn Consumer>) -> bool {
        let mut consumers = self.consumers.write().await;
        if !self.accepting.load(Ordering::SeqCst) {
            consumer.close();
            return false;
        }
        consumers.insert(consumer.id(), consumer);
        true
    }

    /// Remove and close a consumer. Returns whether it was registered.
    pub async fn remove(&self, id: ConsumerId) -> bool {
        let removed = self.consumers.write().await.remove(&id);
        removed.is_some_and(|consumer| {
            consumer.close();
            true
        })
    }

    /// Send a message to one consumer; a failed delivery removes it.
    pub async fn reply(&self, consumer: &dyn Consumer, message: &ServerMessage) -> bool {
        let frame = match message.encode() {
            Ok(json) => Arc::<str>::from(json),
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                return false;
            }
        };
        match consumer.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(consumer_id = consumer.id(), error = %e, "dropping consumer");
                self.remove(consumer.id()).await;
                false
            }
        }
    }

    /// Send a message to every consumer. Returns how many accepted it.
    pub async fn broadcast(&self, message: &ServerMessage) -> usize {
        let frame: Arc<str> = match message.encode() {
            Ok(json) => json.into(),
            Err(e) => {
                tracing::error!("Failed to serialize message: {e}");
                return 0;
            }
        };

        let mut failed = Vec::new();
        let delivered = {
            let consumers = self.consumers.read().await;
            let mut delivered = 0;
            for consumer in consumers.values() {
                match consumer.try_send(Arc::clone(&frame)) {
                    Ok(()) => delivered += 1,
                    Err(e) => failed.push((consumer.id(), e)),
                }
            }
            tracing::debug!(recipients = consumers.len(), delivered, "broadcast event");
            delivered
        };

        for (id, error) in failed {
            tracing::warn!(consumer_id = id, %error, "dropping consumer");
            self.remove(id).await;
        }
        delivered
    }

    /// Stop accepting consumers and close every registered one.
    pub async fn close_all(&self) {
        let drained: Vec<_> = {
            let mut consumers = self.consumers.write().await;
            self.accepting.store(false, Ordering::SeqCst);
            consumers.drain().map(|(_, consumer)| consumer).collect()
        };
        for consumer in drained {
            consumer.close();
        }
    }

    /// Number of registered consumers.
    pub async fn len(&self) -> usize {
        self.consumers.read().await.len()
    }

    /// Whether no consumer is registered.
    pub async fn is_empty(&self) -> bool {
        self.consumers.read().await.is_empty()
    }
}

impl Default for ConsumerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
