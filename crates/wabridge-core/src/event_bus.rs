//! Live broadcast of bridge events.
//!
//! Unlike a history store, subscribers only see events published after they
//! subscribe.

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};

use crate::types::BridgeEvent;

/// Default channel capacity.
const DEFAULT_CAPACITY: usize = 1024;

/// Broadcast channel for [`BridgeEvent`]s.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BridgeEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// Create a bus with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus holding up to `capacity` unread events per subscriber.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event to current subscribers.
    ///
    /// Returns how many subscribers it was queued for.
    pub fn publish(&self, event: BridgeEvent) -> usize {
        let kind = event.kind();
        let receivers = self.sender.send(event).unwrap_or(0);
        tracing::trace!(kind, receivers, "published event");
        receivers
    }

    /// Subscribe to future events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.sender.subscribe()
    }

    /// Number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stream of future events. Lagged gaps are logged and skipped.
    #[must_use]
    pub fn stream(&self) -> futures::stream::BoxStream<'static, BridgeEvent> {
        into_stream(self.subscribe())
    }
}

/// Turn a receiver into a stream, skipping over lag gaps.
#[must_use]
pub fn into_stream(
    rx: broadcast::Receiver<BridgeEvent>,
) -> futures::stream::BoxStream<'static, BridgeEvent> {
    BroadcastStream::new(rx)
        .filter_map(|res| async move {
            match res {
                Ok(event) => Some(event),
                Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event subscriber lagged, events dropped");
                    None
                }
            }
        })
        .boxed()
}
