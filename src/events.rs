//! Typed Event Channels
//!
//! Every component publishes its notifications on an [`EventBus`] carrying a
//! closed enum of events. Observers (logging, UI, alerting) call
//! [`EventBus::subscribe`] and receive every event emitted afterwards.
//!
//! Channels are bounded broadcast channels: a subscriber that falls more than
//! `capacity` events behind observes a `Lagged` error and skips ahead. Emitting
//! never blocks and never fails, even with no subscribers.

use tokio::sync::broadcast;

/// Default number of buffered events per channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// A bounded, typed, multi-subscriber event channel.
#[derive(Debug, Clone)]
pub struct EventBus<E: Clone> {
    sender: broadcast::Sender<E>,
}

impl<E: Clone> EventBus<E> {
    /// Creates a channel buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publishes an event to all current subscribers.
    pub fn emit(&self, event: E) {
        // No subscribers is not an error
        let _ = self.sender.send(event);
    }

    /// Subscribes to events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.sender.subscribe()
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl<E: Clone> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
