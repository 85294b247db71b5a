//! Broadcast delivery of policy events

use tokio::sync::broadcast;

use super::event::PolicyEvent;

/// Fan-out channel for [`PolicyEvent`]s
///
/// Publishing never blocks. A subscriber that falls more than `capacity`
/// events behind loses the oldest ones and sees `RecvError::Lagged`.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PolicyEvent>,
}

impl EventBus {
    /// Default buffered events per subscriber
    pub const DEFAULT_CAPACITY: usize = 1024;

    /// Create a bus buffering `capacity` events per subscriber
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Receive every event published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<PolicyEvent> {
        self.sender.subscribe()
    }

    /// Publish an event; returns how many subscribers will see it
    pub fn publish(&self, event: PolicyEvent) -> usize {
        // No subscribers is not an error for an observability feed.
        self.sender.send(event).unwrap_or(0)
    }

    /// Current subscriber count
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
