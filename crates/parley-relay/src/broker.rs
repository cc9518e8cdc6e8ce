//! Message broker
//!
//! Ordered per channel, at-least-once to active subscribers. The in-process
//! implementation keeps one tokio broadcast sender per channel.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tracing::trace;

use crate::error::RelayResult;

/// Default per-channel buffer
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Pub/sub broker contract
#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish a payload. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, payload: String) -> RelayResult<usize>;

    /// Subscribe to a channel. Only payloads published afterwards arrive.
    async fn subscribe(&self, channel: &str) -> RelayResult<broadcast::Receiver<String>>;
}

/// In-process broker
#[derive(Debug)]
pub struct InMemoryBroker {
    channels: DashMap<String, broadcast::Sender<String>>,
    capacity: usize,
}

impl InMemoryBroker {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Channels that still have a sender
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, channel: &str, payload: String) -> RelayResult<usize> {
        let delivered = match self.channels.get(channel) {
            Some(sender) => sender.send(payload).unwrap_or(0),
            None => 0,
        };

        if delivered == 0 {
            // drop channels nobody listens to
            self.channels
                .remove_if(channel, |_, sender| sender.receiver_count() == 0);
            trace!(channel, "Published to channel without subscribers");
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: &str) -> RelayResult<broadcast::Receiver<String>> {
        let receiver = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Ok(receiver)
    }
}
