//! Session fanout on top of a [`Broker`].
//!
//! Each session with at least one local subscriber owns one listener task
//! that drains the broker subscription in order and hands every event to
//! the subscribed connections. Subscribers only see events published after
//! they joined.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use parley_core::ServerEvent;
use parley_observability::RelayMetrics;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broker::Broker;
use crate::error::{RelayError, RelayResult};

/// Broker channel carrying presence changes
pub const PRESENCE_CHANNEL: &str = "presence";

/// Broker channel for a session
pub fn session_channel(session_id: &str) -> String {
    format!("chat:{}", session_id)
}

/// Where relayed events end up, usually a live connection.
pub trait EventSink: Send + Sync {
    fn deliver(&self, event: &ServerEvent) -> RelayResult<()>;
}

impl EventSink for mpsc::UnboundedSender<ServerEvent> {
    fn deliver(&self, event: &ServerEvent) -> RelayResult<()> {
        self.send(event.clone())
            .map_err(|_| RelayError::ChannelClosed)
    }
}

type Subscribers = Arc<RwLock<HashMap<String, Arc<dyn EventSink>>>>;

struct ChannelListener {
    subscribers: Subscribers,
    task: JoinHandle<()>,
}

impl Drop for ChannelListener {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[derive(Clone)]
pub struct Relay {
    broker: Arc<dyn Broker>,
    channels: Arc<DashMap<String, ChannelListener>>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl Relay {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            channels: Arc::new(DashMap::new()),
        }
    }

    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Publish a turn event to everyone watching the session.
    pub async fn publish(&self, session_id: &str, event: &ServerEvent) -> RelayResult<usize> {
        let payload = serde_json::to_string(event)?;
        let reached = self
            .broker
            .publish(&session_channel(session_id), payload)
            .await?;
        RelayMetrics::record_published();
        debug!(session_id, kind = event.kind(), reached, "Relayed event");
        Ok(reached)
    }

    /// Attach a connection to a session's stream. Re-subscribing the same
    /// connection replaces its sink.
    pub async fn subscribe(
        &self,
        session_id: &str,
        connection_id: &str,
        sink: Arc<dyn EventSink>,
    ) -> RelayResult<()> {
        if let Some(listener) = self.channels.get(session_id) {
            listener
                .subscribers
                .write()
                .insert(connection_id.to_string(), sink);
            return Ok(());
        }

        let receiver = self.broker.subscribe(&session_channel(session_id)).await?;

        let entry = self
            .channels
            .entry(session_id.to_string())
            .or_insert_with(|| {
                let subscribers: Subscribers = Arc::new(RwLock::new(HashMap::new()));
                let task = tokio::spawn(forward(
                    session_id.to_string(),
                    receiver,
                    subscribers.clone(),
                ));
                ChannelListener { subscribers, task }
            });
        entry
            .subscribers
            .write()
            .insert(connection_id.to_string(), sink);
        drop(entry);

        RelayMetrics::set_channels(self.channels.len());
        debug!(session_id, connection_id, "Subscribed to session channel");
        Ok(())
    }

    /// Detach a connection. The session's listener stops with its last
    /// subscriber. Unknown pairs are ignored.
    pub fn unsubscribe(&self, session_id: &str, connection_id: &str) {
        if let Some(listener) = self.channels.get(session_id) {
            listener.subscribers.write().remove(connection_id);
        }

        let removed = self
            .channels
            .remove_if(session_id, |_, l| l.subscribers.read().is_empty());
        if removed.is_some() {
            RelayMetrics::set_channels(self.channels.len());
            debug!(session_id, "Closed idle session channel");
        }
    }

    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.channels
            .get(session_id)
            .map(|l| l.subscribers.read().len())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub async fn publish_presence(&self, event: &ServerEvent) -> RelayResult<usize> {
        let payload = serde_json::to_string(event)?;
        self.broker.publish(PRESENCE_CHANNEL, payload).await
    }

    /// Raw presence stream, decoded with [`decode_event`].
    pub async fn subscribe_presence(&self) -> RelayResult<broadcast::Receiver<String>> {
        self.broker.subscribe(PRESENCE_CHANNEL).await
    }

    /// Stop every listener.
    pub fn shutdown(&self) {
        self.channels.clear();
        RelayMetrics::set_channels(0);
    }
}

pub fn decode_event(payload: &str) -> RelayResult<ServerEvent> {
    Ok(serde_json::from_str(payload)?)
}

async fn forward(
    session_id: String,
    mut receiver: broadcast::Receiver<String>,
    subscribers: Subscribers,
) {
    loop {
        let payload = match receiver.recv().await {
            Ok(payload) => payload,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(session_id = %session_id, skipped, "Relay listener lagged, events dropped");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        let event = match decode_event(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(session_id = %session_id, "Dropping undecodable relay payload: {}", e);
                continue;
            }
        };

        let targets: Vec<(String, Arc<dyn EventSink>)> = subscribers
            .read()
            .iter()
            .map(|(id, sink)| (id.clone(), sink.clone()))
            .collect();

        for (connection_id, sink) in targets {
            match sink.deliver(&event) {
                Ok(()) => RelayMetrics::record_delivered(),
                Err(e) => {
                    RelayMetrics::record_delivery_failure();
                    debug!(session_id = %session_id, connection_id = %connection_id, "Delivery dropped: {}", e);
                }
            }
        }
    }
    debug!(session_id = %session_id, "Relay listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use parley_core::{ErrorCode, TokenUsage};
    use std::time::Duration;
    use tokio::time::timeout;

    fn relay() -> Relay {
        Relay::new(Arc::new(InMemoryBroker::default()))
    }

    fn sink() -> (Arc<dyn EventSink>, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(tx), rx)
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("sink closed")
    }

    #[tokio::test]
    async fn test_chunks_arrive_in_order() {
        let relay = relay();
        let (sink, mut rx) = sink();
        relay.subscribe("s1", "c1", sink).await.unwrap();

        for chunk in ["a", "b", "c"] {
            relay.publish("s1", &ServerEvent::chunk(chunk)).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            assert_eq!(next(&mut rx).await, ServerEvent::chunk(expected));
        }
    }

    #[tokio::test]
    async fn test_every_subscriber_gets_each_event_once() {
        let relay = relay();
        let (sink1, mut rx1) = sink();
        let (sink2, mut rx2) = sink();
        relay.subscribe("s1", "c1", sink1).await.unwrap();
        relay.subscribe("s1", "c2", sink2).await.unwrap();
        assert_eq!(relay.channel_count(), 1);
        assert_eq!(relay.subscriber_count("s1"), 2);

        relay.publish("s1", &ServerEvent::chunk("hi")).await.unwrap();
        let end = ServerEvent::End {
            message_id: None,
            usage: TokenUsage::new(1, 1),
        };
        relay.publish("s1", &end).await.unwrap();

        for rx in [&mut rx1, &mut rx2] {
            assert_eq!(next(rx).await, ServerEvent::chunk("hi"));
            assert_eq!(next(rx).await, end);
            assert!(rx.try_recv().is_err());
        }
    }

    #[tokio::test]
    async fn test_late_subscriber_misses_earlier_events() {
        let relay = relay();
        let (early, mut early_rx) = sink();
        relay.subscribe("s1", "early", early).await.unwrap();
        relay.publish("s1", &ServerEvent::chunk("first")).await.unwrap();
        assert_eq!(next(&mut early_rx).await, ServerEvent::chunk("first"));

        let (late, mut late_rx) = sink();
        relay.subscribe("s1", "late", late).await.unwrap();
        relay.publish("s1", &ServerEvent::chunk("second")).await.unwrap();

        assert_eq!(next(&mut late_rx).await, ServerEvent::chunk("second"));
        assert_eq!(next(&mut early_rx).await, ServerEvent::chunk("second"));
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery_and_closes_channel() {
        let relay = relay();
        let (sink1, mut rx1) = sink();
        let (sink2, mut rx2) = sink();
        relay.subscribe("s1", "c1", sink1).await.unwrap();
        relay.subscribe("s1", "c2", sink2).await.unwrap();

        relay.unsubscribe("s1", "c1");
        relay.unsubscribe("s1", "unknown");
        relay
            .publish("s1", &ServerEvent::error(ErrorCode::GenerationFailed, "x"))
            .await
            .unwrap();
        assert!(matches!(next(&mut rx2).await, ServerEvent::Error { .. }));
        assert!(rx1.try_recv().is_err());

        relay.unsubscribe("s1", "c2");
        assert_eq!(relay.channel_count(), 0);
        assert_eq!(relay.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_closed_sink_does_not_block_others() {
        let relay = relay();
        let (gone, gone_rx) = sink();
        let (live, mut live_rx) = sink();
        relay.subscribe("s1", "gone", gone).await.unwrap();
        relay.subscribe("s1", "live", live).await.unwrap();
        drop(gone_rx);

        relay.publish("s1", &ServerEvent::chunk("still here")).await.unwrap();
        assert_eq!(next(&mut live_rx).await, ServerEvent::chunk("still here"));
    }

    #[tokio::test]
    async fn test_presence_channel() {
        let relay = relay();
        let mut presence = relay.subscribe_presence().await.unwrap();
        let event = ServerEvent::Presence {
            user_id: "alice".to_string(),
            status: parley_core::PresenceStatus::Online,
        };

        relay.publish_presence(&event).await.unwrap();
        let payload = presence.recv().await.unwrap();
        assert_eq!(decode_event(&payload).unwrap(), event);
    }

    #[test]
    fn test_channel_names() {
        assert_eq!(session_channel("abc"), "chat:abc");
        assert_eq!(PRESENCE_CHANNEL, "presence");
    }
}
