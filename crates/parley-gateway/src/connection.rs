//! Live connection handles

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parley_core::ServerEvent;
use parley_relay::{EventSink, RelayError, RelayResult};
use tokio::sync::{mpsc, RwLock};

/// Handle to a WebSocket connection for sending events
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: String,
    pub user_id: String,
    pub addr: SocketAddr,
    sender: mpsc::UnboundedSender<ServerEvent>,
    /// Last frame received from the client
    last_seen: Arc<RwLock<Instant>>,
}

impl ConnectionHandle {
    pub fn new(
        id: impl Into<String>,
        user_id: impl Into<String>,
        addr: SocketAddr,
        sender: mpsc::UnboundedSender<ServerEvent>,
    ) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            addr,
            sender,
            last_seen: Arc::new(RwLock::new(Instant::now())),
        }
    }

    /// Queue an event for the socket writer.
    pub fn send(&self, event: ServerEvent) -> RelayResult<()> {
        self.sender.send(event).map_err(|_| RelayError::Delivery {
            connection_id: self.id.clone(),
            message: "connection closed".to_string(),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub async fn touch(&self) {
        *self.last_seen.write().await = Instant::now();
    }

    pub async fn idle_for(&self) -> Duration {
        self.last_seen.read().await.elapsed()
    }
}

impl EventSink for ConnectionHandle {
    fn deliver(&self, event: &ServerEvent) -> RelayResult<()> {
        self.send(event.clone())
    }
}
