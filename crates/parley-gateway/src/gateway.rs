//! Gateway main structure
//!
//! The WebSocket server: accepts sockets, registers connections with the
//! [`RoomManager`] and pumps events in both directions.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parley_config::GatewayConfig;
use parley_core::{ErrorCode, ServerEvent};
use parley_observability::{connection_span, ConnectionMetrics};
use parley_relay::decode_event;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::{GatewayResult, RoomError};
use crate::protocol::ClientMessage;
use crate::room::RoomManager;

/// Missed heartbeats before a silent connection is dropped
const HEARTBEAT_MISSES: u32 = 3;

/// The main Gateway server
#[derive(Debug, Clone)]
pub struct Gateway {
    config: GatewayConfig,
    rooms: Arc<RoomManager>,
}

impl Gateway {
    pub fn new(config: GatewayConfig, rooms: Arc<RoomManager>) -> Self {
        Self { config, rooms }
    }

    pub fn rooms(&self) -> &Arc<RoomManager> {
        &self.rooms
    }

    /// Bind the configured address and serve until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) -> GatewayResult<()> {
        let addr: SocketAddr = self.config.bind.parse()?;
        let listener = TcpListener::bind(&addr).await?;
        self.serve(listener, shutdown).await
    }

    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> GatewayResult<()> {
        info!("Gateway listening on ws://{}", listener.local_addr()?);
        let presence = self.spawn_presence_forwarder(shutdown.clone()).await?;

        loop {
            let (stream, peer_addr) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
            };
            debug!("New connection from {}", peer_addr);

            if self.rooms.connection_count() >= self.config.max_connections {
                warn!("Connection limit reached, rejecting {}", peer_addr);
                ConnectionMetrics::record_rejected();
                tokio::spawn(async move {
                    if let Err(e) = reject_connection(stream, "Server at capacity").await {
                        debug!("Reject of {} failed: {}", peer_addr, e);
                    }
                });
                continue;
            }

            let gateway = self.clone();
            let token = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = gateway.handle_connection(stream, peer_addr, token).await {
                    error!("Connection error for {}: {}", peer_addr, e);
                }
            });
        }

        presence.abort();
        info!("Gateway stopped");
        Ok(())
    }

    /// Forward broker presence changes to every local connection.
    async fn spawn_presence_forwarder(&self, shutdown: CancellationToken) -> GatewayResult<JoinHandle<()>> {
        let mut presence = self
            .rooms
            .relay()
            .subscribe_presence()
            .await
            .map_err(RoomError::from)?;
        let rooms = self.rooms.clone();

        Ok(tokio::spawn(async move {
            loop {
                let payload = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = presence.recv() => match received {
                        Ok(payload) => payload,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Presence forwarder lagged");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                };
                match decode_event(&payload) {
                    Ok(event) => {
                        rooms.broadcast_all(&event);
                    }
                    Err(e) => warn!("Dropping bad presence payload: {}", e),
                }
            }
        }))
    }

    async fn handle_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> GatewayResult<()> {
        let ws_stream = accept_async(stream).await?;
        let connection_id = Uuid::new_v4().to_string();
        let span = connection_span(&connection_id, None);

        self.pump(ws_stream, connection_id, addr, shutdown)
            .instrument(span)
            .await
    }

    async fn pump(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        connection_id: String,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> GatewayResult<()> {
        let (mut sender, mut receiver) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
        let mut registered: Option<ConnectionHandle> = None;

        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,

                Some(event) = rx.recv() => {
                    let json = match serde_json::to_string(&event) {
                        Ok(json) => json,
                        Err(e) => {
                            error!("Failed to serialize event: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = sender.send(Message::Text(json)).await {
                        warn!("Failed to send to {}: {}", addr, e);
                        break;
                    }
                }

                _ = heartbeat.tick() => {
                    if let Some(ref handle) = registered {
                        if handle.idle_for().await > heartbeat_interval * HEARTBEAT_MISSES {
                            warn!("Heartbeat timeout for {}", addr);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Vec::new())).await.is_err() {
                        break;
                    }
                }

                msg = receiver.next() => {
                    let msg = match msg {
                        Some(Ok(msg)) => msg,
                        Some(Err(e)) => {
                            warn!("WebSocket error on {}: {}", addr, e);
                            break;
                        }
                        None => break,
                    };
                    if let Some(ref handle) = registered {
                        handle.touch().await;
                    }

                    match msg {
                        Message::Text(text) => {
                            let parsed = serde_json::from_str::<ClientMessage>(&text);
                            match (parsed, registered.clone()) {
                                (Ok(ClientMessage::Connect { user_id, token }), None) => {
                                    if !self.token_accepted(token.as_deref()) || user_id.trim().is_empty() {
                                        let event = RoomError::InvalidToken.to_event();
                                        sender.send(Message::Text(serde_json::to_string(&event)?)).await?;
                                        break;
                                    }
                                    let handle = ConnectionHandle::new(connection_id.clone(), user_id, addr, tx.clone());
                                    self.rooms.connect(handle.clone()).await?;
                                    registered = Some(handle);
                                }
                                (Ok(message), Some(handle)) => {
                                    let kind = message.kind();
                                    if let Err(e) = self.rooms.handle(&handle.id, message).await {
                                        debug!(kind, "Client message rejected: {}", e);
                                        let _ = handle.send(e.to_event());
                                    }
                                }
                                (Ok(_), None) => {
                                    let _ = tx.send(ServerEvent::error(ErrorCode::NotConnected, "Send connect first"));
                                }
                                (Err(e), _) => {
                                    debug!("Invalid message from {}: {}", addr, e);
                                    let _ = tx.send(ServerEvent::error(
                                        ErrorCode::InvalidMessage,
                                        format!("Failed to parse message: {}", e),
                                    ));
                                }
                            }
                        }
                        Message::Ping(data) => {
                            if sender.send(Message::Pong(data)).await.is_err() {
                                break;
                            }
                        }
                        Message::Close(_) => {
                            debug!("Connection {} closed by client", addr);
                            break;
                        }
                        _ => {}
                    }
                }
            }
        }

        // a running turn keeps going, only this socket stops receiving it
        if let Some(handle) = registered {
            self.rooms.disconnect(&handle.id).await;
        }
        let _ = sender.close().await;
        debug!("Connection {} finished", addr);
        Ok(())
    }

    fn token_accepted(&self, token: Option<&str>) -> bool {
        match self.config.auth_token.as_deref() {
            Some(required) => token == Some(required),
            None => true,
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Gateway({})", self.config.bind)
    }
}

/// Send a capacity error and close.
async fn reject_connection(stream: TcpStream, reason: &str) -> GatewayResult<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut sender, _) = ws_stream.split();
    let event = ServerEvent::error(ErrorCode::CapacityExceeded, reason);
    sender.send(Message::Text(serde_json::to_string(&event)?)).await?;
    sender.close().await?;
    Ok(())
}
