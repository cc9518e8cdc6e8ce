//! Connection and room registry
//!
//! `RoomManager` owns the connection registry, the room membership index
//! and per-user presence counts. Callers inject it; there is no global.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parley_core::{AgentSettings, Message, PresenceStatus, ServerEvent, Session};
use parley_memory::TieredMemoryManager;
use parley_observability::ConnectionMetrics;
use parley_queue::TurnRequest;
use parley_relay::{EventSink, Relay};
use parley_runner::TurnDispatcher;
use parley_session::ChatStore;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::connection::ConnectionHandle;
use crate::error::{RoomError, RoomResult};
use crate::protocol::ClientMessage;

#[derive(Debug, Clone)]
struct ConnectionEntry {
    handle: ConnectionHandle,
    room: Option<String>,
}

pub struct RoomManager {
    connections: DashMap<String, ConnectionEntry>,
    /// session id -> connection ids
    rooms: DashMap<String, HashSet<String>>,
    /// user id -> live connection count
    presence: DashMap<String, usize>,
    /// Serializes presence count changes with their publish
    presence_gate: Mutex<()>,
    store: Arc<dyn ChatStore>,
    relay: Relay,
    dispatcher: TurnDispatcher,
    memory: Arc<TieredMemoryManager>,
}

impl std::fmt::Debug for RoomManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomManager")
            .field("connections", &self.connections.len())
            .field("rooms", &self.rooms.len())
            .field("online_users", &self.presence.len())
            .finish()
    }
}

impl RoomManager {
    pub fn new(
        store: Arc<dyn ChatStore>,
        relay: Relay,
        dispatcher: TurnDispatcher,
        memory: Arc<TieredMemoryManager>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            rooms: DashMap::new(),
            presence: DashMap::new(),
            presence_gate: Mutex::new(()),
            store,
            relay,
            dispatcher,
            memory,
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_online(&self, user_id: &str) -> bool {
        self.presence.contains_key(user_id)
    }

    /// Room the connection is bound to
    pub fn room_of(&self, connection_id: &str) -> Option<String> {
        self.connections
            .get(connection_id)
            .and_then(|entry| entry.room.clone())
    }

    pub fn members(&self, session_id: &str) -> Vec<String> {
        self.rooms
            .get(session_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Register a connection. The first connection of a user publishes
    /// presence "online"; further ones do not.
    pub async fn connect(&self, handle: ConnectionHandle) -> RoomResult<()> {
        let connection_id = handle.id.clone();
        let user_id = handle.user_id.clone();

        match self.connections.entry(connection_id.clone()) {
            Entry::Occupied(_) => return Err(RoomError::AlreadyConnected),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionEntry {
                    handle: handle.clone(),
                    room: None,
                });
            }
        }

        ConnectionMetrics::increment_active();
        let _ = handle.send(ServerEvent::Connected {
            connection_id: connection_id.clone(),
            user_id: user_id.clone(),
        });

        {
            let _gate = self.presence_gate.lock().await;
            let first = {
                let mut count = self.presence.entry(user_id.clone()).or_insert(0);
                *count += 1;
                *count == 1
            };
            if first {
                self.publish_presence(&user_id, PresenceStatus::Online).await;
            }
        }
        info!(connection_id = %connection_id, user_id = %user_id, "Connection registered");
        Ok(())
    }

    /// Unregister a connection, leaving its room first. The user goes
    /// offline when this was their last connection. Unknown ids are ignored.
    pub async fn disconnect(&self, connection_id: &str) {
        if let Err(e) = self.leave_room(connection_id).await {
            warn!(connection_id, "Leave on disconnect failed: {}", e);
        }

        let Some((_, entry)) = self.connections.remove(connection_id) else {
            return;
        };
        ConnectionMetrics::decrement_active();

        let user_id = entry.handle.user_id;
        {
            let _gate = self.presence_gate.lock().await;
            let last = self
                .presence
                .remove_if_mut(&user_id, |_, count| {
                    *count = count.saturating_sub(1);
                    *count == 0
                })
                .is_some();
            if last {
                self.publish_presence(&user_id, PresenceStatus::Offline).await;
            }
        }
        info!(connection_id, user_id = %user_id, "Connection closed");
    }

    /// Bind the connection to a session it owns and subscribe it to the
    /// session's relay channel.
    pub async fn join_room(&self, connection_id: &str, session_id: &str) -> RoomResult<Session> {
        let handle = self.connection(connection_id)?;
        if let Some(current) = self.room_of(connection_id) {
            return Err(RoomError::AlreadyInRoom(current));
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| RoomError::SessionNotFound(session_id.to_string()))?;
        if !session.is_owned_by(&handle.user_id) {
            warn!(connection_id, user_id = %handle.user_id, session_id, "Unauthorized room join");
            return Err(RoomError::Unauthorized {
                user_id: handle.user_id,
                session_id: session_id.to_string(),
            });
        }

        self.bind(&handle, session_id).await?;
        let _ = handle.send(ServerEvent::RoomJoined {
            chat_id: session_id.to_string(),
            message: format!("Joined chat {}", session_id),
        });
        Ok(session)
    }

    /// Create a session owned by the connection's user and join it.
    pub async fn create_room(
        &self,
        connection_id: &str,
        agent_id: Option<String>,
        title: Option<String>,
    ) -> RoomResult<Session> {
        let handle = self.connection(connection_id)?;
        if let Some(current) = self.room_of(connection_id) {
            return Err(RoomError::AlreadyInRoom(current));
        }

        let mut session = Session::new(handle.user_id.clone()).with_settings(AgentSettings {
            agent_id: agent_id.clone(),
            ..AgentSettings::default()
        });
        if let Some(title) = title {
            session = session.with_title(title);
        }
        self.store.create_session(&session).await?;

        self.bind(&handle, &session.id).await?;
        let _ = handle.send(ServerEvent::RoomCreated {
            chat_id: session.id.clone(),
            user_id: handle.user_id.clone(),
            agent_id,
            created_at: session.created_at,
        });
        info!(connection_id, session_id = %session.id, "Room created");
        Ok(session)
    }

    async fn bind(&self, handle: &ConnectionHandle, session_id: &str) -> RoomResult<()> {
        {
            let mut entry = self
                .connections
                .get_mut(&handle.id)
                .ok_or_else(|| RoomError::NotConnected(handle.id.clone()))?;
            if let Some(ref current) = entry.room {
                return Err(RoomError::AlreadyInRoom(current.clone()));
            }
            entry.room = Some(session_id.to_string());
        }

        let sink: Arc<dyn EventSink> = Arc::new(handle.clone());
        if let Err(e) = self.relay.subscribe(session_id, &handle.id, sink).await {
            if let Some(mut entry) = self.connections.get_mut(&handle.id) {
                entry.room = None;
            }
            return Err(e.into());
        }

        self.rooms
            .entry(session_id.to_string())
            .or_default()
            .insert(handle.id.clone());

        self.broadcast_except(
            session_id,
            &handle.id,
            &ServerEvent::UserJoined {
                user_id: handle.user_id.clone(),
                chat_id: session_id.to_string(),
            },
        );
        debug!(connection_id = %handle.id, session_id, "Joined room");
        Ok(())
    }

    /// Leave the current room. Returns the room left, `None` when the
    /// connection was not in one.
    pub async fn leave_room(&self, connection_id: &str) -> RoomResult<Option<String>> {
        let (handle, session_id) = {
            let Some(mut entry) = self.connections.get_mut(connection_id) else {
                return Ok(None);
            };
            let Some(session_id) = entry.room.take() else {
                return Ok(None);
            };
            (entry.handle.clone(), session_id)
        };

        if let Some(mut members) = self.rooms.get_mut(&session_id) {
            members.remove(connection_id);
        }
        self.rooms.remove_if(&session_id, |_, members| members.is_empty());
        self.relay.unsubscribe(&session_id, connection_id);

        let _ = handle.send(ServerEvent::RoomLeft {
            chat_id: session_id.clone(),
        });
        self.broadcast(
            &session_id,
            &ServerEvent::UserLeft {
                user_id: handle.user_id,
                chat_id: session_id.clone(),
            },
        );
        debug!(connection_id, session_id = %session_id, "Left room");
        Ok(Some(session_id))
    }

    /// Persist a user message, mirror it into memory and dispatch the turn.
    /// Returns the `message_sent` acknowledgement.
    pub async fn send_message(
        &self,
        connection_id: &str,
        session_id: &str,
        content: &str,
    ) -> RoomResult<ServerEvent> {
        let handle = self.connection(connection_id)?;
        if self.room_of(connection_id).as_deref() != Some(session_id) {
            return Err(RoomError::NotInRoom(session_id.to_string()));
        }
        if content.trim().is_empty() {
            return Err(RoomError::InvalidMessage("message is empty".to_string()));
        }

        let session = self
            .store
            .get_session(session_id)
            .await?
            .ok_or_else(|| RoomError::SessionNotFound(session_id.to_string()))?;

        // refill an empty fast tier before the new message lands in it
        let history = self
            .store
            .history(session_id, Some(self.memory.window_size()))
            .await?;
        if let Err(e) = self.memory.restore_from_history(session_id, &history).await {
            warn!(session_id, "Fast tier restore failed: {}", e);
        }

        let message = Message::user(content);
        let count = self.store.append_message(session_id, &message).await?;
        if let Err(e) = self.memory.add_message(session_id, &message, count).await {
            warn!(session_id, "Failed to mirror user message into memory: {}", e);
        }

        let turn = turn_request(&session, &handle.user_id, &message);
        let job = self.dispatcher.submit(turn).await?;

        let ack = ServerEvent::MessageSent {
            message_id: message.id,
            chat_id: session_id.to_string(),
            job_id: job.id,
            timestamp: Utc::now(),
        };
        let _ = handle.send(ack.clone());
        Ok(ack)
    }

    /// Apply one client frame from a registered connection.
    pub async fn handle(&self, connection_id: &str, message: ClientMessage) -> RoomResult<()> {
        match message {
            ClientMessage::Connect { .. } => Err(RoomError::AlreadyConnected),
            ClientMessage::JoinRoom { chat_id } => {
                self.join_room(connection_id, &chat_id).await.map(|_| ())
            }
            ClientMessage::CreateRoom {
                agent_id,
                title,
                message,
            } => {
                let session = self.create_room(connection_id, agent_id, title).await?;
                if let Some(text) = message.filter(|m| !m.trim().is_empty()) {
                    self.send_message(connection_id, &session.id, &text).await?;
                }
                Ok(())
            }
            ClientMessage::LeaveRoom => self.leave_room(connection_id).await.map(|_| ()),
            ClientMessage::Message { chat_id, content } => self
                .send_message(connection_id, &chat_id, &content)
                .await
                .map(|_| ()),
            ClientMessage::Ping { .. } => {
                let handle = self.connection(connection_id)?;
                handle.touch().await;
                let _ = handle.send(ServerEvent::Pong {
                    timestamp: Utc::now().timestamp_millis(),
                });
                Ok(())
            }
        }
    }

    /// Deliver to every connection bound to the room. Returns how many
    /// connections accepted the event.
    pub fn broadcast(&self, session_id: &str, event: &ServerEvent) -> usize {
        self.broadcast_except(session_id, "", event)
    }

    fn broadcast_except(&self, session_id: &str, skip: &str, event: &ServerEvent) -> usize {
        let members = self.members(session_id);
        let mut delivered = 0;
        for connection_id in members.iter().filter(|id| id.as_str() != skip) {
            let handle = match self.connections.get(connection_id) {
                Some(entry) => entry.handle.clone(),
                None => continue,
            };
            match handle.send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!(connection_id = %connection_id, "Broadcast dropped: {}", e),
            }
        }
        delivered
    }

    /// Deliver to every registered connection.
    pub fn broadcast_all(&self, event: &ServerEvent) -> usize {
        let handles: Vec<ConnectionHandle> = self
            .connections
            .iter()
            .map(|entry| entry.handle.clone())
            .collect();
        handles
            .into_iter()
            .filter(|handle| handle.send(event.clone()).is_ok())
            .count()
    }

    fn connection(&self, connection_id: &str) -> RoomResult<ConnectionHandle> {
        self.connections
            .get(connection_id)
            .map(|entry| entry.handle.clone())
            .ok_or_else(|| RoomError::NotConnected(connection_id.to_string()))
    }

    async fn publish_presence(&self, user_id: &str, status: PresenceStatus) {
        let event = ServerEvent::Presence {
            user_id: user_id.to_string(),
            status,
        };
        if let Err(e) = self.relay.publish_presence(&event).await {
            warn!(user_id, "Failed to publish presence: {}", e);
        }
    }
}

fn turn_request(session: &Session, user_id: &str, message: &Message) -> TurnRequest {
    let settings = &session.settings;
    let mut turn = TurnRequest::new(&session.id, user_id, &message.content, &message.id);
    if let Some(ref model) = settings.model_id {
        turn = turn.with_model(model);
    }
    if let Some(ref prompt) = settings.system_prompt {
        turn = turn.with_system_prompt(prompt);
    }
    if let Some(ref agent) = settings.agent_id {
        turn = turn.with_agent(agent);
    }
    if let Some(t) = settings.temperature {
        turn = turn.with_temperature(t);
    }
    if let Some(max) = settings.max_tokens {
        turn = turn.with_max_tokens(max);
    }
    turn
}
