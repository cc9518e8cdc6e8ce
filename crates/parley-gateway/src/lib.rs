//! Parley Gateway - WebSocket front end for chat sessions
//!
//! Owns live connections, room membership and presence, and turns client
//! frames into dispatched turns. Turn output reaches sockets through the
//! relay, so any gateway process can serve a room.

mod connection;
mod error;
mod gateway;
mod protocol;
mod room;

pub use connection::ConnectionHandle;
pub use error::{GatewayError, GatewayResult, RoomError, RoomResult};
pub use gateway::Gateway;
pub use protocol::ClientMessage;
pub use room::RoomManager;
