//! Relay: delivers turn events keyed by session to every live connection
//! subscribed to that session, whichever process produced them.

pub mod broker;
pub mod error;
pub mod relay;

pub use broker::{Broker, InMemoryBroker, DEFAULT_CHANNEL_CAPACITY};
pub use error::{RelayError, RelayResult};
pub use relay::{decode_event, session_channel, EventSink, Relay, PRESENCE_CHANNEL};
