use thiserror::Error;

/// Relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Broker error: {0}")]
    Broker(String),

    #[error("Delivery to {connection_id} failed: {message}")]
    Delivery {
        connection_id: String,
        message: String,
    },

    #[error("Channel closed")]
    ChannelClosed,
}

impl RelayError {
    pub fn broker(message: impl Into<String>) -> Self {
        Self::Broker(message.into())
    }

    pub fn delivery(connection_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            connection_id: connection_id.into(),
            message: message.into(),
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;
