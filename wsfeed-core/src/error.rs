//! Client error types

use crate::types::ChannelName;

/// Custom result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

/// Error types surfaced by the stream client
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    #[error("Connection error: {message}")]
    Connection { message: String },

    #[error("Connection closed: {reason}")]
    ConnectionClosed { reason: String },

    #[error("Subscription request for {channel} dropped after {attempts} attempts")]
    SubscriptionTimeout { channel: ChannelName, attempts: u32 },

    #[error("Cannot build payload for channel '{channel}': {reason}")]
    PayloadFormat { channel: ChannelName, reason: String },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Client has been shut down")]
    Shutdown,
}

impl ClientError {
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into() }
    }

    pub fn connection_closed(reason: impl Into<String>) -> Self {
        Self::ConnectionClosed { reason: reason.into() }
    }

    pub fn payload_format(channel: &ChannelName, reason: impl Into<String>) -> Self {
        Self::PayloadFormat {
            channel: channel.clone(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config { message: message.into() }
    }

    /// Whether the supervisor may recover from this error by reconnecting
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::ConnectionClosed { .. })
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<url::ParseError> for ClientError {
    fn from(err: url::ParseError) -> Self {
        Self::Config {
            message: format!("Invalid endpoint URL: {}", err),
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for ClientError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Connection { message: err.to_string() }
    }
}
