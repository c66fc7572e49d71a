//! Reliable subscription client over a reconnecting exchange WebSocket
//!
//! Layers a subscription protocol on top of a bare duplex transport: pending
//! (un)subscribe requests are retried until acknowledged, confirmed channels are
//! replayed after every reconnect, and inbound frames are routed to a
//! venue-specific [`ClientHandler`].

pub mod client;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod send_queue;
pub mod subscription;
pub mod supervisor;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export main types for easy access
pub use client::{ClientHandle, StreamClient};
pub use config::ClientConfig;
pub use error::{ClientError, ClientResult};
pub use handler::ClientHandler;
pub use metrics::{ClientMetrics, MetricsSnapshot};
pub use subscription::{SubscriptionManager, SubscriptionRequest};
pub use transport::{InboundFrame, Transport, TransportConnection, TungsteniteTransport};
pub use types::{ChannelName, ChannelState, ConnectionState, SubscriptionEvent};
