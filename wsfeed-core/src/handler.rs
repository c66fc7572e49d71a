//! Venue capability interface

use serde_json::Value;

use crate::error::ClientResult;
use crate::types::ChannelName;

/// Venue-specific behavior injected into a [`crate::StreamClient`]
///
/// Callbacks run on the client's supervisor task. Errors and panics raised
/// there, including by `subscribe_payload` during resync, are logged and
/// counted, never propagated.
pub trait ClientHandler: Send + Sync + 'static {
    /// Called once per successful connection or reconnection
    fn on_connection_established(&self) {}

    /// Called for every inbound frame that parses as JSON
    fn on_message(&self, message: &Value) -> anyhow::Result<()>;

    /// Called for every inbound frame that does not parse as JSON, and for
    /// structured frames too when [`ClientHandler::also_deliver_raw`] is set
    fn on_raw_message(&self, message: &str) -> anyhow::Result<()>;

    /// Wire payload for a (un)subscribe request on `channel`
    ///
    /// Must only differ between the two variants in the subscribe marker.
    /// Return [`crate::ClientError::PayloadFormat`] for malformed channel names.
    fn subscribe_payload(&self, channel: &ChannelName, unsubscribe: bool) -> ClientResult<String>;

    fn also_deliver_raw(&self) -> bool {
        false
    }
}
