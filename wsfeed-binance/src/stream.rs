//! Binance market data stream handler

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use wsfeed_core::{ChannelName, ClientError, ClientHandler, ClientResult};

/// Substring of the reply Binance sends for an accepted SUBSCRIBE/UNSUBSCRIBE
pub const SUBSCRIBE_ACK_KEY: &str = "\"result\":null";

/// Handler for `stream.binance.com` combined-stream connections
///
/// Channels are stream names such as `btcusdt@trade`. Market events are
/// forwarded to the receiver returned by [`BinanceStreamHandler::new`].
pub struct BinanceStreamHandler {
    request_id: u64,
    events: mpsc::UnboundedSender<Value>,
}

impl BinanceStreamHandler {
    pub fn new(request_id: u64) -> (Self, mpsc::UnboundedReceiver<Value>) {
        let (events, rx) = mpsc::unbounded_channel();
        (Self { request_id, events }, rx)
    }

    fn validate_channel(channel: &ChannelName) -> ClientResult<()> {
        let name = channel.as_str();
        if name.is_empty() {
            return Err(ClientError::payload_format(channel, "stream name is empty"));
        }
        if !name.is_ascii() {
            return Err(ClientError::payload_format(channel, "stream name must be ASCII"));
        }
        if name.contains(char::is_whitespace) {
            return Err(ClientError::payload_format(channel, "stream name contains whitespace"));
        }
        if !name.contains('@') {
            return Err(ClientError::payload_format(
                channel,
                "stream name must look like <symbol>@<stream>",
            ));
        }
        Ok(())
    }
}

impl ClientHandler for BinanceStreamHandler {
    fn on_connection_established(&self) {
        info!("Binance stream connection ready");
    }

    fn on_message(&self, message: &Value) -> anyhow::Result<()> {
        // Replies to our own requests: {"result":null,"id":1} or {"error":{...},"id":1}
        if message.get("id").is_some() {
            if let Some(error) = message.get("error") {
                warn!("Binance rejected request: {}", error);
            } else {
                debug!("Binance request reply: {}", message);
            }
            return Ok(());
        }

        if self.events.send(message.clone()).is_err() {
            debug!("Market event receiver dropped, discarding event");
        }
        Ok(())
    }

    fn on_raw_message(&self, message: &str) -> anyhow::Result<()> {
        warn!("Unexpected non-JSON frame from Binance: {}", message);
        Ok(())
    }

    fn subscribe_payload(&self, channel: &ChannelName, unsubscribe: bool) -> ClientResult<String> {
        Self::validate_channel(channel)?;
        let method = if unsubscribe { "UNSUBSCRIBE" } else { "SUBSCRIBE" };
        Ok(json!({
            "method": method,
            "params": [channel.as_str()],
            "id": self.request_id,
        })
        .to_string())
    }
}
