//! Duplex frame transport

use async_trait::async_trait;
use futures_util::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info};
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Data frame delivered by a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = ClientError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = ClientResult<InboundFrame>> + Send>>;

/// One established connection. The stream ends (or yields an error) when
/// the remote closes or the connection fails.
pub struct TransportConnection {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl TransportConnection {
    pub fn new(sink: FrameSink, stream: FrameStream) -> Self {
        Self { sink, stream }
    }
}

/// Opens connections to an endpoint
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn connect(&self, endpoint: &Url) -> ClientResult<TransportConnection>;
}

/// WebSocket transport backed by tokio-tungstenite
#[derive(Debug, Clone)]
pub struct TungsteniteTransport {
    connect_timeout: Duration,
}

impl TungsteniteTransport {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for TungsteniteTransport {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(&self, endpoint: &Url) -> ClientResult<TransportConnection> {
        let (ws_stream, _) = timeout(self.connect_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                ClientError::connection(format!(
                    "Timed out after {:?} connecting to {}",
                    self.connect_timeout, endpoint
                ))
            })?
            .map_err(|e| ClientError::connection(format!("WebSocket connection failed: {}", e)))?;

        info!("WebSocket connected to {}", endpoint);
        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(ClientError::from)
            .with(|payload: String| future::ready(Ok::<_, ClientError>(Message::Text(payload))));

        // Ping/pong replies are queued by tungstenite itself and flushed on the next write or read
        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(InboundFrame::Text(text))),
                Ok(Message::Binary(data)) => Some(Ok(InboundFrame::Binary(data))),
                Ok(Message::Close(frame)) => {
                    let reason = frame
                        .map(|f| format!("{} {}", f.code, f.reason))
                        .unwrap_or_else(|| "close frame".to_string());
                    Some(Err(ClientError::connection_closed(reason)))
                }
                Ok(other) => {
                    debug!("Ignoring control frame: {:?}", other);
                    None
                }
                Err(e) => Some(Err(ClientError::connection_closed(e.to_string()))),
            })
        });

        Ok(TransportConnection::new(Box::pin(sink), Box::pin(stream)))
    }
}
