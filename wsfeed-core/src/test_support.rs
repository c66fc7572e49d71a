//! In-memory transport and recording handler for unit tests

use async_trait::async_trait;
use futures_util::{sink, stream};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::handler::ClientHandler;
use crate::transport::{InboundFrame, Transport, TransportConnection};
use crate::types::ChannelName;

/// Transport whose connections are plain channels handed to the test
#[derive(Clone)]
pub struct MockTransport {
    fail_next: Arc<AtomicUsize>,
    reject_with: Arc<Mutex<Option<ClientError>>>,
    connects: Arc<AtomicUsize>,
    sessions: mpsc::UnboundedSender<MockSession>,
}

/// Test side of the connections opened through a [`MockTransport`]
pub struct MockSessions {
    rx: mpsc::UnboundedReceiver<MockSession>,
}

/// Remote end of one mock connection
pub struct MockSession {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: Option<mpsc::UnboundedSender<ClientResult<InboundFrame>>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockSessions) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fail_next: Arc::new(AtomicUsize::new(0)),
                reject_with: Arc::new(Mutex::new(None)),
                connects: Arc::new(AtomicUsize::new(0)),
                sessions: tx,
            },
            MockSessions { rx },
        )
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail the next connection attempt with `error`
    pub fn reject_next(&self, error: ClientError) {
        *self.reject_with.lock() = Some(error);
    }

    /// Connection attempts so far, failed ones included
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, endpoint: &Url) -> ClientResult<TransportConnection> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.reject_with.lock().take() {
            return Err(error);
        }
        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ClientError::connection(format!("mock refused {}", endpoint)));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<ClientResult<InboundFrame>>();

        let sink = sink::unfold(out_tx, |tx, payload: String| async move {
            tx.send(payload)
                .map_err(|_| ClientError::connection_closed("mock peer gone"))?;
            Ok::<_, ClientError>(tx)
        });
        let stream = stream::unfold(in_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        let _ = self.sessions.send(MockSession {
            outbound: out_rx,
            inbound: Some(in_tx),
        });
        Ok(TransportConnection::new(Box::pin(sink), Box::pin(stream)))
    }
}

impl MockSessions {
    pub async fn next(&mut self) -> MockSession {
        self.rx.recv().await.expect("mock transport dropped")
    }
}

impl MockSession {
    pub fn send_text(&self, text: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(InboundFrame::Text(text.to_string())));
        }
    }

    pub fn send_binary(&self, data: Vec<u8>) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Ok(InboundFrame::Binary(data)));
        }
    }

    /// Fail the connection as a transport error would
    pub fn fail(&self, reason: &str) {
        if let Some(inbound) = &self.inbound {
            let _ = inbound.send(Err(ClientError::connection_closed(reason)));
        }
    }

    /// End the inbound stream as a remote close would
    pub fn close(&mut self) {
        self.inbound = None;
    }

    pub async fn next_outbound(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    pub fn try_outbound(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }
}

/// Handler that records everything it is given
///
/// Payloads look like `{"op":"subscribe","args":["<channel>"]}`.
#[derive(Default)]
pub struct RecordingHandler {
    structured: Mutex<Vec<Value>>,
    raw: Mutex<Vec<String>>,
    connections: AtomicUsize,
    deliver_raw: bool,
    fail_next: AtomicBool,
    panic_next: AtomicBool,
    panic_next_payload: AtomicBool,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_raw_delivery(mut self) -> Self {
        self.deliver_raw = true;
        self
    }

    pub fn structured(&self) -> Vec<Value> {
        self.structured.lock().clone()
    }

    pub fn raw(&self) -> Vec<String> {
        self.raw.lock().clone()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn fail_next_message(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    pub fn panic_next_message(&self) {
        self.panic_next.store(true, Ordering::SeqCst);
    }

    pub fn panic_next_payload(&self) {
        self.panic_next_payload.store(true, Ordering::SeqCst);
    }
}

impl ClientHandler for RecordingHandler {
    fn on_connection_established(&self) {
        self.connections.fetch_add(1, Ordering::SeqCst);
    }

    fn on_message(&self, message: &Value) -> anyhow::Result<()> {
        if self.panic_next.swap(false, Ordering::SeqCst) {
            panic!("handler blew up");
        }
        if self.fail_next.swap(false, Ordering::SeqCst) {
            anyhow::bail!("handler rejected message");
        }
        self.structured.lock().push(message.clone());
        Ok(())
    }

    fn on_raw_message(&self, message: &str) -> anyhow::Result<()> {
        self.raw.lock().push(message.to_string());
        Ok(())
    }

    fn subscribe_payload(&self, channel: &ChannelName, unsubscribe: bool) -> ClientResult<String> {
        if self.panic_next_payload.swap(false, Ordering::SeqCst) {
            panic!("payload generator blew up");
        }
        if channel.as_str().trim().is_empty() || channel.as_str().contains(char::is_whitespace) {
            return Err(ClientError::payload_format(
                channel,
                "channel must be a single non-empty token",
            ));
        }
        let op = if unsubscribe { "unsubscribe" } else { "subscribe" };
        Ok(serde_json::json!({ "op": op, "args": [channel.as_str()] }).to_string())
    }

    fn also_deliver_raw(&self) -> bool {
        self.deliver_raw
    }
}
