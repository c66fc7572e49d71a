//! Connection lifecycle: session loop, reconnect with backoff, resync

use futures_util::{SinkExt, StreamExt};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::ClientConfig;
use crate::dispatcher::MessageDispatcher;
use crate::error::{ClientError, ClientResult};
use crate::handler::ClientHandler;
use crate::metrics::ClientMetrics;
use crate::send_queue::OutboundReceiver;
use crate::subscription::SharedSubscriptions;
use crate::transport::{Transport, TransportConnection};
use crate::types::ConnectionState;

/// Requests sent from the client façade to the supervisor task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SupervisorCommand {
    Reconnect { reason: String },
}

/// Why a session loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
enum SessionEnd {
    Closed(String),
    ReconnectRequested(String),
    Shutdown,
}

/// Clears the reconnect-in-progress flag however the sequence ends
struct ReconnectGuard(Arc<AtomicBool>);

impl Drop for ReconnectGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Exponential backoff: `base * 2^attempt`, saturating at `Duration::MAX`
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    2u32.checked_pow(attempt)
        .map_or(Duration::MAX, |factor| base.saturating_mul(factor))
}

/// Owns the connection state and the transport connection
pub struct ConnectionSupervisor {
    config: ClientConfig,
    endpoint: Url,
    direct_stream: bool,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn ClientHandler>,
    subscriptions: SharedSubscriptions,
    dispatcher: MessageDispatcher,
    state_tx: watch::Sender<ConnectionState>,
    metrics: Arc<ClientMetrics>,
    reconnecting: Arc<AtomicBool>,
}

impl ConnectionSupervisor {
    pub fn new(
        config: ClientConfig,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn ClientHandler>,
        subscriptions: SharedSubscriptions,
        metrics: Arc<ClientMetrics>,
        state_tx: watch::Sender<ConnectionState>,
        reconnecting: Arc<AtomicBool>,
    ) -> ClientResult<Self> {
        let endpoint = config.endpoint()?;
        let direct_stream = config.is_direct_stream()?;
        if direct_stream {
            info!("{} is a direct stream, confirmed channels will not be replayed", endpoint);
        }

        let dispatcher = MessageDispatcher::new(
            handler.clone(),
            subscriptions.clone(),
            metrics.clone(),
            config.log_traffic,
        );

        Ok(Self {
            config,
            endpoint,
            direct_stream,
            transport,
            handler,
            subscriptions,
            dispatcher,
            state_tx,
            metrics,
            reconnecting,
        })
    }

    pub fn is_direct_stream(&self) -> bool {
        self.direct_stream
    }

    pub(crate) fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    /// Single connection attempt
    pub async fn connect(&self) -> ClientResult<TransportConnection> {
        self.set_state(ConnectionState::Connecting);
        info!("Connecting to {}", self.endpoint);

        let connection = self.transport.connect(&self.endpoint).await.map_err(|e| {
            warn!("Connection to {} failed: {}", self.endpoint, e);
            e
        })?;

        self.set_state(ConnectionState::Connected);
        info!("Connected to {}", self.endpoint);

        if catch_unwind(AssertUnwindSafe(|| self.handler.on_connection_established())).is_err() {
            error!("Handler on_connection_established panicked");
            self.metrics.record_handler_fault();
        }
        Ok(connection)
    }

    /// Debounce, retry with backoff, then resync confirmed channels
    ///
    /// Returns `None` without doing anything if a sequence is already running,
    /// or after all attempts failed, leaving the state `Disconnected`.
    pub async fn reconnect(&self, reason: &str) -> Option<TransportConnection> {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            debug!("Reconnect already in progress, ignoring: {}", reason);
            return None;
        }
        let _guard = ReconnectGuard(self.reconnecting.clone());

        warn!("Reconnecting to {}: {}", self.endpoint, reason);
        self.set_state(ConnectionState::Reconnecting);
        tokio::time::sleep(self.config.reconnect_debounce).await;

        let max_attempts = self.config.max_reconnect_attempts;
        for attempt in 0..max_attempts {
            match self.connect().await {
                Ok(connection) => {
                    self.metrics.record_reconnection();
                    if self.direct_stream {
                        debug!("Direct stream endpoint, skipping resync");
                    } else {
                        let replayed = self.subscriptions.resync(|channel| {
                            let generate = || self.handler.subscribe_payload(channel, false);
                            catch_unwind(AssertUnwindSafe(generate)).unwrap_or_else(|_| {
                                self.metrics.record_handler_fault();
                                Err(ClientError::payload_format(
                                    channel,
                                    "payload generator panicked",
                                ))
                            })
                        });
                        info!("Resubscribing {} confirmed channel(s)", replayed);
                    }
                    return Some(connection);
                }
                Err(e) if !e.is_recoverable() => {
                    error!("Reconnect to {} cannot succeed: {}", self.endpoint, e);
                    break;
                }
                Err(e) => {
                    self.set_state(ConnectionState::Reconnecting);
                    warn!("Reconnect attempt {}/{} failed: {}", attempt + 1, max_attempts, e);
                    if attempt + 1 < max_attempts {
                        let delay = backoff_delay(self.config.reconnect_base_delay, attempt);
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }

        error!("Giving up on {}, client is disconnected", self.endpoint);
        self.set_state(ConnectionState::Disconnected);
        None
    }

    /// Supervisor task body; runs until `stop` is raised
    ///
    /// After reconnects are exhausted the task stays inert until the caller
    /// issues another reconnect.
    pub async fn run(
        self,
        first: TransportConnection,
        mut outbound: OutboundReceiver,
        mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
        mut stop: watch::Receiver<bool>,
    ) {
        let mut connection = Some(first);

        loop {
            let reason = match connection.take() {
                Some(mut conn) => {
                    let end = self
                        .run_session(&mut conn, &mut outbound, &mut commands, &mut stop)
                        .await;
                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Closed(reason) | SessionEnd::ReconnectRequested(reason) => {
                            reason
                        }
                    }
                }
                None => {
                    tokio::select! {
                        biased;
                        _ = stopped(&mut stop) => break,
                        command = commands.recv() => match command {
                            Some(SupervisorCommand::Reconnect { reason }) => reason,
                            None => break,
                        },
                    }
                }
            };

            connection = tokio::select! {
                biased;
                _ = stopped(&mut stop) => break,
                next = self.reconnect(&reason) => next,
            };

            // Coalesce requests that arrived while the sequence ran
            while let Ok(SupervisorCommand::Reconnect { reason }) = commands.try_recv() {
                debug!("Dropping reconnect request made during reconnect: {}", reason);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        debug!("Supervisor stopped");
    }

    async fn run_session(
        &self,
        conn: &mut TransportConnection,
        outbound: &mut OutboundReceiver,
        commands: &mut mpsc::UnboundedReceiver<SupervisorCommand>,
        stop: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        // Pending writes are polled ahead of inbound frames
        loop {
            tokio::select! {
                biased;
                _ = stopped(stop) => {
                    let _ = conn.sink.close().await;
                    return SessionEnd::Shutdown;
                }
                command = commands.recv() => match command {
                    Some(SupervisorCommand::Reconnect { reason }) => {
                        info!("Reconnect requested: {}", reason);
                        let _ = conn.sink.close().await;
                        return SessionEnd::ReconnectRequested(reason);
                    }
                    None => return SessionEnd::Shutdown,
                },
                payload = outbound.next(), if self.state_tx.borrow().can_flush() => match payload {
                    Some(payload) => {
                        if self.config.log_traffic {
                            debug!(">> {}", payload);
                        }
                        if let Err(e) = conn.sink.send(payload).await {
                            warn!("Write failed: {}", e);
                            return SessionEnd::Closed(e.to_string());
                        }
                        self.metrics.record_write();
                    }
                    None => return SessionEnd::Shutdown,
                },
                frame = conn.stream.next() => match frame {
                    Some(Ok(frame)) => {
                        self.dispatcher.dispatch(frame);
                    }
                    Some(Err(e)) => {
                        warn!("Connection lost: {}", e);
                        return SessionEnd::Closed(e.to_string());
                    }
                    None => {
                        warn!("Connection closed by remote");
                        return SessionEnd::Closed("stream ended".to_string());
                    }
                },
            }
        }
    }
}

/// Resolves once the stop flag is raised or its sender is gone
async fn stopped(stop: &mut watch::Receiver<bool>) {
    loop {
        let raised = *stop.borrow();
        if raised || stop.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::send_queue::send_queue;
    use crate::subscription::SubscriptionRequest;
    use crate::test_support::{MockTransport, RecordingHandler};

    struct Harness {
        supervisor: ConnectionSupervisor,
        transport: MockTransport,
        handler: Arc<RecordingHandler>,
        subscriptions: SharedSubscriptions,
        metrics: Arc<ClientMetrics>,
        state_rx: watch::Receiver<ConnectionState>,
        reconnecting: Arc<AtomicBool>,
    }

    fn harness(config: ClientConfig) -> (Harness, crate::test_support::MockSessions) {
        let (transport, sessions) = MockTransport::new();
        let handler = Arc::new(RecordingHandler::new());
        let subscriptions = SharedSubscriptions::new(config.retry_interval, config.max_retry_count);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let reconnecting = Arc::new(AtomicBool::new(false));
        let metrics = Arc::new(ClientMetrics::new());
        let supervisor = ConnectionSupervisor::new(
            config,
            Arc::new(transport.clone()),
            handler.clone(),
            subscriptions.clone(),
            metrics.clone(),
            state_tx,
            reconnecting.clone(),
        )
        .unwrap();
        (
            Harness {
                supervisor,
                transport,
                handler,
                subscriptions,
                metrics,
                state_rx,
                reconnecting,
            },
            sessions,
        )
    }

    #[test]
    fn test_backoff_doubles() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 0), Duration::from_millis(500));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 31), base * 2u32.pow(31));
        assert_eq!(backoff_delay(base, 32), Duration::MAX);
        assert_eq!(backoff_delay(base, 40), Duration::MAX);
    }

    #[tokio::test]
    async fn test_connect_failure_is_surfaced() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        h.transport.fail_next(1);
        assert!(h.supervisor.connect().await.is_err());
        assert_eq!(h.handler.connections(), 0);

        assert!(h.supervisor.connect().await.is_ok());
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(h.handler.connections(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_resyncs_confirmed_channels() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        h.subscriptions.request(SubscriptionRequest::subscribe("trades", "sub", "ok", true));
        assert!(h.subscriptions.acknowledge("ok"));
        h.subscriptions.request(SubscriptionRequest::subscribe("never-acked", "sub", "nope", true));

        h.transport.fail_next(2);
        let started = tokio::time::Instant::now();
        assert!(h.supervisor.reconnect("test").await.is_some());

        // debounce 500ms + backoff 500ms + 1s
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(started.elapsed() < Duration::from_millis(2100));
        assert_eq!(h.transport.connect_count(), 3);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);
        assert!(!h.reconnecting.load(Ordering::SeqCst));

        // never-acked still pending ahead of the replayed subscription
        assert_eq!(h.subscriptions.pending_len(), 2);
        let now = tokio::time::Instant::now().into_std();
        assert_eq!(h.subscriptions.poll(now), vec!["sub".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_exhaustion_leaves_disconnected() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        h.transport.fail_next(10);

        let started = tokio::time::Instant::now();
        assert!(h.supervisor.reconnect("test").await.is_none());
        // debounce 500ms + 500ms + 1s, no wait after the last failure
        assert!(started.elapsed() >= Duration::from_millis(2000));
        assert!(started.elapsed() < Duration::from_millis(2100));
        assert_eq!(h.transport.connect_count(), 3);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_direct_stream_skips_resync() {
        let config = ClientConfig::new("wss://stream.binance.com:9443/ws/btcusdt@trade");
        let (h, _sessions) = harness(config);
        assert!(h.supervisor.is_direct_stream());
        h.subscriptions.request(SubscriptionRequest::subscribe("trades", "sub", "ok", true));
        assert!(h.subscriptions.acknowledge("ok"));

        assert!(h.supervisor.reconnect("test").await.is_some());
        assert_eq!(h.subscriptions.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_payload_generator_skips_channel() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        for ch in ["first", "second"] {
            h.subscriptions.request(SubscriptionRequest::subscribe(ch, "sub", "ok", true));
            assert!(h.subscriptions.acknowledge("ok"));
        }

        h.handler.panic_next_payload();
        assert!(h.supervisor.reconnect("test").await.is_some());
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(h.metrics.snapshot().handler_faults, 1);

        // Only the channel whose payload was built is replayed
        assert_eq!(h.subscriptions.pending_len(), 1);
        let now = tokio::time::Instant::now().into_std();
        let replayed = h.subscriptions.poll(now);
        assert_eq!(replayed.len(), 1);
        let payload: serde_json::Value = serde_json::from_str(&replayed[0]).unwrap();
        assert_eq!(payload["args"][0], "second");
        assert!(!h.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_error_stops_reconnecting() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        h.transport.reject_next(ClientError::config("handshake rejected"));

        assert!(h.supervisor.reconnect("test").await.is_none());
        assert_eq!(h.transport.connect_count(), 1);
        assert_eq!(*h.state_rx.borrow(), ConnectionState::Disconnected);
    }

    /// Records how many payloads had been written when each message arrived
    struct WriteObserver {
        metrics: Arc<ClientMetrics>,
        writes_seen: parking_lot::Mutex<Vec<u64>>,
    }

    impl ClientHandler for WriteObserver {
        fn on_message(&self, _message: &serde_json::Value) -> anyhow::Result<()> {
            self.writes_seen.lock().push(self.metrics.snapshot().payloads_written);
            Ok(())
        }

        fn on_raw_message(&self, _message: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn subscribe_payload(
            &self,
            channel: &crate::types::ChannelName,
            _unsubscribe: bool,
        ) -> ClientResult<String> {
            Ok(channel.to_string())
        }
    }

    #[tokio::test]
    async fn test_pending_writes_flush_before_inbound_frames() {
        let (transport, mut sessions) = MockTransport::new();
        let metrics = Arc::new(ClientMetrics::new());
        let observer = Arc::new(WriteObserver {
            metrics: metrics.clone(),
            writes_seen: parking_lot::Mutex::new(Vec::new()),
        });
        let config = ClientConfig::new("ws://localhost:9001/ws");
        let subscriptions = SharedSubscriptions::new(config.retry_interval, config.max_retry_count);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);
        let supervisor = ConnectionSupervisor::new(
            config,
            Arc::new(transport),
            observer.clone(),
            subscriptions,
            metrics.clone(),
            state_tx,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap();

        let (queue, outbound) = send_queue();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);

        let first = supervisor.connect().await.unwrap();
        let mut session = sessions.next().await;
        for i in 0..20 {
            session.send_text(&format!(r#"{{"tick":{}}}"#, i));
        }
        queue.enqueue("order-1").unwrap();
        queue.enqueue("order-2").unwrap();

        let task = tokio::spawn(supervisor.run(first, outbound, command_rx, stop_rx));
        assert_eq!(session.next_outbound().await.as_deref(), Some("order-1"));
        assert_eq!(session.next_outbound().await.as_deref(), Some("order-2"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();

        let seen = observer.writes_seen.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&writes| writes == 2));
    }

    #[tokio::test]
    async fn test_overlapping_reconnect_is_ignored() {
        let (h, _sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        h.reconnecting.store(true, Ordering::SeqCst);
        assert!(h.supervisor.reconnect("second").await.is_none());
        assert_eq!(h.transport.connect_count(), 0);
        assert!(h.reconnecting.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_writes_in_order_and_reconnects_on_close() {
        let (h, mut sessions) = harness(ClientConfig::new("ws://localhost:9001/ws"));
        let (queue, outbound) = send_queue();
        let (_command_tx, command_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handler = h.handler.clone();
        let mut state_rx = h.state_rx.clone();

        let first = h.supervisor.connect().await.unwrap();
        let mut session = sessions.next().await;
        let task = tokio::spawn(h.supervisor.run(first, outbound, command_rx, stop_rx));

        for i in 0..3 {
            queue.enqueue(format!("msg-{}", i)).unwrap();
        }
        for i in 0..3 {
            assert_eq!(session.next_outbound().await, Some(format!("msg-{}", i)));
        }

        session.send_text(r#"{"hello":1}"#);
        session.send_binary(br#"{"hello":2}"#.to_vec());
        session.close();

        let mut second = sessions.next().await;
        state_rx.wait_for(|s| *s == ConnectionState::Connected).await.unwrap();
        assert_eq!(handler.structured().len(), 2);
        assert_eq!(handler.connections(), 2);

        queue.enqueue("after reconnect").unwrap();
        assert_eq!(second.next_outbound().await.as_deref(), Some("after reconnect"));

        stop_tx.send(true).unwrap();
        task.await.unwrap();
        assert_eq!(*state_rx.borrow(), ConnectionState::Disconnected);
    }
}
