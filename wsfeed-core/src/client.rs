//! Stream client façade

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ClientConfig;
use crate::error::{ClientError, ClientResult};
use crate::handler::ClientHandler;
use crate::metrics::{ClientMetrics, MetricsSnapshot};
use crate::send_queue::{send_queue, SendQueue};
use crate::subscription::{run_retry_loop, SharedSubscriptions, SubscriptionRequest};
use crate::supervisor::{ConnectionSupervisor, SupervisorCommand};
use crate::transport::Transport;
use crate::types::{ChannelName, ChannelState, ConnectionState};

type StatusCallback = Arc<dyn Fn(&ChannelName, bool) + Send + Sync>;

/// Owned handle for collaborators that need to send or subscribe through a client
#[derive(Debug, Clone)]
pub struct ClientHandle {
    send_queue: SendQueue,
    subscriptions: SharedSubscriptions,
}

impl ClientHandle {
    /// Queue a payload for the transport; buffered while disconnected
    pub fn send(&self, payload: impl Into<String>) -> ClientResult<()> {
        self.send_queue.enqueue(payload)
    }

    pub fn subscribe(
        &self,
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) {
        self.subscriptions
            .request(SubscriptionRequest::subscribe(channel, payload, ack_key, blocking));
    }

    pub fn unsubscribe(
        &self,
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) {
        self.subscriptions
            .request(SubscriptionRequest::unsubscribe(channel, payload, ack_key, blocking));
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.subscriptions.is_subscribed(channel)
    }

    pub fn is_unsubscribed(&self, channel: &str) -> bool {
        self.subscriptions.is_unsubscribed(channel)
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.subscriptions.channel_state(channel)
    }
}

/// Reliable subscription client over one reconnecting connection
///
/// Owns two background tasks: the supervisor (session loop and reconnects)
/// and the retry task. Dropping the client stops both; [`StreamClient::shutdown`]
/// also waits for them to exit.
pub struct StreamClient {
    handle: ClientHandle,
    handler: Arc<dyn ClientHandler>,
    metrics: Arc<ClientMetrics>,
    state_rx: watch::Receiver<ConnectionState>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    reconnecting: Arc<AtomicBool>,
    stop_tx: watch::Sender<bool>,
    subscription_callback: RwLock<Option<StatusCallback>>,
    unsubscription_callback: RwLock<Option<StatusCallback>>,
    supervisor_task: Option<JoinHandle<()>>,
    retry_task: Option<JoinHandle<()>>,
}

impl StreamClient {
    /// Connect and start the background tasks
    ///
    /// The first connection attempt is made here and its failure is returned
    /// as [`ClientError::Connection`]; only later losses are retried.
    pub async fn connect(
        config: ClientConfig,
        handler: Arc<dyn ClientHandler>,
        transport: impl Transport,
    ) -> ClientResult<Self> {
        config.validate()?;

        let metrics = Arc::new(ClientMetrics::new());
        let subscriptions = SharedSubscriptions::new(config.retry_interval, config.max_retry_count);
        let (send_queue, outbound) = send_queue();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let reconnecting = Arc::new(AtomicBool::new(false));

        let supervisor = ConnectionSupervisor::new(
            config.clone(),
            Arc::new(transport),
            handler.clone(),
            subscriptions.clone(),
            metrics.clone(),
            state_tx,
            reconnecting.clone(),
        )?;

        let connection = match supervisor.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                supervisor.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let supervisor_task =
            tokio::spawn(supervisor.run(connection, outbound, command_rx, stop_rx.clone()));
        let retry_task = tokio::spawn(run_retry_loop(
            subscriptions.clone(),
            send_queue.clone(),
            config.retry_poll_interval,
            metrics.clone(),
            stop_rx,
        ));

        info!("Stream client started for {}", config.url);

        Ok(Self {
            handle: ClientHandle {
                send_queue,
                subscriptions,
            },
            handler,
            metrics,
            state_rx,
            commands: command_tx,
            reconnecting,
            stop_tx,
            subscription_callback: RwLock::new(None),
            unsubscription_callback: RwLock::new(None),
            supervisor_task: Some(supervisor_task),
            retry_task: Some(retry_task),
        })
    }

    /// Ask the supervisor to drop the current connection and reconnect
    ///
    /// A no-op while a reconnect sequence is already running.
    pub fn reconnect(&self, reason: impl Into<String>) -> ClientResult<()> {
        let reason = reason.into();
        if self.reconnecting.load(Ordering::Acquire) {
            debug!("Reconnect already in progress, ignoring: {}", reason);
            return Ok(());
        }
        self.commands
            .send(SupervisorCommand::Reconnect { reason })
            .map_err(|_| ClientError::Shutdown)
    }

    pub fn send(&self, payload: impl Into<String>) -> ClientResult<()> {
        self.handle.send(payload)
    }

    pub fn subscribe(
        &self,
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) {
        self.handle.subscribe(channel, payload, ack_key, blocking);
    }

    pub fn unsubscribe(
        &self,
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) {
        self.handle.unsubscribe(channel, payload, ack_key, blocking);
    }

    /// Subscribe with a payload generated by the handler
    ///
    /// A payload the handler rejects is returned here and nothing is queued.
    pub fn subscribe_dynamic(
        &self,
        channel: impl Into<ChannelName>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) -> ClientResult<()> {
        let channel = channel.into();
        let payload = self.handler.subscribe_payload(&channel, false)?;
        self.handle.subscribe(channel, payload, ack_key, blocking);
        Ok(())
    }

    pub fn unsubscribe_dynamic(
        &self,
        channel: impl Into<ChannelName>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) -> ClientResult<()> {
        let channel = channel.into();
        let payload = self.handler.subscribe_payload(&channel, true)?;
        self.handle.unsubscribe(channel, payload, ack_key, blocking);
        Ok(())
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.handle.is_subscribed(channel)
    }

    pub fn is_unsubscribed(&self, channel: &str) -> bool {
        self.handle.is_unsubscribed(channel)
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.handle.channel_state(channel)
    }

    pub fn confirmed_channels(&self) -> Vec<ChannelName> {
        self.handle.subscriptions.confirmed_channels()
    }

    /// Called with `(channel, true)` when a subscribe is acknowledged and
    /// `(channel, false)` when it is dropped after exhausting its attempts
    pub fn set_subscription_callback<F>(&self, callback: F)
    where
        F: Fn(&ChannelName, bool) + Send + Sync + 'static,
    {
        *self.subscription_callback.write() = Some(Arc::new(callback));
    }

    pub fn set_unsubscription_callback<F>(&self, callback: F)
    where
        F: Fn(&ChannelName, bool) + Send + Sync + 'static,
    {
        *self.unsubscription_callback.write() = Some(Arc::new(callback));
    }

    /// Deliver queued resolution events on the calling thread; returns how many were drained
    pub fn process_pending_callbacks(&self) -> usize {
        let events = self.handle.subscriptions.take_events();
        if events.is_empty() {
            return 0;
        }

        let on_subscribe = self.subscription_callback.read().clone();
        let on_unsubscribe = self.unsubscription_callback.read().clone();

        for event in &events {
            let callback = if event.is_unsubscribe() {
                on_unsubscribe.as_ref()
            } else {
                on_subscribe.as_ref()
            };
            if let Some(callback) = callback {
                callback(event.channel(), event.succeeded());
            }
        }
        events.len()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn handle(&self) -> ClientHandle {
        self.handle.clone()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop both background tasks and wait for them to exit
    pub async fn shutdown(mut self) {
        self.stop_tx.send_replace(true);

        for task in [self.supervisor_task.take(), self.retry_task.take()].into_iter().flatten() {
            if let Err(e) = task.await {
                error!("Background task ended abnormally: {}", e);
            }
        }
        info!("Stream client shut down");
    }
}

impl Drop for StreamClient {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
    }
}
