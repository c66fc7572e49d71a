//! Subscription state machine and retry/acknowledgment protocol
//!
//! Requests are negotiated strictly one at a time: only the head of the
//! pending queue is ever sent, retried, or matched against inbound frames.
//! This mirrors venues that acknowledge requests in submission order and keeps
//! ack-key matching unambiguous when keys share prefixes.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Notify};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

use crate::error::{ClientError, ClientResult};
use crate::metrics::ClientMetrics;
use crate::send_queue::SendQueue;
use crate::types::{ChannelName, ChannelState, SubscriptionEvent};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_RETRY_COUNT: u32 = 3;

/// A pending (un)subscribe intent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRequest {
    pub channel: ChannelName,
    pub payload: String,
    /// Substring that confirms the request when seen in an inbound frame; empty never matches
    pub ack_key: String,
    /// Retry until acknowledged (true) or send once and forget (false)
    pub blocking: bool,
    pub is_unsubscribe: bool,
    pub last_attempt_at: Option<Instant>,
    pub attempt_count: u32,
}

impl SubscriptionRequest {
    pub fn subscribe(
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
            ack_key: ack_key.into(),
            blocking,
            is_unsubscribe: false,
            last_attempt_at: None,
            attempt_count: 0,
        }
    }

    pub fn unsubscribe(
        channel: impl Into<ChannelName>,
        payload: impl Into<String>,
        ack_key: impl Into<String>,
        blocking: bool,
    ) -> Self {
        Self {
            is_unsubscribe: true,
            ..Self::subscribe(channel, payload, ack_key, blocking)
        }
    }

    fn is_due(&self, now: Instant, retry_interval: Duration) -> bool {
        match self.last_attempt_at {
            Some(last) => now.saturating_duration_since(last) >= retry_interval,
            None => true,
        }
    }
}

/// Per-channel confirmation flags; at most one is set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStatus {
    subscribed: bool,
    unsubscribed: bool,
}

impl SubscriptionStatus {
    pub fn is_subscribed(&self) -> bool {
        self.subscribed
    }

    pub fn is_unsubscribed(&self) -> bool {
        self.unsubscribed
    }

    fn mark_subscribed(&mut self) {
        self.subscribed = true;
        self.unsubscribed = false;
    }

    fn mark_unsubscribed(&mut self) {
        self.unsubscribed = true;
        self.subscribed = false;
    }

    fn state(&self) -> ChannelState {
        if self.subscribed {
            ChannelState::Confirmed
        } else if self.unsubscribed {
            ChannelState::ConfirmedRemoved
        } else {
            ChannelState::Unknown
        }
    }
}

/// Pending request queue plus confirmed channel state
///
/// Pure state: time is passed in and payloads to send are returned, so every
/// transition can be driven directly from tests.
#[derive(Debug)]
pub struct SubscriptionManager {
    retry_interval: Duration,
    max_retry_count: u32,
    pending: VecDeque<SubscriptionRequest>,
    /// Iteration order is confirmation order
    status: IndexMap<ChannelName, SubscriptionStatus>,
    /// Ack key each confirmed channel was confirmed with, reused on resync
    confirmed_keys: HashMap<ChannelName, String>,
    events: Vec<SubscriptionEvent>,
    dropped_total: u64,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_INTERVAL, DEFAULT_MAX_RETRY_COUNT)
    }
}

impl SubscriptionManager {
    pub fn new(retry_interval: Duration, max_retry_count: u32) -> Self {
        Self {
            retry_interval,
            max_retry_count,
            pending: VecDeque::new(),
            status: IndexMap::new(),
            confirmed_keys: HashMap::new(),
            events: Vec::new(),
            dropped_total: 0,
        }
    }

    /// Append a request at the tail of the pending queue
    pub fn enqueue(&mut self, request: SubscriptionRequest) {
        debug!(
            "Queued {} request for {} (blocking: {})",
            if request.is_unsubscribe { "unsubscribe" } else { "subscribe" },
            request.channel,
            request.blocking
        );
        self.pending.push_back(request);
    }

    /// Match an inbound frame against the head of the pending queue
    pub fn acknowledge(&mut self, raw: &str) -> bool {
        let matched = match self.pending.front() {
            Some(head) => !head.ack_key.is_empty() && raw.contains(head.ack_key.as_str()),
            None => false,
        };
        if !matched {
            return false;
        }

        let Some(request) = self.pending.pop_front() else {
            return false;
        };

        if request.is_unsubscribe {
            self.status
                .entry(request.channel.clone())
                .or_default()
                .mark_unsubscribed();
            self.confirmed_keys.remove(&request.channel);
        } else {
            // A re-confirmed channel moves to the end of the confirmation order
            match self.status.get_index_of(&request.channel) {
                Some(index) => {
                    let last = self.status.len() - 1;
                    self.status.move_index(index, last);
                    if let Some(status) = self.status.get_mut(&request.channel) {
                        status.mark_subscribed();
                    }
                }
                None => {
                    let mut status = SubscriptionStatus::default();
                    status.mark_subscribed();
                    self.status.insert(request.channel.clone(), status);
                }
            }
            self.confirmed_keys
                .insert(request.channel.clone(), request.ack_key.clone());
        }

        info!(
            "{} confirmed for {} after {} attempt(s)",
            if request.is_unsubscribe { "Unsubscribe" } else { "Subscribe" },
            request.channel,
            request.attempt_count
        );

        self.events.push(SubscriptionEvent::Confirmed {
            channel: request.channel,
            unsubscribe: request.is_unsubscribe,
        });
        true
    }

    /// Advance the retry protocol and return the payloads to hand to the send queue
    pub fn poll(&mut self, now: Instant) -> Vec<String> {
        let mut outbound = Vec::new();

        while let Some(head) = self.pending.front_mut() {
            if !head.blocking {
                outbound.push(head.payload.clone());
                self.pending.pop_front();
                continue;
            }

            if !head.is_due(now, self.retry_interval) {
                break;
            }

            if head.attempt_count < self.max_retry_count {
                head.attempt_count += 1;
                head.last_attempt_at = Some(now);
                debug!(
                    "Sending request for {} (attempt {}/{})",
                    head.channel, head.attempt_count, self.max_retry_count
                );
                outbound.push(head.payload.clone());
                break;
            }

            let Some(request) = self.pending.pop_front() else {
                break;
            };
            let err = ClientError::SubscriptionTimeout {
                channel: request.channel.clone(),
                attempts: request.attempt_count,
            };
            error!("{}", err);
            self.dropped_total += 1;
            self.events.push(SubscriptionEvent::Exhausted {
                channel: request.channel,
                unsubscribe: request.is_unsubscribe,
                attempts: request.attempt_count,
            });
        }

        outbound
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.status.get(channel).map_or(false, |s| s.is_subscribed())
    }

    pub fn is_unsubscribed(&self, channel: &str) -> bool {
        self.status.get(channel).map_or(false, |s| s.is_unsubscribed())
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        if self.pending.iter().any(|r| r.channel.as_str() == channel) {
            return ChannelState::Requested;
        }
        self.status.get(channel).map_or(ChannelState::Unknown, |s| s.state())
    }

    /// Confirmed channels in confirmation order
    pub fn confirmed_channels(&self) -> Vec<ChannelName> {
        self.status
            .iter()
            .filter(|(_, status)| status.is_subscribed())
            .map(|(channel, _)| channel.clone())
            .collect()
    }

    fn has_pending(&self, channel: &ChannelName) -> bool {
        self.pending.iter().any(|r| &r.channel == channel)
    }

    /// Confirmed channels without a pending request, with the ack key they were confirmed with
    fn resync_targets(&self) -> Vec<(ChannelName, String)> {
        self.confirmed_channels()
            .into_iter()
            .filter(|channel| !self.has_pending(channel))
            .map(|channel| {
                let key = self.confirmed_keys.get(&channel).cloned().unwrap_or_default();
                (channel, key)
            })
            .collect()
    }

    /// Drain resolution events recorded since the last call
    pub fn take_events(&mut self) -> Vec<SubscriptionEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Requests dropped after exhausting their attempts
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total
    }
}

/// [`SubscriptionManager`] shared between callers, the dispatcher, and the retry task
#[derive(Debug, Clone)]
pub struct SharedSubscriptions {
    inner: Arc<Mutex<SubscriptionManager>>,
    wake: Arc<Notify>,
}

impl SharedSubscriptions {
    pub fn new(retry_interval: Duration, max_retry_count: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubscriptionManager::new(retry_interval, max_retry_count))),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Enqueue a request; never blocks on the network
    pub fn request(&self, request: SubscriptionRequest) {
        self.inner.lock().enqueue(request);
        self.wake.notify_one();
    }

    /// Called for every inbound frame; wakes the retry task when the head resolves
    pub fn acknowledge(&self, raw: &str) -> bool {
        let acknowledged = self.inner.lock().acknowledge(raw);
        if acknowledged {
            self.wake.notify_one();
        }
        acknowledged
    }

    pub fn poll(&self, now: Instant) -> Vec<String> {
        self.inner.lock().poll(now)
    }

    /// Re-enqueue a blocking subscribe for every confirmed channel
    ///
    /// Payloads are generated outside the lock from a snapshot of the confirmed set.
    /// Channels the generator rejects are logged and skipped, as are channels that
    /// gained a pending request or lost their confirmation while payloads were built.
    pub fn resync<F>(&self, mut generate: F) -> usize
    where
        F: FnMut(&ChannelName) -> ClientResult<String>,
    {
        let targets = self.inner.lock().resync_targets();

        let requests: Vec<SubscriptionRequest> = targets
            .into_iter()
            .filter_map(|(channel, ack_key)| match generate(&channel) {
                Ok(payload) => {
                    Some(SubscriptionRequest::subscribe(channel, payload, ack_key, true))
                }
                Err(e) => {
                    error!("Skipping resync of {}: {}", channel, e);
                    None
                }
            })
            .collect();

        if requests.is_empty() {
            return 0;
        }

        let mut manager = self.inner.lock();
        let mut count = 0;
        for request in requests {
            let superseded = manager.has_pending(&request.channel)
                || !manager.is_subscribed(request.channel.as_str());
            if superseded {
                debug!("Skipping resync of {}, superseded by a newer request", request.channel);
                continue;
            }
            manager.enqueue(request);
            count += 1;
        }
        drop(manager);

        if count > 0 {
            self.wake.notify_one();
        }
        count
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.inner.lock().is_subscribed(channel)
    }

    pub fn is_unsubscribed(&self, channel: &str) -> bool {
        self.inner.lock().is_unsubscribed(channel)
    }

    pub fn channel_state(&self, channel: &str) -> ChannelState {
        self.inner.lock().channel_state(channel)
    }

    pub fn confirmed_channels(&self) -> Vec<ChannelName> {
        self.inner.lock().confirmed_channels()
    }

    pub fn take_events(&self) -> Vec<SubscriptionEvent> {
        self.inner.lock().take_events()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.lock().pending_len()
    }

    fn dropped_total(&self) -> u64 {
        self.inner.lock().dropped_total()
    }
}

/// Retry task: ticks every `poll_interval`, woken early by new requests and
/// acknowledgments, exits when `stop` flips to true or its sender is dropped
pub async fn run_retry_loop(
    subscriptions: SharedSubscriptions,
    queue: SendQueue,
    poll_interval: Duration,
    metrics: Arc<ClientMetrics>,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dropped_seen = 0;

    loop {
        tokio::select! {
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
            _ = ticker.tick() => {}
            _ = subscriptions.wake.notified() => {}
        }

        let payloads = subscriptions.poll(tokio::time::Instant::now().into_std());
        for payload in payloads {
            if queue.enqueue(payload).is_err() {
                debug!("Send queue closed, stopping retry task");
                return;
            }
        }

        let dropped = subscriptions.dropped_total();
        if dropped > dropped_seen {
            metrics.record_subscription_failures(dropped - dropped_seen);
            dropped_seen = dropped;
        }
    }

    debug!("Retry task stopped");
}
