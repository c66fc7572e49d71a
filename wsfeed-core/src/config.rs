//! Stream client configuration

use std::time::Duration;
use url::Url;

use crate::error::{ClientError, ClientResult};
use crate::subscription::{DEFAULT_MAX_RETRY_COUNT, DEFAULT_RETRY_INTERVAL};

/// Stream client configuration
///
/// Passed to [`crate::StreamClient::connect`] once and read thereafter; nothing
/// here is shared between client instances.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint (`ws://` or `wss://`)
    pub url: String,
    /// Minimum spacing between two sends of the same pending request
    pub retry_interval: Duration,
    /// Attempts before a pending request is dropped
    pub max_retry_count: u32,
    /// Tick period of the retry task
    pub retry_poll_interval: Duration,
    /// Fixed delay before the first reconnect attempt
    pub reconnect_debounce: Duration,
    /// Base of the exponential backoff between reconnect attempts
    pub reconnect_base_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub connect_timeout: Duration,
    /// Force or suppress direct-stream handling; `None` infers it from the endpoint path
    pub direct_stream: Option<bool>,
    /// Log every inbound frame and outbound payload at debug level
    pub log_traffic: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "wss://stream.binance.com:9443/ws".to_string(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            retry_poll_interval: Duration::from_millis(100),
            reconnect_debounce: Duration::from_millis(500),
            reconnect_base_delay: Duration::from_millis(500),
            max_reconnect_attempts: 3,
            connect_timeout: Duration::from_secs(10),
            direct_stream: None,
            log_traffic: false,
        }
    }
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Build the endpoint from its parts, e.g. `("ws-api.binance.com", "/ws-api/v3", 443, true)`
    pub fn from_parts(host: &str, path: &str, port: u16, use_tls: bool) -> Self {
        let scheme = if use_tls { "wss" } else { "ws" };
        let path = path.trim_start_matches('/');
        Self::new(format!("{}://{}:{}/{}", scheme, host, port, path))
    }

    #[must_use]
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    #[must_use]
    pub fn with_max_retry_count(mut self, count: u32) -> Self {
        self.max_retry_count = count;
        self
    }

    #[must_use]
    pub fn with_retry_poll_interval(mut self, interval: Duration) -> Self {
        self.retry_poll_interval = interval;
        self
    }

    #[must_use]
    pub fn with_reconnect_debounce(mut self, delay: Duration) -> Self {
        self.reconnect_debounce = delay;
        self
    }

    #[must_use]
    pub fn with_reconnect_base_delay(mut self, delay: Duration) -> Self {
        self.reconnect_base_delay = delay;
        self
    }

    #[must_use]
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_direct_stream(mut self, direct: bool) -> Self {
        self.direct_stream = Some(direct);
        self
    }

    #[must_use]
    pub fn with_log_traffic(mut self, enabled: bool) -> Self {
        self.log_traffic = enabled;
        self
    }

    /// Parsed endpoint URL
    pub fn endpoint(&self) -> ClientResult<Url> {
        let url = Url::parse(&self.url)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(ClientError::config(format!(
                "Unsupported endpoint scheme '{}', expected ws or wss",
                other
            ))),
        }
    }

    /// Whether resync is skipped after a reconnect
    pub fn is_direct_stream(&self) -> ClientResult<bool> {
        match self.direct_stream {
            Some(direct) => Ok(direct),
            None => Ok(is_direct_stream(&self.endpoint()?)),
        }
    }

    pub fn validate(&self) -> ClientResult<()> {
        self.endpoint()?;

        if self.max_retry_count == 0 {
            return Err(ClientError::config("max_retry_count must be at least 1"));
        }
        if self.retry_poll_interval.is_zero() {
            return Err(ClientError::config("retry_poll_interval must be non-zero"));
        }
        if self.max_reconnect_attempts == 0 {
            return Err(ClientError::config("max_reconnect_attempts must be at least 1"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ClientError::config("connect_timeout must be non-zero"));
        }

        Ok(())
    }
}

/// Direct-stream endpoints carry the subscription in the connection path
/// (`/ws/<stream>` or `/stream?streams=a/b`) and have nothing to replay.
pub fn is_direct_stream(url: &Url) -> bool {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).collect())
        .unwrap_or_default();

    match segments.as_slice() {
        ["ws", stream] => !stream.is_empty(),
        ["stream"] => url
            .query_pairs()
            .any(|(key, value)| key == "streams" && !value.is_empty()),
        _ => false,
    }
}
