//! Stream client data types

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;

/// Exchange-defined name of a logical subscription target
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelName(String);

impl ChannelName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ChannelName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ChannelName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl Borrow<str> for ChannelName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Transport connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    /// Outbound payloads are flushed only in this state; otherwise they stay buffered
    pub fn can_flush(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable lifecycle state of a single channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelState {
    /// Never requested, or fully reset
    Unknown,
    /// A (un)subscribe request for the channel is still pending
    Requested,
    /// Subscription acknowledged by the remote
    Confirmed,
    /// Unsubscription acknowledged by the remote
    ConfirmedRemoved,
}

/// Resolution of a tracked (un)subscribe request, delivered through
/// `StreamClient::process_pending_callbacks`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Confirmed {
        channel: ChannelName,
        unsubscribe: bool,
    },
    Exhausted {
        channel: ChannelName,
        unsubscribe: bool,
        attempts: u32,
    },
}

impl SubscriptionEvent {
    pub fn channel(&self) -> &ChannelName {
        match self {
            Self::Confirmed { channel, .. } | Self::Exhausted { channel, .. } => channel,
        }
    }

    pub fn is_unsubscribe(&self) -> bool {
        match self {
            Self::Confirmed { unsubscribe, .. } | Self::Exhausted { unsubscribe, .. } => {
                *unsubscribe
            }
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self, Self::Confirmed { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_channel_name_lookup_by_str() {
        let mut map = HashMap::new();
        map.insert(ChannelName::new("btcusdt@trade"), 1);
        assert_eq!(map.get("btcusdt@trade"), Some(&1));
        assert_eq!(map.get("ethusdt@trade"), None);
    }

    #[test]
    fn test_only_connected_state_flushes() {
        assert!(ConnectionState::Connected.can_flush());
        assert!(!ConnectionState::Connecting.can_flush());
        assert!(!ConnectionState::Reconnecting.can_flush());
        assert!(!ConnectionState::Disconnected.can_flush());
    }

    #[test]
    fn test_event_accessors() {
        let event = SubscriptionEvent::Exhausted {
            channel: ChannelName::new("BTCUSDT.ticker"),
            unsubscribe: true,
            attempts: 3,
        };
        assert_eq!(event.channel().as_str(), "BTCUSDT.ticker");
        assert!(event.is_unsubscribe());
        assert!(!event.succeeded());
    }
}
