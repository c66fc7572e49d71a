//! Stream health counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters shared by the client's background tasks
#[derive(Debug, Default)]
pub struct ClientMetrics {
    frames_received: AtomicU64,
    structured_messages: AtomicU64,
    raw_messages: AtomicU64,
    dropped_frames: AtomicU64,
    handler_faults: AtomicU64,
    acknowledgments: AtomicU64,
    payloads_written: AtomicU64,
    reconnections: AtomicU64,
    subscription_failures: AtomicU64,
}

/// Point-in-time copy of [`ClientMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub structured_messages: u64,
    pub raw_messages: u64,
    pub dropped_frames: u64,
    pub handler_faults: u64,
    pub acknowledgments: u64,
    pub payloads_written: u64,
    pub reconnections: u64,
    pub subscription_failures: u64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_frame(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_structured(&self) {
        self.structured_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_raw(&self) {
        self.raw_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped_frame(&self) {
        self.dropped_frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_handler_fault(&self) {
        self.handler_faults.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgment(&self) {
        self.acknowledgments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write(&self) {
        self.payloads_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnection(&self) {
        self.reconnections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscription_failures(&self, count: u64) {
        self.subscription_failures.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            structured_messages: self.structured_messages.load(Ordering::Relaxed),
            raw_messages: self.raw_messages.load(Ordering::Relaxed),
            dropped_frames: self.dropped_frames.load(Ordering::Relaxed),
            handler_faults: self.handler_faults.load(Ordering::Relaxed),
            acknowledgments: self.acknowledgments.load(Ordering::Relaxed),
            payloads_written: self.payloads_written.load(Ordering::Relaxed),
            reconnections: self.reconnections.load(Ordering::Relaxed),
            subscription_failures: self.subscription_failures.load(Ordering::Relaxed),
        }
    }
}
