//! Inbound frame routing

use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::ClientError;
use crate::handler::ClientHandler;
use crate::metrics::ClientMetrics;
use crate::subscription::SharedSubscriptions;
use crate::transport::InboundFrame;

/// What happened to one inbound frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub acknowledged: bool,
    pub structured: bool,
    /// A handler callback returned an error or panicked
    pub handler_fault: bool,
    /// Binary frame that was not valid UTF-8
    pub dropped: bool,
}

/// Routes inbound frames to the handler and the acknowledgment matcher
pub struct MessageDispatcher {
    handler: Arc<dyn ClientHandler>,
    subscriptions: SharedSubscriptions,
    metrics: Arc<ClientMetrics>,
    log_traffic: bool,
}

impl MessageDispatcher {
    pub fn new(
        handler: Arc<dyn ClientHandler>,
        subscriptions: SharedSubscriptions,
        metrics: Arc<ClientMetrics>,
        log_traffic: bool,
    ) -> Self {
        Self {
            handler,
            subscriptions,
            metrics,
            log_traffic,
        }
    }

    /// Never fails: handler faults are logged and counted here
    pub fn dispatch(&self, frame: InboundFrame) -> DispatchOutcome {
        self.metrics.record_frame();

        let text = match frame {
            InboundFrame::Text(text) => text,
            InboundFrame::Binary(data) => match String::from_utf8(data) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Dropping binary frame that is not UTF-8: {}", e);
                    self.metrics.record_dropped_frame();
                    return DispatchOutcome {
                        acknowledged: false,
                        structured: false,
                        handler_fault: false,
                        dropped: true,
                    };
                }
            },
        };

        if self.log_traffic {
            debug!("<< {}", text);
        }

        // Ack keys are arbitrary substrings, so match before (and regardless of) parsing
        let acknowledged = self.subscriptions.acknowledge(&text);
        if acknowledged {
            self.metrics.record_acknowledgment();
        }

        let mut handler_fault = false;
        let structured = match serde_json::from_str::<Value>(&text) {
            Ok(message) => {
                self.metrics.record_structured();
                handler_fault |= !self.guarded("on_message", || self.handler.on_message(&message));
                if self.handler.also_deliver_raw() {
                    handler_fault |=
                        !self.guarded("on_raw_message", || self.handler.on_raw_message(&text));
                }
                true
            }
            Err(e) => {
                debug!("Frame is not JSON ({}), delivering raw", ClientError::from(e));
                self.metrics.record_raw();
                handler_fault |=
                    !self.guarded("on_raw_message", || self.handler.on_raw_message(&text));
                false
            }
        };

        DispatchOutcome {
            acknowledged,
            structured,
            handler_fault,
            dropped: false,
        }
    }

    /// Run a handler callback, returning false if it errored or panicked
    fn guarded<F>(&self, callback: &str, f: F) -> bool
    where
        F: FnOnce() -> anyhow::Result<()>,
    {
        match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                error!("Handler {} failed: {:#}", callback, e);
                self.metrics.record_handler_fault();
                false
            }
            Err(panic) => {
                let reason = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!("Handler {} panicked: {}", callback, reason);
                self.metrics.record_handler_fault();
                false
            }
        }
    }
}
