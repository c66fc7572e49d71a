//! Ordered outbound buffer between callers and the transport writer

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::{ClientError, ClientResult};

/// Caller side of the outbound queue; cheap to clone
#[derive(Debug, Clone)]
pub struct SendQueue {
    tx: mpsc::UnboundedSender<String>,
    depth: Arc<AtomicUsize>,
}

/// Writer side of the outbound queue, owned by the supervisor task
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::UnboundedReceiver<String>,
    depth: Arc<AtomicUsize>,
}

/// Create a connected queue pair
pub fn send_queue() -> (SendQueue, OutboundReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        SendQueue {
            tx,
            depth: depth.clone(),
        },
        OutboundReceiver { rx, depth },
    )
}

impl SendQueue {
    /// Append a payload; never blocks. Waking the writer is a side effect of every enqueue.
    pub fn enqueue(&self, payload: impl Into<String>) -> ClientResult<()> {
        self.depth.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(payload.into()).is_err() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            return Err(ClientError::Shutdown);
        }
        Ok(())
    }

    /// Payloads waiting for the writer
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl OutboundReceiver {
    /// Next payload in FIFO order; `None` once every sender is gone and the queue is drained
    pub async fn next(&mut self) -> Option<String> {
        let payload = self.rx.recv().await?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(payload)
    }

    pub fn try_next(&mut self) -> Option<String> {
        let payload = self.rx.try_recv().ok()?;
        self.depth.fetch_sub(1, Ordering::AcqRel);
        Some(payload)
    }
}
