//! Per-run cancellation signal.
//!
//! Every `start` creates a fresh [`Cancellation`]/[`CancelSignal`] pair, so a
//! stop issued against an earlier run can never leak into a later one.
//! Dropping the [`Cancellation`] side counts as cancelling.

use tokio::sync::watch;

/// Owner side, held by the controller. Calling [`cancel`](Self::cancel) more
/// than once is harmless.
#[derive(Debug)]
pub struct Cancellation {
    tx: watch::Sender<bool>,
}

/// Loop side, observed at every wait boundary.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    /// Create a linked owner/observer pair.
    pub fn new() -> (Self, CancelSignal) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelSignal { rx })
    }

    /// Signal the loop. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) was called.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

impl CancelSignal {
    /// Non-blocking check.
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow() || self.rx.has_changed().is_err()
    }

    /// Resolve once cancellation has been requested (or the owner dropped).
    pub async fn cancelled(&mut self) {
        // wait_for returns Err when the sender is gone, which we treat as cancel
        let _ = self.rx.wait_for(|cancelled| *cancelled).await;
    }
}
