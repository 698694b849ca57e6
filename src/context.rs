//! Per-call context carrying deadline and cancellation
//!
//! Every call operation takes a `&CallCtx`. Cancellation surfaces as
//! [`CallError::Canceled`]; a context deadline expiring mid-call surfaces as
//! [`CallError::DeadlineExceeded`]. Both count toward breaker error rates.

use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::CallError;

/// Deadline and cancellation signal for one call.
#[derive(Debug, Clone, Default)]
pub struct CallCtx {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels the calls carrying the paired [`CallCtx`].
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Signal cancellation. In-flight calls return [`CallError::Canceled`].
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CallCtx {
    /// A context with no deadline and no cancellation.
    pub fn background() -> Self {
        Self::default()
    }

    /// Derive a context that expires `timeout` from now.
    pub fn with_deadline(mut self, timeout: Duration) -> Self {
        self.deadline = Some(Instant::now() + timeout);
        self
    }

    /// Derive a cancellable context and the handle that cancels it.
    pub fn cancellable(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    /// The absolute deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail fast when the context is already dead.
    pub(crate) fn check(&self) -> Result<(), CallError> {
        if self.is_canceled() {
            return Err(CallError::Canceled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CallError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve when the caller cancels; pend forever otherwise.
    pub(crate) async fn canceled(&self) {
        match self.cancel.clone() {
            Some(mut rx) => loop {
                if *rx.borrow() {
                    return;
                }
                if rx.changed().await.is_err() {
                    // Handle dropped without cancelling; nobody can cancel now.
                    futures::future::pending::<()>().await;
                }
            },
            None => futures::future::pending().await,
        }
    }
}
