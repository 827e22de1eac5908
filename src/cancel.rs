//! Call cancellation.

use std::sync::Arc;
use tokio::sync::watch;

/// Clonable cancellation token passed into calls.
///
/// Cancelling translates to a RESET_STREAM(Cancel) on the call's stream;
/// in-flight receives and sends observe the cancellation at their next
/// suspension point.
#[derive(Clone)]
pub struct CancelToken {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Cancels every operation watching this token. Idempotent.
    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled; pends forever otherwise.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                // All senders gone without a cancel; nothing left to wait on.
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
