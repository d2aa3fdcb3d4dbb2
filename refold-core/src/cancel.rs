//! First-class cancellation.
//!
//! Every suspension point in the engine honours a [`CancelToken`]. Tokens are
//! cheap to clone and observable from any task; cancelling one clone cancels
//! them all. Cancellation is a distinct signal ([`Cancelled`]), never logged
//! as an error and never conflated with collaborator failures.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

/// Error signalling that an operation was abandoned by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cooperative cancellation signal shared by a tree of operations.
#[derive(Clone, Debug)]
pub struct CancelToken {
    shared: Arc<watch::Sender<bool>>,
}

impl CancelToken {
    /// Create a fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shared: Arc::new(tx),
        }
    }

    /// Request cancellation. Idempotent; wakes every pending
    /// [`cancelled`](Self::cancelled) future.
    pub fn cancel(&self) {
        self.shared.send_replace(true);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.shared.borrow()
    }

    /// Resolve once cancellation is requested.
    pub async fn cancelled(&self) {
        let mut rx = self.shared.subscribe();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            // The sender lives inside `self`, so the channel cannot close
            // while this future is borrowed from a token.
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_token_is_not_cancelled() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
    }

    #[test]
    fn cancel_is_visible_through_clones() {
        let token = CancelToken::new();
        let clone = token.clone();
        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_resolves_after_cancel() {
        let token = CancelToken::new();
        let clone = token.clone();
        let waiter = tokio::spawn(async move { clone.cancelled().await });

        token.cancel();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn cancelled_resolves_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        token.cancelled().await;
    }
}
