//! Refresh notification latch.
//!
//! [`RefreshNotifier`] is a lazily-created one-shot broadcast: every
//! [`StateWaiter`] obtained since the last notification is released together
//! by the next [`notify_refresh`](RefreshNotifier::notify_refresh), after
//! which the latch is discarded and recreated on demand. The wrapper fires it
//! whenever its view has caught up with the stream tail.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Latch {
    fired: AtomicBool,
    notify: Notify,
}

/// One-shot latch completed every time state catches up with the stream.
#[derive(Debug, Default)]
pub struct RefreshNotifier {
    latch: Option<Arc<Latch>>,
}

impl RefreshNotifier {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Obtain a waiter for the next refresh.
    ///
    /// Waiters requested between two notifications share one latch; dropping
    /// an individual waiter never prevents the latch from firing for the
    /// others.
    pub fn wait_for_state(&mut self) -> StateWaiter {
        let latch = self.latch.get_or_insert_with(|| Arc::new(Latch::default()));
        StateWaiter {
            latch: Arc::clone(latch),
        }
    }

    /// Whether at least one waiter is pending on the current latch.
    #[must_use]
    pub fn waiting(&self) -> bool {
        self.latch.is_some()
    }

    /// Complete the current latch (if any) and discard it.
    ///
    /// Awaiters resume through the scheduler rather than inline, so this is
    /// safe to call from deep inside the engine without re-entrancy concerns.
    pub fn notify_refresh(&mut self) {
        if let Some(latch) = self.latch.take() {
            latch.fired.store(true, Ordering::Release);
            latch.notify.notify_waiters();
        }
    }
}

/// Handle awaiting the next refresh notification.
#[derive(Clone, Debug)]
pub struct StateWaiter {
    latch: Arc<Latch>,
}

impl StateWaiter {
    /// Resolve once the latch this waiter was attached to fires.
    pub async fn wait(self) {
        let notified = self.latch.notify.notified();
        tokio::pin!(notified);
        // Register interest before checking the flag so a notification
        // between the two cannot be missed.
        notified.as_mut().enable();
        if self.latch.fired.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }
}
