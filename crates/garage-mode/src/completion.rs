//! Single-resolution completion handle for one maintenance window.

use std::sync::Arc;

use tokio::sync::watch;

use crate::types::WindowOutcome;

/// Handle representing the outcome of one maintenance window.
///
/// Clones share the same underlying slot. The handle resolves at most once;
/// later resolutions are no-ops. Cancellation is an ordinary outcome, not an
/// error path, so teardown treats every resolution the same way.
#[derive(Clone)]
pub struct CompletionHandle {
    tx: Arc<watch::Sender<Option<WindowOutcome>>>,
}

impl CompletionHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Resolve the handle. Returns `false` if it was already resolved, in
    /// which case the outcome is unchanged.
    pub fn resolve(&self, outcome: WindowOutcome) -> bool {
        self.tx.send_if_modified(|slot| {
            if slot.is_none() {
                *slot = Some(outcome);
                true
            } else {
                false
            }
        })
    }

    /// Resolve as completed normally.
    pub fn complete(&self) -> bool {
        self.resolve(WindowOutcome::Completed)
    }

    /// Resolve as cancelled.
    pub fn cancel(&self) -> bool {
        self.resolve(WindowOutcome::Cancelled)
    }

    /// Resolve as failed with a cause.
    pub fn fail(&self, cause: impl Into<String>) -> bool {
        self.resolve(WindowOutcome::Failed {
            cause: cause.into(),
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.borrow().is_some()
    }

    /// The terminal outcome, if resolved.
    pub fn outcome(&self) -> Option<WindowOutcome> {
        self.tx.borrow().clone()
    }

    /// Wait until the handle resolves.
    pub async fn wait(&self) -> WindowOutcome {
        let mut rx = self.tx.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().clone() {
                return outcome;
            }
            // The sender lives in `self`, so the channel cannot close while
            // we hold it.
            if rx.changed().await.is_err() {
                return WindowOutcome::Cancelled;
            }
        }
    }
}

impl Default for CompletionHandle {
    fn default() -> Self {
        Self::new()
    }
}
