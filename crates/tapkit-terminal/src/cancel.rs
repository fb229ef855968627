//! Single-slot register of the currently cancelable operation.
//!
//! Discovery, payment-method collection and firmware installs each park an
//! abort procedure here when they start. `cancel_current` invokes whatever
//! is registered. The slot is last-writer-wins: when two cancelable
//! operations overlap, only the most recent one is abortable. A settling
//! operation clears the slot owner-checked, so it never unregisters its
//! successor.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::BoxFuture;
use tracing::{debug, trace};

/// Cancel-slot name for a discovery session.
pub const OP_DISCOVER: &str = "discover_readers";
/// Cancel-slot name for a pending payment-method collection.
pub const OP_COLLECT: &str = "collect_payment_method";
/// Cancel-slot name for an installing firmware update.
pub const OP_INSTALL_UPDATE: &str = "install_update";

type AbortProc = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Registered {
    op: &'static str,
    abort: AbortProc,
}

/// Tracks which operation `cancel_current` would abort.
pub struct CancellationTracker {
    slot: Mutex<Option<Registered>>,
}

impl CancellationTracker {
    pub fn new() -> Self {
        CancellationTracker {
            slot: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Registered>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `op` the cancelable operation, replacing any previous one.
    pub fn register(
        &self,
        op: &'static str,
        abort: impl Fn() -> BoxFuture<'static, ()> + Send + Sync + 'static,
    ) {
        trace!(op, "cancelable operation registered");
        *self.lock() = Some(Registered {
            op,
            abort: Arc::new(abort),
        });
    }

    /// Clear the slot if it still belongs to `op`.
    pub fn clear_if(&self, op: &'static str) {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|r| r.op == op) {
            trace!(op, "cancelable operation cleared");
            *slot = None;
        }
    }

    /// Name of the registered operation, if any.
    #[must_use]
    pub fn current(&self) -> Option<&'static str> {
        self.lock().as_ref().map(|r| r.op)
    }

    /// Run the registered abort procedure, emptying the slot first.
    ///
    /// Returns `false` when nothing was registered. The slot lock is not
    /// held across the await.
    pub async fn cancel_current(&self) -> bool {
        let registered = self.lock().take();
        match registered {
            Some(r) => {
                debug!(op = r.op, "cancel requested");
                (r.abort)().await;
                true
            }
            None => {
                trace!("cancel requested with nothing cancelable");
                false
            }
        }
    }
}

impl Default for CancellationTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flagging(flag: &Arc<Mutex<Vec<&'static str>>>, name: &'static str) -> impl Fn() -> BoxFuture<'static, ()> + use<> {
        let flag = Arc::clone(flag);
        move || {
            let flag = Arc::clone(&flag);
            Box::pin(async move {
                flag.lock().unwrap().push(name);
            })
        }
    }

    #[tokio::test]
    async fn cancel_runs_the_registered_procedure() {
        let tracker = CancellationTracker::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        tracker.register(OP_DISCOVER, flagging(&ran, "discover"));

        assert!(tracker.cancel_current().await);
        assert_eq!(*ran.lock().unwrap(), vec!["discover"]);
        assert_eq!(tracker.current(), None);
    }

    #[tokio::test]
    async fn cancel_with_empty_slot_is_a_no_op() {
        let tracker = CancellationTracker::new();
        assert!(!tracker.cancel_current().await);
    }

    #[tokio::test]
    async fn newest_registration_wins() {
        let tracker = CancellationTracker::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        tracker.register(OP_DISCOVER, flagging(&ran, "discover"));
        tracker.register(OP_COLLECT, flagging(&ran, "collect"));

        assert_eq!(tracker.current(), Some(OP_COLLECT));
        assert!(tracker.cancel_current().await);
        assert_eq!(*ran.lock().unwrap(), vec!["collect"]);
    }

    #[tokio::test]
    async fn clear_only_affects_the_owner() {
        let tracker = CancellationTracker::new();
        let ran = Arc::new(Mutex::new(Vec::new()));
        tracker.register(OP_COLLECT, flagging(&ran, "collect"));

        tracker.clear_if(OP_DISCOVER);
        assert_eq!(tracker.current(), Some(OP_COLLECT));

        tracker.clear_if(OP_COLLECT);
        assert_eq!(tracker.current(), None);
    }
}
