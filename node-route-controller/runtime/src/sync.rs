use ahash::AHashSet as HashSet;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::info;

/// Indicates whether every node of the initial node listing has been processed at least once.
///
/// Consumers use this to avoid acting on a partially programmed dataplane after a restart.
#[derive(Clone, Debug)]
pub struct InitialSync(watch::Receiver<bool>);

/// Tracks which nodes of the initial listing have yet to be processed.
#[derive(Debug)]
pub(crate) struct InitialListTracker {
    pending: Mutex<Option<HashSet<String>>>,
    tx: watch::Sender<bool>,
}

// === impl InitialSync ===

impl InitialSync {
    pub fn is_synced(&self) -> bool {
        *self.0.borrow()
    }

    /// Waits until the initial sync completes.
    ///
    /// Returns false if the controller is dropped before completing it.
    pub async fn wait(&self) -> bool {
        let mut rx = self.0.clone();
        let synced = rx.wait_for(|synced| *synced).await.is_ok();
        synced
    }
}

// === impl InitialListTracker ===

impl InitialListTracker {
    pub(crate) fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            pending: Mutex::new(None),
            tx,
        }
    }

    pub(crate) fn subscribe(&self) -> InitialSync {
        InitialSync(self.tx.subscribe())
    }

    /// Starts tracking the nodes of the initial listing.
    pub(crate) fn start(&self, names: &[String]) {
        *self.pending.lock() = Some(names.iter().cloned().collect());
    }

    /// Records that a node was processed, whether or not processing succeeded.
    pub(crate) fn processed(&self, name: &str) {
        let done = match self.pending.lock().as_mut() {
            Some(pending) => pending.remove(name) && pending.is_empty(),
            None => false,
        };
        if done {
            self.signal();
        }
    }

    /// Signals if every tracked node has been processed.
    pub(crate) fn signal_if_done(&self) {
        let done = self
            .pending
            .lock()
            .as_ref()
            .is_some_and(|pending| pending.is_empty());
        if done {
            self.signal();
        }
    }

    pub(crate) fn signal(&self) {
        self.pending.lock().take();
        self.tx.send_if_modified(|synced| {
            if *synced {
                return false;
            }
            info!("Initial node sync complete");
            *synced = true;
            true
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_once_all_listed_nodes_are_processed() {
        let tracker = InitialListTracker::new();
        let sync = tracker.subscribe();

        // Nothing is signaled before the listing is known.
        tracker.processed("node-a");
        assert!(!sync.is_synced());

        tracker.start(&["node-a".to_string(), "node-b".to_string()]);
        tracker.processed("node-a");
        tracker.processed("node-c");
        assert!(!sync.is_synced());

        tracker.processed("node-b");
        assert!(sync.is_synced());
    }

    #[test]
    fn empty_listing_signals_when_checked() {
        let tracker = InitialListTracker::new();
        let sync = tracker.subscribe();
        tracker.start(&[]);
        assert!(!sync.is_synced());
        tracker.signal_if_done();
        assert!(sync.is_synced());
    }

    #[tokio::test]
    async fn wait_fails_if_dropped() {
        let tracker = InitialListTracker::new();
        let sync = tracker.subscribe();
        drop(tracker);
        assert!(!sync.wait().await);
    }
}
