use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{collections::VecDeque, hash::Hash, sync::Arc};
use tokio::{sync::Notify, time};

/// A deduplicating work queue.
///
/// A key is held by at most one worker at a time: adding a key that is already pending is a no-op,
/// and adding a key that is being processed marks it dirty so that it is requeued once the worker
/// calls [`WorkQueue::done`]. Distinct keys may be processed concurrently.
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

/// Per-key exponential backoff for failed items.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Backoff {
    pub base: time::Duration,
    pub max: time::Duration,
}

#[derive(Debug)]
struct Inner<K> {
    state: Mutex<State<K>>,
    notify: Notify,
    backoff: Backoff,
}

#[derive(Debug)]
struct State<K> {
    queue: VecDeque<K>,

    /// Keys that need processing: either pending in `queue` or updated while being processed.
    dirty: HashSet<K>,

    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    shutting_down: bool,
}

// === impl WorkQueue ===

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    fn default() -> Self {
        Self::new(Backoff::default())
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash,
{
    pub fn new(backoff: Backoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    pub fn add(&self, key: K) {
        let mut state = self.inner.state.lock();
        if state.shutting_down || !state.dirty.insert(key.clone()) {
            return;
        }
        if state.processing.contains(&key) {
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Waits for the next key, marking it as being processed.
    ///
    /// Returns `None` once the queue has been shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        // Hand off to another waiting worker.
                        self.inner.notify.notify_one();
                    }
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Marks a key as no longer being processed, requeueing it if it was added in the meantime.
    pub fn done(&self, key: &K) {
        let mut state = self.inner.state.lock();
        state.processing.remove(key);
        if state.shutting_down || !state.dirty.contains(key) {
            return;
        }
        state.queue.push_back(key.clone());
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Adds a key after `delay` has elapsed.
    pub fn add_after(&self, key: K, delay: time::Duration)
    where
        K: Send + Sync + 'static,
    {
        let queue = self.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Adds a key after its backoff has elapsed, increasing the key's backoff.
    pub fn add_rate_limited(&self, key: K)
    where
        K: Send + Sync + 'static,
    {
        let failures = {
            let mut state = self.inner.state.lock();
            let failures = state.failures.entry(key.clone()).or_default();
            *failures += 1;
            *failures
        };
        let delay = self.inner.backoff.delay(failures - 1);
        self.add_after(key, delay);
    }

    /// Resets a key's backoff.
    pub fn forget(&self, key: &K) {
        self.inner.state.lock().failures.remove(key);
    }

    /// Returns the number of times a key has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.inner
            .state
            .lock()
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Stops handing out keys. Pending keys are dropped and all waiting workers are woken.
    pub fn shut_down(&self) {
        let mut state = self.inner.state.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.dirty.clear();
        drop(state);
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Returns the number of pending keys.
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// === impl Backoff ===

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base: time::Duration::from_secs(5),
            max: time::Duration::from_secs(300),
        }
    }
}

impl Backoff {
    /// Returns the delay before the retry following `failures` prior failures.
    pub fn delay(&self, failures: u32) -> time::Duration {
        2u32.checked_pow(failures)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn backoff_doubles_up_to_max() {
        let backoff = Backoff::default();
        let delays = (0..8).map(|n| backoff.delay(n).as_secs()).collect::<Vec<_>>();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
        assert_eq!(backoff.delay(u32::MAX), backoff.max);
    }

    #[tokio::test]
    async fn deduplicates_pending_keys() {
        let queue = WorkQueue::<String>::default();
        queue.add("a".to_string());
        queue.add("b".to_string());
        queue.add("a".to_string());
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.get().await.as_deref(), Some("a"));
        assert_eq!(queue.get().await.as_deref(), Some("b"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn requeues_keys_added_while_processing() {
        let queue = WorkQueue::<String>::default();
        queue.add("a".to_string());
        let key = queue.get().await.unwrap();

        // The key is not handed to another worker while it is being processed.
        queue.add("a".to_string());
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.get().await.as_deref(), Some("a"));
        queue.done(&key);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn shut_down_wakes_workers() {
        let queue = WorkQueue::<String>::default();
        let worker = tokio::spawn({
            let queue = queue.clone();
            async move { queue.get().await }
        });
        tokio::task::yield_now().await;

        queue.add("a".to_string());
        queue.shut_down();
        queue.add("b".to_string());
        let _ = worker.await.unwrap();
        assert!(queue.get().await.is_none());
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_keys_back_off() {
        let queue = WorkQueue::<String>::default();
        queue.add_rate_limited("a".to_string());
        queue.add_rate_limited("a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 2);

        time::sleep(time::Duration::from_secs(4)).await;
        assert!(queue.is_empty());

        // The first retry fires after 5s; the second (10s) is coalesced into the pending key.
        time::sleep(time::Duration::from_secs(2)).await;
        assert_eq!(queue.len(), 1);
        time::sleep(time::Duration::from_secs(10)).await;
        assert_eq!(queue.len(), 1);

        queue.forget(&"a".to_string());
        assert_eq!(queue.num_requeues(&"a".to_string()), 0);
    }
}
