use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

struct State<K> {
    /// Eligible now, FIFO.
    ready: VecDeque<K>,
    ready_set: FxHashSet<K>,
    /// Waiting for their not-before instant.
    delayed: FxHashMap<K, Instant>,
    /// Handed out by `get` and not yet `done`.
    processing: FxHashSet<K>,
    /// Added while processing; re-admitted by `done`.
    dirty: FxHashMap<K, Instant>,
    shutting_down: bool,
}

impl<K: Clone + Eq + Hash> State<K> {
    fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            ready_set: FxHashSet::default(),
            delayed: FxHashMap::default(),
            processing: FxHashSet::default(),
            dirty: FxHashMap::default(),
            shutting_down: false,
        }
    }

    /// Returns true when waiters should re-check the queue.
    fn admit(&mut self, key: K, not_before: Instant, now: Instant) -> bool {
        if self.processing.contains(&key) {
            let slot = self.dirty.entry(key).or_insert(not_before);
            if not_before < *slot {
                *slot = not_before;
            }
            return false;
        }
        if self.ready_set.contains(&key) {
            return false;
        }
        if not_before <= now {
            self.delayed.remove(&key);
            self.push_ready(key);
            return true;
        }
        match self.delayed.get_mut(&key) {
            Some(existing) if *existing <= not_before => false,
            Some(existing) => {
                *existing = not_before;
                true
            }
            None => {
                self.delayed.insert(key, not_before);
                true
            }
        }
    }

    fn push_ready(&mut self, key: K) {
        self.ready_set.insert(key.clone());
        self.ready.push_back(key);
    }

    /// Move every delayed key whose instant has passed to the ready list,
    /// earliest first.
    fn promote(&mut self, now: Instant) {
        if self.delayed.is_empty() {
            return;
        }
        let mut due: Vec<(Instant, K)> = self
            .delayed
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(k, at)| (*at, k.clone()))
            .collect();
        due.sort_by_key(|(at, _)| *at);
        for (_, key) in due {
            self.delayed.remove(&key);
            self.push_ready(key);
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.delayed.values().min().copied()
    }
}

/// Deduplicating work queue with delayed admission.
///
/// A key is in at most one of: ready, delayed, processing. Adding a key that is
/// already pending keeps the earliest not-before instant; adding a key that is
/// being processed marks it dirty so `done` puts it back.
pub struct WorkQueue<K> {
    name: String,
    state: Mutex<State<K>>,
    notify: Notify,
}

impl<K: Clone + Eq + Hash + Send> WorkQueue<K> {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), state: Mutex::new(State::new()), notify: Notify::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn lock(&self) -> MutexGuard<'_, State<K>> {
        // State is plain bookkeeping and stays consistent across a poisoning panic.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add(&self, key: K) {
        self.add_after(key, Duration::ZERO);
    }

    /// Admit `key` no earlier than `delay` from now. A shorter delay tightens an
    /// existing pending entry; a longer one never pushes it back.
    pub fn add_after(&self, key: K, delay: Duration) {
        let wake = {
            let mut st = self.lock();
            if st.shutting_down {
                return;
            }
            let now = Instant::now();
            let not_before = now.checked_add(delay).unwrap_or_else(|| now + FAR_FUTURE);
            st.admit(key, not_before, now)
        };
        if wake {
            self.notify.notify_waiters();
        }
    }

    /// Wait for the next eligible key and mark it in flight. Returns `None`
    /// once the queue is shut down and its ready keys are drained.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let deadline = {
                let mut st = self.lock();
                st.promote(Instant::now());
                if let Some(key) = st.ready.pop_front() {
                    st.ready_set.remove(&key);
                    st.processing.insert(key.clone());
                    return Some(key);
                }
                if st.shutting_down {
                    return None;
                }
                st.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Finish processing `key`; if it was added meanwhile, admit it again.
    pub fn done(&self, key: &K) {
        let wake = {
            let mut st = self.lock();
            st.processing.remove(key);
            match st.dirty.remove(key) {
                Some(not_before) if !st.shutting_down => st.admit(key.clone(), not_before, Instant::now()),
                _ => false,
            }
        };
        if wake {
            self.notify.notify_waiters();
        }
    }

    /// Stop accepting keys. Delayed and dirty keys are dropped; ready keys are
    /// still handed out until drained.
    pub fn shutdown(&self) {
        {
            let mut st = self.lock();
            st.shutting_down = true;
            let dropped = st.delayed.len() + st.dirty.len();
            st.delayed.clear();
            st.dirty.clear();
            debug!(queue = %self.name, dropped, ready = st.ready.len(), "work queue shutting down");
        }
        self.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Pending keys, ready or delayed. In-flight keys are not counted.
    pub fn len(&self) -> usize {
        let st = self.lock();
        st.ready.len() + st.delayed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.lock().processing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn duplicates_collapse_into_one_item() {
        let q = WorkQueue::new("t");
        q.add("a");
        q.add("a");
        q.add("b");
        assert_eq!(q.len(), 2);
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn add_while_in_flight_is_redelivered_after_done() {
        let q = WorkQueue::new("t");
        q.add("a");
        let key = q.get().await.expect("item");
        q.add("a");
        q.add("a");
        // Not eligible while in flight.
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 1);
        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        q.done(&"a");
        assert!(q.is_empty());
        assert_eq!(q.in_flight(), 0);
    }

    #[tokio::test]
    async fn done_without_new_event_does_not_requeue() {
        let q = WorkQueue::new("t");
        q.add(1u32);
        let k = q.get().await.expect("item");
        q.done(&k);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_item_becomes_eligible_after_delay() {
        let q = WorkQueue::new("t");
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(5));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn shorter_delay_tightens_and_longer_never_lengthens() {
        let q = WorkQueue::new("t");
        let start = Instant::now();
        q.add_after("a", Duration::from_secs(10));
        q.add_after("a", Duration::from_secs(2));
        q.add_after("a", Duration::from_secs(30));
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await, Some("a"));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(2));
        assert!(waited < Duration::from_secs(10), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn immediate_add_overrides_pending_delay() {
        let q = WorkQueue::new("t");
        q.add_after("a", Duration::from_secs(60));
        q.add("a");
        let got = tokio::time::timeout(Duration::from_millis(1), q.get()).await;
        assert_eq!(got.expect("ready without waiting"), Some("a"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn blocked_get_wakes_on_add() {
        let q = Arc::new(WorkQueue::new("t"));
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.add("late");
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("woken").expect("join");
        assert_eq!(got, Some("late"));
    }

    #[tokio::test]
    async fn shutdown_drains_ready_then_returns_none() {
        let q = WorkQueue::new("t");
        q.add("a");
        q.add_after("later", Duration::from_secs(60));
        q.shutdown();
        q.add("ignored");
        assert_eq!(q.get().await, Some("a"));
        assert_eq!(q.get().await, None);
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn shutdown_wakes_blocked_getters() {
        let q = Arc::new(WorkQueue::<&str>::new("t"));
        let waiter = tokio::spawn({
            let q = Arc::clone(&q);
            async move { q.get().await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        q.shutdown();
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("woken").expect("join");
        assert_eq!(got, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_getters_never_share_a_key() {
        let q = Arc::new(WorkQueue::new("t"));
        for i in 0..200u32 {
            q.add(i % 50);
        }
        q.shutdown();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let q = Arc::clone(&q);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(k) = q.get().await {
                    got.push(k);
                    q.done(&k);
                }
                got
            }));
        }
        let mut all = Vec::new();
        for h in handles {
            all.extend(h.await.expect("join"));
        }
        all.sort_unstable();
        assert_eq!(all, (0..50).collect::<Vec<_>>());
    }
}
