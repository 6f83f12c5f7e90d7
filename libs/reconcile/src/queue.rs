//! Deduplicating, delaying work queue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::limiter::{ControllerRateLimiter, RateLimiter};

/// A deduplicating work queue with delayed and rate-limited insertion.
///
/// Workers call [`WorkQueue::get`] to take an item and must call
/// [`WorkQueue::done`] when they are finished with it. While an item is being
/// processed, adding it again only marks it dirty; it is queued again when the
/// worker calls `done`. This keeps one item on at most one worker at a time.
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Waiting<K>>,
    deadlines: HashMap<K, Instant>,
    limiter: Box<dyn RateLimiter<K>>,
    seq: u64,
    shutting_down: bool,
}

/// Heap entry for a delayed item. Ordered so the earliest deadline is on top.
struct Waiting<K> {
    ready_at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Waiting<K> {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.seq == other.seq
    }
}

impl<K> Eq for Waiting<K> {}

impl<K> PartialOrd for Waiting<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<K> Ord for Waiting<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<K> QueueState<K>
where
    K: Clone + Eq + Hash,
{
    /// Returns true if the item became ready to be handed out.
    fn insert(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            return false;
        }
        self.queue.push_back(key);
        true
    }

    /// Move every delayed item whose deadline passed into the ready queue.
    fn promote(&mut self, now: Instant) {
        while let Some(top) = self.waiting.peek() {
            if top.ready_at > now {
                break;
            }
            let Some(entry) = self.waiting.pop() else {
                break;
            };
            // Skip entries superseded by an earlier deadline.
            if self.deadlines.get(&entry.key) == Some(&entry.ready_at) {
                self.deadlines.remove(&entry.key);
                self.insert(entry.key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|entry| entry.ready_at)
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    /// Create a queue with the default controller rate limiter.
    pub fn new() -> Self {
        Self::with_rate_limiter(ControllerRateLimiter::default())
    }

    /// Create a queue with a custom rate limiter.
    pub fn with_rate_limiter(limiter: impl RateLimiter<K> + 'static) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                deadlines: HashMap::new(),
                limiter: Box::new(limiter),
                seq: 0,
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item for processing. No-op if it is already pending.
    pub fn add(&self, key: K) {
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if state.insert(key) {
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Queue an item once `delay` has passed.
    ///
    /// If the item is already waiting, the earlier deadline wins.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }

        let ready_at = Instant::now() + delay;
        let mut state = self.lock();
        if state.shutting_down {
            return;
        }
        if let Some(existing) = state.deadlines.get(&key) {
            if *existing <= ready_at {
                return;
            }
        }

        state.seq += 1;
        let seq = state.seq;
        state.deadlines.insert(key.clone(), ready_at);
        state.waiting.push(Waiting { ready_at, seq, key });
        drop(state);

        // Wake a waiter so it re-arms its timer on the new deadline.
        self.notify.notify_one();
    }

    /// Queue an item after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, key: K) {
        let delay = self.lock().limiter.when(&key);
        self.add_after(key, delay);
    }

    /// Reset the rate limiter's failure history for an item.
    pub fn forget(&self, key: &K) {
        self.lock().limiter.forget(key);
    }

    /// Number of rate-limited requeues since the last `forget`.
    pub fn num_requeues(&self, key: &K) -> u32 {
        self.lock().limiter.num_requeues(key)
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);

            let next_deadline = {
                let mut state = self.lock();
                state.promote(Instant::now());

                if state.shutting_down {
                    drop(state);
                    self.notify.notify_one();
                    return None;
                }

                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    let more = !state.queue.is_empty();
                    drop(state);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }

                // Register before releasing the lock so no wakeup is lost.
                notified.as_mut().enable();
                state.next_deadline()
            };

            match next_deadline {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Mark an item as finished. Re-queues it if it was added while processing.
    pub fn done(&self, key: &K) {
        let mut state = self.lock();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Stop handing out items and wake every waiting worker.
    ///
    /// Items still pending are dropped.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.shutting_down = true;
        state.queue.clear();
        state.waiting.clear();
        state.deadlines.clear();
        drop(state);

        tracing::debug!("work queue shutting down");
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Check if the queue has been shut down.
    pub fn is_shutting_down(&self) -> bool {
        self.lock().shutting_down
    }

    /// Number of items ready to be handed out.
    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Check if no item is ready to be handed out.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of items waiting on a deadline.
    pub fn waiting(&self) -> usize {
        self.lock().deadlines.len()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ItemBackoff;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Arc;

    fn queue() -> WorkQueue<String> {
        WorkQueue::with_rate_limiter(
            ItemBackoff::new(Duration::from_millis(5), Duration::from_secs(1)).unwrap(),
        )
    }

    #[tokio::test]
    async fn test_add_deduplicates_pending() {
        let q = queue();
        q.add("a".to_string());
        q.add("a".to_string());
        q.add("b".to_string());
        assert_eq!(q.len(), 2);

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_requeues_on_done() {
        let q = queue();
        q.add("a".to_string());

        let key = q.get().await.unwrap();
        q.add("a".to_string());
        // Not handed out again while processing.
        assert!(q.is_empty());

        q.done(&key);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
        q.done(&key);
        assert!(q.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_waits_for_deadline() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(5));
        assert!(q.is_empty());
        assert_eq!(q.waiting(), 1);

        let start = Instant::now();
        let key = q.get().await.unwrap();
        assert_eq!(key, "a");
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_earliest_deadline_wins() {
        let q = queue();
        q.add_after("a".to_string(), Duration::from_secs(10));
        q.add_after("a".to_string(), Duration::from_secs(2));
        q.add_after("a".to_string(), Duration::from_secs(30));
        assert_eq!(q.waiting(), 1);

        let start = Instant::now();
        assert_eq!(q.get().await.as_deref(), Some("a"));
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(2) && elapsed < Duration::from_secs(10));

        // The superseded heap entries do not produce a second delivery.
        q.done(&"a".to_string());
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(q.is_empty());
        assert_eq!(q.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_requeues_count() {
        let q = queue();
        let key = "a".to_string();

        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let q = Arc::new(queue());

        let mut workers = Vec::new();
        for _ in 0..3 {
            let q = q.clone();
            workers.push(tokio::spawn(async move { q.get().await }));
        }
        tokio::task::yield_now().await;

        q.shutdown();
        for worker in workers {
            assert_eq!(worker.await.unwrap(), None);
        }

        q.add("late".to_string());
        assert!(q.is_empty());
        assert!(q.is_shutting_down());
    }

    #[tokio::test]
    async fn test_concurrent_workers_never_share_an_item() {
        let q = Arc::new(queue());
        for i in 0..50 {
            q.add(format!("item-{}", i % 10));
        }

        let active = Arc::new(Mutex::new(HashSet::new()));
        let handled = Arc::new(AtomicUsize::new(0));
        let mut workers = Vec::new();
        for _ in 0..4 {
            let q = q.clone();
            let active = active.clone();
            let handled = handled.clone();
            workers.push(tokio::spawn(async move {
                while let Some(key) = q.get().await {
                    assert!(active.lock().unwrap().insert(key.clone()));
                    tokio::task::yield_now().await;
                    active.lock().unwrap().remove(&key);
                    q.done(&key);
                    handled.fetch_add(1, AtomicOrdering::SeqCst);
                }
            }));
        }

        while handled.load(AtomicOrdering::SeqCst) < 10 {
            tokio::task::yield_now().await;
        }
        q.shutdown();
        for worker in workers {
            worker.await.unwrap();
        }

        // Ten distinct keys, deduplicated while pending.
        assert_eq!(handled.load(AtomicOrdering::SeqCst), 10);
    }
}
