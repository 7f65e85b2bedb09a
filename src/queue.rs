//! A small rate-limited, single-flight work queue, standing in for the
//! canonical "default controller rate limiter" (per-item exponential
//! backoff plus a cap) used by `controller.go`'s `podQueue`. Keys in flight
//! are never processed by two workers simultaneously; retries are
//! re-enqueued with backoff rather than handled via in-line sleeps, so
//! worker tasks are never blocked waiting out someone else's backoff.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::sleep;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct Inner<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    /// Keys that got an `add()` while already `processing`; requeued by
    /// `done()` once the in-flight run finishes, so the same key is never
    /// handed to two workers at once.
    dirty: HashSet<K>,
    failures: std::collections::HashMap<K, u32>,
    shutting_down: bool,
}

/// A rate-limited, single-flight FIFO queue of keys of type `K`.
pub struct RateLimitingQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    /// Mirrors the queued-length, kept outside the mutex so `/debug/vars`
    /// can read it without an async round-trip.
    depth: AtomicUsize,
}

impl<K> RateLimitingQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    pub fn new() -> Self {
        RateLimitingQueue {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                failures: std::collections::HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
            depth: AtomicUsize::new(0),
        }
    }

    /// Enqueues a key immediately unless it is already queued or currently
    /// being processed (single-flight: a key in flight is marked dirty
    /// instead, and `done()` requeues it once the worker finishes, so it
    /// never lands in the queue a second time while still processing).
    pub async fn add(&self, key: K) {
        let mut inner = self.inner.lock().await;
        if inner.queued.contains(&key) {
            return;
        }
        if inner.processing.contains(&key) {
            inner.dirty.insert(key);
            return;
        }
        inner.queued.insert(key.clone());
        inner.queue.push_back(key);
        self.depth.store(inner.queue.len(), Ordering::Relaxed);
        drop(inner);
        self.notify.notify_one();
    }

    /// Re-enqueues a key after an exponential backoff delay scaled by its
    /// consecutive-failure count, capped at `MAX_DELAY`. Spawns its own
    /// delay task so the calling worker is freed immediately rather than
    /// blocking on the backoff.
    pub async fn add_rate_limited(self: &std::sync::Arc<Self>, key: K) {
        let delay = {
            let mut inner = self.inner.lock().await;
            let failures = inner.failures.entry(key.clone()).or_insert(0);
            *failures += 1;
            let shift = (*failures).min(16);
            let delay = BASE_DELAY.saturating_mul(1u32 << shift);
            delay.min(MAX_DELAY)
        };
        let this = self.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            this.add(key).await;
        });
    }

    /// Clears the failure count for a key on success, per the queue's
    /// "forget on success" contract.
    pub async fn forget(&self, key: &K) {
        self.inner.lock().await.failures.remove(key);
    }

    /// Pops the next key, or `None` if the queue is shutting down and
    /// drained. Marks the key as "processing" so a duplicate `add` for the
    /// same key while it's in flight is deferred (marked dirty) rather than
    /// handed to a second concurrent worker.
    pub async fn get(&self) -> Option<K> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(key) = inner.queue.pop_front() {
                    inner.queued.remove(&key);
                    inner.processing.insert(key.clone());
                    self.depth.store(inner.queue.len(), Ordering::Relaxed);
                    return Some(key);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks processing of a key complete. If an `add()` arrived for this
    /// key while it was processing, it was deflected into `dirty` instead of
    /// the queue; requeue it now so the update it carried isn't lost.
    pub async fn done(&self, key: &K) {
        let mut inner = self.inner.lock().await;
        inner.processing.remove(key);
        if inner.dirty.remove(key) {
            inner.queued.insert(key.clone());
            inner.queue.push_back(key.clone());
            self.depth.store(inner.queue.len(), Ordering::Relaxed);
            drop(inner);
            self.notify.notify_one();
        }
    }

    pub async fn shut_down(&self) {
        self.inner.lock().await.shutting_down = true;
        self.notify.notify_waiters();
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.queue.len()
    }

    /// Approximate queue depth without awaiting the lock; for metrics only.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

impl<K> Default for RateLimitingQueue<K>
where
    K: Eq + Hash + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn single_flight_dedupes_queued_key() {
        let q: RateLimitingQueue<String> = RateLimitingQueue::new();
        q.add("a".to_string()).await;
        q.add("a".to_string()).await;
        assert_eq!(q.len().await, 1);
    }

    #[tokio::test]
    async fn get_returns_in_fifo_order() {
        let q: RateLimitingQueue<i32> = RateLimitingQueue::new();
        q.add(1).await;
        q.add(2).await;
        assert_eq!(q.get().await, Some(1));
        assert_eq!(q.get().await, Some(2));
    }

    #[tokio::test]
    async fn rate_limited_requeue_eventually_reappears() {
        let q = Arc::new(RateLimitingQueue::<i32>::new());
        q.add_rate_limited(7).await;
        // Should not be visible instantly (first backoff slot is short but non-zero).
        tokio::time::sleep(Duration::from_millis(1)).await;
        let got = tokio::time::timeout(Duration::from_secs(2), q.get()).await;
        assert_eq!(got.unwrap(), Some(7));
    }

    #[tokio::test]
    async fn add_while_processing_is_deferred_not_requeued() {
        let q: RateLimitingQueue<String> = RateLimitingQueue::new();
        q.add("a".to_string()).await;
        assert_eq!(q.get().await, Some("a".to_string()));
        // "a" is now processing; a concurrent add must not let a second
        // `get()` hand it out again.
        q.add("a".to_string()).await;
        assert_eq!(q.len().await, 0);

        q.done(&"a".to_string()).await;
        assert_eq!(q.len().await, 1);
        assert_eq!(q.get().await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn shut_down_unblocks_get() {
        let q: Arc<RateLimitingQueue<i32>> = Arc::new(RateLimitingQueue::new());
        let q2 = q.clone();
        let handle = tokio::spawn(async move { q2.get().await });
        tokio::task::yield_now().await;
        q.shut_down().await;
        assert_eq!(handle.await.unwrap(), None);
    }
}
