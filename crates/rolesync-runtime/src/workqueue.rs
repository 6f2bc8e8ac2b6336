//! Deduplicating, rate-limited work queue
//!
//! Semantics follow the classic controller queue:
//!
//! - An item is in at most one of three places: pending (in the FIFO),
//!   processing (handed to a worker), or both dirty and processing (re-added
//!   while a worker holds it).
//! - Adding an item that is already pending is a no-op.
//! - Adding an item that is being processed marks it dirty; it goes back
//!   into the FIFO when the worker calls [`WorkQueue::done`]. A key is
//!   therefore never held by two workers at once.
//! - After [`WorkQueue::shut_down`], adds are ignored and [`WorkQueue::get`]
//!   returns `None`.

use std::collections::{HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::rate_limiter::RateLimiter;

struct State<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

struct Inner<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    limiter: Box<dyn RateLimiter<T>>,
    shutdown: CancellationToken,
}

/// A cloneable handle to a shared work queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    /// Create a queue using `limiter` for rate-limited adds
    pub fn new(name: impl Into<String>, limiter: impl RateLimiter<T> + 'static) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                limiter: Box::new(limiter),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Queue name, used in logs
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Enqueue `item` unless it is already pending
    pub fn add(&self, item: T) {
        {
            let mut state = self.inner.state.lock();
            if state.shutting_down || state.dirty.contains(&item) {
                return;
            }
            state.dirty.insert(item.clone());
            if state.processing.contains(&item) {
                trace!(queue = %self.inner.name, ?item, "item in flight, marked dirty");
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.notify.notify_one();
    }

    /// Enqueue `item` once `delay` has elapsed
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Enqueue `item` after the rate limiter's delay, counting one retry
    pub fn add_rate_limited(&self, item: T) {
        let delay = self.inner.limiter.when(&item);
        trace!(queue = %self.inner.name, ?item, delay_ms = delay.as_millis(), "rate-limited add");
        self.add_after(item, delay);
    }

    /// Clear the retry history of `item`
    pub fn forget(&self, item: &T) {
        self.inner.limiter.forget(item);
    }

    /// Number of rate-limited requeues of `item` since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.inner.limiter.num_requeues(item)
    }

    /// Wait for the next item
    ///
    /// Returns `None` once the queue is shutting down. Every `Some` must be
    /// paired with exactly one [`WorkQueue::done`]; prefer
    /// [`WorkQueue::next`], which does that on drop.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before inspecting state so a concurrent add or
            // shutdown between the check and the await is not missed.
            notified.as_mut().enable();

            {
                let mut state = self.inner.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Wait for the next item, wrapped in a guard that calls `done` on drop
    pub async fn next(&self) -> Option<InFlight<T>> {
        self.get().await.map(|item| InFlight {
            queue: self.clone(),
            item: Some(item),
        })
    }

    /// Mark `item` as no longer being processed
    ///
    /// If it was re-added while in flight it goes back into the FIFO.
    pub fn done(&self, item: &T) {
        let requeued = {
            let mut state = self.inner.state.lock();
            state.processing.remove(item);
            if state.dirty.contains(item) && !state.shutting_down {
                state.queue.push_back(item.clone());
                true
            } else {
                false
            }
        };
        if requeued {
            self.inner.notify.notify_one();
        }
    }

    /// Stop accepting items and release every waiting worker
    pub fn shut_down(&self) {
        self.inner.state.lock().shutting_down = true;
        self.inner.shutdown.cancel();
        self.inner.notify.notify_waiters();
    }

    /// Whether [`WorkQueue::shut_down`] has been called
    pub fn is_shutting_down(&self) -> bool {
        self.inner.state.lock().shutting_down
    }

    /// Number of pending items
    pub fn len(&self) -> usize {
        self.inner.state.lock().queue.len()
    }

    /// Whether no items are pending
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// An item handed out by [`WorkQueue::next`]
///
/// Dropping it calls [`WorkQueue::done`], including on early return or panic.
pub struct InFlight<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    queue: WorkQueue<T>,
    item: Option<T>,
}

impl<T> Deref for InFlight<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    type Target = T;

    fn deref(&self) -> &T {
        // Only taken in drop
        self.item.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl<T> Drop for InFlight<T>
where
    T: Eq + Hash + Clone + Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.queue.done(&item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::{default_controller_rate_limiter, ItemExponentialFailureRateLimiter};

    fn queue() -> WorkQueue<String> {
        WorkQueue::new("test", default_controller_rate_limiter())
    }

    #[tokio::test]
    async fn delivers_in_fifo_order() {
        let q = queue();
        q.add("a".into());
        q.add("b".into());
        q.add("c".into());

        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
        assert_eq!(q.get().await.as_deref(), Some("c"));
    }

    #[tokio::test]
    async fn pending_duplicates_collapse() {
        let q = queue();
        q.add("a".into());
        q.add("b".into());
        q.add("a".into());
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn item_in_flight_is_requeued_on_done() {
        let q = queue();
        q.add("a".into());
        let item = q.get().await.unwrap();

        // Re-added while processing: must not be handed to another worker yet
        q.add("a".into());
        assert_eq!(q.len(), 0);

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn done_without_readd_does_not_requeue() {
        let q = queue();
        q.add("a".into());
        let item = q.get().await.unwrap();
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn in_flight_guard_calls_done_on_drop() {
        let q = queue();
        q.add("a".into());
        {
            let item = q.next().await.unwrap();
            assert_eq!(&*item, "a");
            q.add("a".into());
            assert!(q.is_empty());
        }
        assert_eq!(q.len(), 1);
    }

    #[tokio::test]
    async fn get_blocks_until_add() {
        let q = queue();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::task::yield_now().await;
        q.add("late".into());
        assert_eq!(waiter.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn shutdown_releases_waiters_and_ignores_adds() {
        let q = queue();
        let q2 = q.clone();
        let waiter = tokio::spawn(async move { q2.get().await });

        tokio::task::yield_now().await;
        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("a".into());
        assert!(q.is_empty());
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn add_after_delivers_once_delay_elapses() {
        let q = queue();
        q.add_after("a".into(), Duration::from_secs(5));
        tokio::task::yield_now().await;
        assert!(q.is_empty());

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_adds_count_requeues_until_forget() {
        let q = WorkQueue::new(
            "test",
            ItemExponentialFailureRateLimiter::new(
                Duration::from_millis(10),
                Duration::from_secs(1),
            ),
        );
        let key = "ns/domain".to_string();
        q.add_rate_limited(key.clone());
        q.add_rate_limited(key.clone());
        assert_eq!(q.num_requeues(&key), 2);

        assert_eq!(q.get().await.as_deref(), Some("ns/domain"));
        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_delayed_adds() {
        let q = queue();
        q.add_after("a".into(), Duration::from_secs(5));
        q.shut_down();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(q.is_empty());
    }
}
