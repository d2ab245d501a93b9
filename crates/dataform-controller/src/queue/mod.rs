//! Deduplicating, rate-limited work queue.
//!
//! Items move through three sets:
//!
//! ```text
//!   add ──► dirty + queue ──get──► processing ──done──┐
//!            ▲                                        │
//!            └────────── re-queued if dirtied ◄───────┘
//! ```
//!
//! - An item already waiting in the queue is not queued twice.
//! - An item added while it is being processed is only marked dirty, and goes
//!   back on the queue when `done` is called. A single item is therefore never
//!   handed to two workers at once.
//! - Failed items come back through `add_rate_limited`, which delays them
//!   according to the queue's [`RateLimiter`].

pub mod rate_limiter;

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{Notify, watch};

pub use rate_limiter::{
    BucketRateLimiter, InvalidRateLimit, ItemExponentialRateLimiter, MaxOfRateLimiter,
    RateLimiter, controller_rate_limiter, default_controller_rate_limiter,
};

struct State<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    shutting_down: bool,
}

struct Inner<K> {
    state: Mutex<State<K>>,
    available: Notify,
    shutdown: watch::Sender<bool>,
    rate_limiter: Box<dyn RateLimiter<K>>,
}

impl<K> Inner<K> {
    fn lock(&self) -> MutexGuard<'_, State<K>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Work queue shared by event intake and workers. Clones share one queue.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new(rate_limiter: impl RateLimiter<K> + 'static) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                shutdown,
                rate_limiter: Box::new(rate_limiter),
            }),
        }
    }

    /// Queue using [`default_controller_rate_limiter`].
    pub fn with_default_rate_limiter() -> Self {
        Self::new(default_controller_rate_limiter())
    }

    /// Queues `item` unless it is already waiting. Ignored after shutdown.
    pub fn add(&self, item: K) {
        {
            let mut state = self.inner.lock();
            if state.shutting_down {
                return;
            }
            if !state.dirty.insert(item.clone()) {
                return;
            }
            if state.processing.contains(&item) {
                return;
            }
            state.queue.push_back(item);
        }
        self.inner.available.notify_one();
    }

    /// Waits for the next item and marks it as processing.
    ///
    /// Returns `None` once the queue is shut down, even if items are still
    /// waiting; they are abandoned.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.queue.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    if !state.queue.is_empty() {
                        self.inner.available.notify_one();
                    }
                    return Some(item);
                }
            }

            notified.await;
        }
    }

    /// Marks `item` as no longer processing, re-queueing it if it was added
    /// in the meantime.
    pub fn done(&self, item: &K) {
        {
            let mut state = self.inner.lock();
            state.processing.remove(item);
            if state.shutting_down || !state.dirty.contains(item) {
                return;
            }
            state.queue.push_back(item.clone());
        }
        self.inner.available.notify_one();
    }

    /// Queues `item` after `delay`. Pending delays are dropped on shutdown.
    pub fn add_after(&self, item: K, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }

        let queue = self.clone();
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => queue.add(item),
                _ = async { let _ = shutdown.wait_for(|stopped| *stopped).await; } => {}
            }
        });
    }

    /// Queues `item` after the delay chosen by the rate limiter.
    pub fn add_rate_limited(&self, item: K) {
        let delay = self.inner.rate_limiter.when(&item);
        self.add_after(item, delay);
    }

    /// Clears the retry history of `item`.
    pub fn forget(&self, item: &K) {
        self.inner.rate_limiter.forget(item);
    }

    pub fn num_requeues(&self, item: &K) -> u32 {
        self.inner.rate_limiter.num_requeues(item)
    }

    /// Number of items waiting to be picked up.
    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Stops accepting work and releases every blocked `get`.
    pub fn shut_down(&self) {
        self.inner.lock().shutting_down = true;
        self.inner.shutdown.send_replace(true);
        self.inner.available.notify_waiters();
    }
}

impl<K> std::fmt::Debug for WorkQueue<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("WorkQueue")
            .field("queued", &state.queue.len())
            .field("processing", &state.processing.len())
            .field("shutting_down", &state.shutting_down)
            .finish()
    }
}
