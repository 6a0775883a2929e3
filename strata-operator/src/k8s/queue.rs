//! A deduplicating, rate-limited work queue of cluster keys.
//!
//! A key is held by at most one worker at a time. A key added while it is being processed is
//! marked dirty and re-delivered exactly once, after the worker calls `done`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;

/// Per-key exponential backoff: `base * 2^failures`, capped at `max`.
pub struct RateLimiter {
    base: Duration,
    max: Duration,
    failures: Mutex<HashMap<String, u32>>,
}

impl RateLimiter {
    /// Create a new instance.
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: Default::default(),
        }
    }

    /// Record a failure of the given key, returning how long to wait before retrying it.
    pub fn when(&self, key: &str) -> Duration {
        let mut failures = lock(&self.failures);
        let count = failures.entry(key.to_string()).or_insert(0);
        let exp = *count;
        *count = count.saturating_add(1);
        backoff(exp, self.base, self.max)
    }

    /// Reset the backoff of the given key.
    pub fn forget(&self, key: &str) {
        lock(&self.failures).remove(key);
    }

    /// The number of failures recorded for the given key.
    pub fn num_requeues(&self, key: &str) -> u32 {
        lock(&self.failures).get(key).copied().unwrap_or(0)
    }
}

/// Calculate an exponential backoff duration.
fn backoff(exp: u32, base: Duration, max: Duration) -> Duration {
    let factor = 2u32.checked_pow(exp).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(max).min(max)
}

#[derive(Default)]
struct QueueState {
    /// Keys ready for processing, in order.
    queue: VecDeque<String>,
    /// Keys which need processing.
    dirty: HashSet<String>,
    /// Keys currently held by a worker.
    processing: HashSet<String>,
    shutting_down: bool,
}

/// The controller's work queue.
pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    limiter: RateLimiter,
}

impl WorkQueue {
    /// Create a new instance.
    pub fn new(limiter: RateLimiter) -> Arc<Self> {
        Arc::new(Self {
            state: Default::default(),
            notify: Notify::new(),
            limiter,
        })
    }

    /// Add a key for processing.
    pub fn add(&self, key: &str) {
        let mut state = lock(&self.state);
        if state.shutting_down || state.dirty.contains(key) {
            return;
        }
        state.dirty.insert(key.to_string());
        if state.processing.contains(key) {
            return;
        }
        state.queue.push_back(key.to_string());
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the next key to process, `None` once the queue is shutting down.
    ///
    /// The caller must call `done` with the key once finished.
    pub async fn get(&self) -> Option<String> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = lock(&self.state);
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark the processing of a key as finished, re-queuing it if it was added in the meantime.
    pub fn done(&self, key: &str) {
        let mut state = lock(&self.state);
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.to_string());
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add a key once its backoff has elapsed.
    pub fn add_rate_limited(self: &Arc<Self>, key: &str) {
        let delay = self.limiter.when(key);
        let (queue, key) = (self.clone(), key.to_string());
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(&key);
        });
    }

    /// Reset the backoff of a key.
    pub fn forget(&self, key: &str) {
        self.limiter.forget(key);
    }

    /// The number of times a key has been requeued since it was last forgotten.
    pub fn num_requeues(&self, key: &str) -> u32 {
        self.limiter.num_requeues(key)
    }

    /// Stop handing out keys. Waiting workers are released with `None`.
    pub fn shut_down(&self) {
        lock(&self.state).shutting_down = true;
        self.notify.notify_waiters();
    }

    /// The number of keys waiting to be processed.
    pub fn len(&self) -> usize {
        lock(&self.state).queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock the given mutex, recovering the data of a poisoned lock.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
