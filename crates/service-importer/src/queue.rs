//! Deduplicating, rate-limited work queue.
//!
//! An item enqueued while already queued is dropped; an item enqueued while
//! being processed is re-queued once processing finishes. `add_rate_limited`
//! delays the enqueue by a per-item exponential backoff that `forget` resets.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

struct Inner<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    requeues: HashMap<T, u32>,
    shutting_down: bool,
}

pub struct WorkQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
}

impl<T> WorkQueue<T>
where
    T: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                requeues: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<T>> {
        self.inner.lock().expect("work queue mutex poisoned")
    }

    /// Enqueue an item. No-op if the item is already queued; if it is being
    /// processed it will be re-queued when `done` is called.
    pub fn add(&self, item: T) {
        let mut inner = self.lock();
        if inner.shutting_down || inner.dirty.contains(&item) {
            return;
        }
        inner.dirty.insert(item.clone());
        if inner.processing.contains(&item) {
            return;
        }
        inner.queue.push_back(item);
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueue after the item's current backoff delay.
    pub fn add_rate_limited(self: &Arc<Self>, item: T) {
        let delay = {
            let mut inner = self.lock();
            if inner.shutting_down {
                return;
            }
            let attempt = inner.requeues.entry(item.clone()).or_insert(0);
            *attempt += 1;
            backoff(*attempt)
        };
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Wait for the next item. Returns `None` once the queue is shut down
    /// and drained of waiters' interest.
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.queue.pop_front() {
                    inner.dirty.remove(&item);
                    inner.processing.insert(item.clone());
                    return Some(item);
                }
                if inner.shutting_down {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Mark an item's processing finished, re-queueing it if it was
    /// re-added meanwhile.
    pub fn done(&self, item: &T) {
        let mut inner = self.lock();
        inner.processing.remove(item);
        if inner.dirty.contains(item) {
            inner.queue.push_back(item.clone());
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Reset the item's backoff counter.
    pub fn forget(&self, item: &T) {
        self.lock().requeues.remove(item);
    }

    pub fn num_requeues(&self, item: &T) -> u32 {
        self.lock().requeues.get(item).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().queue.is_empty()
    }

    pub fn shut_down(&self) {
        self.lock().shutting_down = true;
        self.notify.notify_waiters();
    }
}

fn backoff(attempt: u32) -> Duration {
    let exp = attempt.saturating_sub(1).min(30);
    BASE_DELAY
        .saturating_mul(2u32.saturating_pow(exp))
        .min(MAX_DELAY)
}
