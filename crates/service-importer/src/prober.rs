//! Status-updater runtime: a registry of long-running periodic probers.
//!
//! Each registered key owns one worker task that probes on its own interval,
//! debounces transitions through rise/fall counters and publishes the last
//! committed status. Registering an existing key hot-swaps the prober
//! definition in place; the running worker picks it up at its next tick.

use std::any::Any;
use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

#[derive(Debug, Error)]
pub enum ProbeError {
    /// Sentinel: terminate the worker without logging.
    #[error("probe aborted")]
    Abort,
    /// Sentinel: the cycle produced no observation; skip silently.
    #[error("status unknown")]
    StatusUnknown,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum UpdateError {
    /// Sentinel: terminate the worker after this delivery.
    #[error("update aborted")]
    Abort,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A status value with an optional weight. `Some(w)` statuses are debounced
/// through the rise/fall counters; `None` (opaque) statuses commit
/// immediately.
pub trait StatusValue: Clone + PartialEq + Send + Sync + 'static {
    fn weight(&self) -> Option<i32> {
        None
    }
}

pub type ProbeFn<S> =
    Arc<dyn Fn(Duration) -> BoxFuture<'static, Result<S, ProbeError>> + Send + Sync>;
pub type UpdateFn<S> = Arc<dyn Fn(&S) -> Result<(), UpdateError> + Send + Sync>;

/// Wrap an update function so the worker terminates after the first
/// successful delivery.
pub fn update_once<S, F>(update: F) -> UpdateFn<S>
where
    S: StatusValue,
    F: Fn(&S) -> Result<(), UpdateError> + Send + Sync + 'static,
{
    Arc::new(move |status| {
        update(status)?;
        Err(UpdateError::Abort)
    })
}

/// A prober definition plus its internally published last status. The
/// published slot outlives the registry record, so one-shot updaters can
/// still read the value they committed.
pub struct Prober<S> {
    name: String,
    interval: Duration,
    timeout: Duration,
    rise: i32,
    fall: i32,
    probe: ProbeFn<S>,
    update: Option<UpdateFn<S>>,
    published: RwLock<Option<S>>,
    stored: AtomicBool,
}

impl<S: StatusValue> Prober<S> {
    pub fn new(name: impl Into<String>, probe: ProbeFn<S>) -> Self {
        Self {
            name: name.into(),
            interval: Duration::from_secs(10),
            timeout: Duration::from_secs(10),
            rise: 1,
            fall: 1,
            probe,
            update: None,
            published: RwLock::new(None),
            stored: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, val: Duration) -> Self {
        self.interval = val;
        self
    }

    pub fn with_timeout(mut self, val: Duration) -> Self {
        self.timeout = val;
        self
    }

    pub fn with_rise(mut self, val: i32) -> Self {
        self.rise = val;
        self
    }

    pub fn with_fall(mut self, val: i32) -> Self {
        self.fall = val;
        self
    }

    pub fn with_update(mut self, update: UpdateFn<S>) -> Self {
        self.update = Some(update);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn rise(&self) -> i32 {
        self.rise
    }

    pub fn fall(&self) -> i32 {
        self.fall
    }

    fn probe_status(&self) -> BoxFuture<'static, Result<S, ProbeError>> {
        (self.probe)(self.timeout)
    }

    /// Publish a committed status and deliver it to the update function.
    /// The value is published even when the update function fails.
    fn update_status(&self, status: &S) -> Result<(), UpdateError> {
        *self
            .published
            .write()
            .expect("prober status lock poisoned") = Some(status.clone());
        self.stored.store(true, Ordering::SeqCst);
        match &self.update {
            Some(update) => update(status),
            None => Ok(()),
        }
    }

    /// Last status published through this prober, if any.
    pub fn status(&self) -> Option<S> {
        if !self.stored.load(Ordering::SeqCst) {
            return None;
        }
        self.published
            .read()
            .expect("prober status lock poisoned")
            .clone()
    }
}

impl<S> fmt::Display for Prober<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "probe: {} interval={:?} timeout={:?} rise={} fall={}",
            self.name, self.interval, self.timeout, self.rise, self.fall
        )
    }
}

struct StatusRecord<S> {
    prober: RwLock<Arc<Prober<S>>>,
    status: RwLock<Option<S>>,
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

impl<S: StatusValue> StatusRecord<S> {
    fn prober(&self) -> Arc<Prober<S>> {
        self.prober
            .read()
            .expect("prober slot lock poisoned")
            .clone()
    }

    fn load_status(&self) -> Option<S> {
        self.status
            .read()
            .expect("record status lock poisoned")
            .clone()
    }

    /// Commit a status. Returns true when the worker must abort.
    fn store_status(&self, prober: &Prober<S>, status: S) -> bool {
        match prober.update_status(&status) {
            Err(UpdateError::Abort) => return true,
            Err(err) => {
                warn!(prober = %prober, error = %err, "update status failed");
                return false;
            }
            Ok(()) => {}
        }
        *self
            .status
            .write()
            .expect("record status lock poisoned") = Some(status);
        false
    }
}

/// Registry of running probers keyed by `K`. Cheap to clone; all clones
/// share the same records.
pub struct StatusUpdater<K, S> {
    records: Arc<DashMap<K, Arc<StatusRecord<S>>>>,
    root: CancellationToken,
}

impl<K, S> Clone for StatusUpdater<K, S>
where
    K: Eq + Hash,
{
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            root: self.root.clone(),
        }
    }
}

impl<K, S> StatusUpdater<K, S>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    S: StatusValue,
{
    /// Create a registry whose workers all stop when `root` is cancelled.
    pub fn new(root: CancellationToken) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            root,
        }
    }

    /// Register a prober under `key`. If the key is new the worker task is
    /// launched and `false` is returned; otherwise the existing record's
    /// prober definition is replaced in place and `true` is returned.
    pub fn start(&self, key: K, prober: Arc<Prober<S>>) -> bool {
        match self.records.entry(key.clone()) {
            Entry::Occupied(entry) => {
                *entry
                    .get()
                    .prober
                    .write()
                    .expect("prober slot lock poisoned") = prober;
                true
            }
            Entry::Vacant(entry) => {
                let (done_tx, done_rx) = watch::channel(false);
                let record = Arc::new(StatusRecord {
                    prober: RwLock::new(prober),
                    status: RwLock::new(None),
                    cancel: self.root.child_token(),
                    done: done_rx,
                });
                entry.insert(record.clone());
                tokio::spawn(Self::run(self.records.clone(), key, record, done_tx));
                false
            }
        }
    }

    /// Cancel the worker for `key` and wait for it to exit. Returns whether
    /// a worker was running.
    pub async fn stop(&self, key: &K) -> bool {
        let record = match self.records.get(key) {
            Some(record) => record.clone(),
            None => return false,
        };
        record.cancel.cancel();
        let mut done = record.done.clone();
        let _ = done.wait_for(|exited| *exited).await;
        true
    }

    /// Last committed status for `key`, if any.
    pub fn status(&self, key: &K) -> Option<S> {
        self.records.get(key).and_then(|record| record.load_status())
    }

    /// Current prober definition for `key`.
    pub fn get(&self, key: &K) -> Option<Arc<Prober<S>>> {
        self.records.get(key).map(|record| record.prober())
    }

    /// Number of currently registered keys (== running workers).
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    async fn run(
        records: Arc<DashMap<K, Arc<StatusRecord<S>>>>,
        key: K,
        record: Arc<StatusRecord<S>>,
        done: watch::Sender<bool>,
    ) {
        let looped = std::panic::AssertUnwindSafe(Self::probe_loop(&record))
            .catch_unwind()
            .await;
        if let Err(panic) = looped {
            error!(
                key = ?key,
                prober = %record.prober(),
                panic = panic_message(panic.as_ref()),
                "prober worker panicked"
            );
        }
        records.remove(&key);
        record.cancel.cancel();
        let _ = done.send(true);
    }

    async fn probe_loop(record: &StatusRecord<S>) {
        let mut success: i64 = 0;
        let mut failure: i64 = 0;
        let sleep = tokio::time::sleep(Duration::from_millis(1));
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                _ = record.cancel.cancelled() => return,
                _ = sleep.as_mut() => {}
            }

            // Re-read the prober: it may have been hot-swapped since the
            // last tick.
            let prober = record.prober();
            let interval = prober.interval();
            let abort = interval.is_zero();
            if !abort {
                sleep
                    .as_mut()
                    .reset(tokio::time::Instant::now() + interval);
            }

            let probed = {
                let fut = prober.probe_status();
                let timeout = prober.timeout();
                if timeout.is_zero() {
                    fut.await
                } else {
                    match tokio::time::timeout(timeout, fut).await {
                        Ok(result) => result,
                        Err(_) => Err(ProbeError::Other(anyhow::anyhow!(
                            "probe timed out after {timeout:?}"
                        ))),
                    }
                }
            };

            let previous = record.load_status();
            let committed = match probed {
                Err(ProbeError::Abort) => return,
                Err(ProbeError::StatusUnknown) => None,
                Err(err) => {
                    warn!(prober = %prober, error = %err, "probe failed");
                    None
                }
                Ok(status) => match status.weight() {
                    Some(w) if w > 0 => {
                        success += i64::from(w);
                        failure = 0;
                        (success >= i64::from(prober.rise())).then_some(status)
                    }
                    Some(w) if w < 0 => {
                        failure += i64::from(w);
                        success = 0;
                        (failure <= -i64::from(prober.fall())).then_some(status)
                    }
                    Some(_) => None,
                    None => {
                        success = 0;
                        failure = 0;
                        Some(status)
                    }
                },
            };

            if let Some(status) = committed {
                if previous.as_ref() != Some(&status)
                    && record.store_status(&prober, status)
                {
                    return;
                }
            }
            if abort {
                return;
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
