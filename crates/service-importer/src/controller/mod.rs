//! Endpoints importer controller.
//!
//! Watches annotated `v1/Endpoints` objects, keeps a [`TargetRecord`] per
//! object, and drains a rate-limited queue to apply merge patches reflecting
//! discovered-and-healthy membership.

pub mod target;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher;
use kube::Client;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::fluconf::{self, Config};
use crate::probes::{ProbeConfigError, ProbeWeight};
use crate::prober::StatusUpdater;
use crate::queue::WorkQueue;
use crate::source::{DnsResolve, LoadResult, SourceError};

use target::{ObjectKey, ProbeKey, SourceKey, TargetRecord};

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("update probes: {0}")]
    Probes(#[from] ProbeConfigError),
    #[error("update sources: {0}")]
    Sources(#[from] SourceError),
}

/// Annotation-level defaults for probe entries.
fn probe_defaults() -> Config {
    Config::from([
        ("interval", "5s"),
        ("timeout", "5s"),
        ("fall", "3"),
        ("rise", "3"),
    ])
}

/// Annotation-level defaults for source entries.
fn source_defaults() -> Config {
    Config::from([("interval", "30s"), ("timeout", "30s")])
}

pub struct Importer {
    label_selector: String,
    annotation_probes: String,
    annotation_sources: String,
    pub(crate) probe_updater: StatusUpdater<ProbeKey, ProbeWeight>,
    pub(crate) source_updater: StatusUpdater<SourceKey, LoadResult>,
    pub(crate) resolver: Arc<dyn DnsResolve>,
    pub(crate) queue: Arc<WorkQueue<ObjectKey>>,
    targets: Mutex<HashMap<ObjectKey, Arc<TargetRecord>>>,
    root: CancellationToken,
}

impl Importer {
    pub fn new(
        prefix: &str,
        profile: &str,
        resolver: Arc<dyn DnsResolve>,
        root: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            label_selector: format!("{prefix}importer={profile}"),
            annotation_probes: format!("{prefix}probes"),
            annotation_sources: format!("{prefix}sources"),
            probe_updater: StatusUpdater::new(root.clone()),
            source_updater: StatusUpdater::new(root.clone()),
            resolver,
            queue: WorkQueue::new(),
            targets: Mutex::new(HashMap::new()),
            root,
        })
    }

    pub fn label_selector(&self) -> &str {
        &self.label_selector
    }

    /// Watch annotated endpoints and reconcile until the root context is
    /// cancelled or the watch stream ends.
    pub async fn run(self: Arc<Self>, client: Client, resync: Duration) -> anyhow::Result<()> {
        let worker = tokio::spawn(self.clone().process_updates(client.clone()));
        if !resync.is_zero() {
            tokio::spawn(self.clone().resync_loop(resync));
        }

        info!(selector = %self.label_selector, "watching endpoints");
        let api: Api<Endpoints> = Api::all(client);
        let config = watcher::Config::default().labels(&self.label_selector);
        let mut stream = std::pin::pin!(watcher(api, config));
        loop {
            tokio::select! {
                _ = self.root.cancelled() => break,
                event = stream.try_next() => match event {
                    Ok(Some(event)) => self.handle_event(event).await,
                    Ok(None) => break,
                    Err(err) => {
                        info!(error = %err, "watch disconnected");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
        self.queue.shut_down();
        let _ = worker.await;
        Ok(())
    }

    async fn handle_event(&self, event: watcher::Event<Endpoints>) {
        match event {
            watcher::Event::Apply(endpoints) | watcher::Event::InitApply(endpoints) => {
                self.handle_endpoints(&endpoints, false).await;
            }
            watcher::Event::Delete(endpoints) => {
                self.handle_endpoints(&endpoints, true).await;
            }
            watcher::Event::Init | watcher::Event::InitDone => {}
        }
    }

    /// Parse the object's annotations and bring its target record up to
    /// date. Deletion is an update with empty conf lists.
    pub async fn handle_endpoints(&self, endpoints: &Endpoints, deleted: bool) {
        let mut probe_confs = Vec::new();
        let mut source_confs = Vec::new();
        if !deleted {
            if let Some(annotations) = endpoints.metadata.annotations.as_ref() {
                if let Some(text) = annotations.get(&self.annotation_probes) {
                    probe_confs = fluconf::parse(text, "probe", &probe_defaults());
                }
                if let Some(text) = annotations.get(&self.annotation_sources) {
                    source_confs = fluconf::parse(text, "source", &source_defaults());
                }
            }
        }
        if let Err(err) = self.update_target(endpoints, probe_confs, source_confs).await {
            warn!(
                namespace = endpoints.metadata.namespace.as_deref().unwrap_or_default(),
                name = endpoints.metadata.name.as_deref().unwrap_or_default(),
                error = %err,
                "failed to update import target"
            );
        }
    }

    async fn update_target(
        &self,
        endpoints: &Endpoints,
        probe_confs: Vec<Config>,
        source_confs: Vec<Config>,
    ) -> Result<(), ImportError> {
        let key = ObjectKey {
            namespace: endpoints.metadata.namespace.clone().unwrap_or_default(),
            name: endpoints.metadata.name.clone().unwrap_or_default(),
        };
        let mut targets = self.targets.lock().await;
        let existing = targets.get(&key).cloned();
        if existing.is_none() && probe_confs.is_empty() && source_confs.is_empty() {
            return Ok(());
        }
        let target = match existing {
            Some(target) => target,
            None => {
                let target = Arc::new(TargetRecord::new(key.clone()));
                targets.insert(key.clone(), target.clone());
                target
            }
        };
        target.update_subsets(endpoints.subsets.clone().unwrap_or_default());
        let probes = target.update_probes(self, &probe_confs).await;
        let sources = target.update_sources(self, &source_confs).await;
        let (has_probes, has_sources) = (probes?, sources?);
        if !has_probes && !has_sources {
            targets.remove(&key);
        }
        drop(targets);
        self.queue.add(key);
        Ok(())
    }

    /// Drain the work queue, applying one merge patch per dequeued object.
    async fn process_updates(self: Arc<Self>, client: Client) {
        while let Some(key) = self.queue.get().await {
            let target = self.targets.lock().await.get(&key).cloned();
            let Some(target) = target else {
                self.queue.done(&key);
                continue;
            };
            match target.build_patch(&self).await {
                None => {
                    debug!(object = %key, "no endpoint changes");
                    self.queue.forget(&key);
                }
                Some(patch) => {
                    let api: Api<Endpoints> =
                        Api::namespaced(client.clone(), &key.namespace);
                    match api
                        .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
                        .await
                    {
                        Ok(_) => {
                            info!(object = %key, "endpoints updated");
                            self.queue.forget(&key);
                        }
                        Err(err) => {
                            warn!(
                                object = %key,
                                retries = self.queue.num_requeues(&key),
                                error = %err,
                                "failed to patch endpoints"
                            );
                            self.queue.add_rate_limited(key.clone());
                        }
                    }
                }
            }
            self.queue.done(&key);
        }
    }

    /// Periodically re-enqueue every known target so membership is
    /// recomputed even without informer events.
    async fn resync_loop(self: Arc<Self>, period: Duration) {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await;
        loop {
            tokio::select! {
                _ = self.root.cancelled() => return,
                _ = tick.tick() => {
                    let keys: Vec<ObjectKey> =
                        self.targets.lock().await.keys().cloned().collect();
                    debug!(targets = keys.len(), "resync");
                    for key in keys {
                        self.queue.add(key);
                    }
                }
            }
        }
    }

    /// JSON snapshot of all watched targets, served by the inspection
    /// endpoint.
    pub async fn inspect(&self) -> serde_json::Value {
        let targets: Vec<Arc<TargetRecord>> =
            self.targets.lock().await.values().cloned().collect();
        let mut out = Vec::with_capacity(targets.len());
        for target in targets {
            out.push(target.inspect(self).await);
        }
        serde_json::json!({ "targets": out })
    }

    #[cfg(test)]
    async fn target(&self, key: &ObjectKey) -> Option<Arc<TargetRecord>> {
        self.targets.lock().await.get(key).cloned()
    }

    #[cfg(test)]
    async fn target_count(&self) -> usize {
        self.targets.lock().await.len()
    }
}
