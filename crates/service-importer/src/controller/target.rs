//! Per-endpoints-object reconciliation state.
//!
//! A [`TargetRecord`] owns the probe and source registrations for one
//! endpoints object, composes the discovered members with the object's
//! existing subsets and produces the minimal merge patch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort, EndpointSubset};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::info;

use crate::fluconf::Config;
use crate::probes::{self, ProbeWeight};
use crate::prober::{Prober, UpdateFn};
use crate::source::{self, LoadResult};

use super::{ImportError, Importer};

/// Identifies one endpoints object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub ip: String,
    pub port: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ProbeKey {
    pub object: ObjectKey,
    pub host: HostKey,
    pub probe: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub object: ObjectKey,
    pub source: String,
}

#[derive(Default)]
struct TargetState {
    probe_confs: Vec<Config>,
    source_confs: Vec<Config>,
    probes: HashMap<ProbeKey, Arc<Prober<ProbeWeight>>>,
    sources: HashMap<SourceKey, Arc<Prober<LoadResult>>>,
}

pub struct TargetRecord {
    key: ObjectKey,
    subsets: RwLock<Vec<EndpointSubset>>,
    state: Mutex<TargetState>,
}

impl TargetRecord {
    pub fn new(key: ObjectKey) -> Self {
        Self {
            key,
            subsets: RwLock::new(Vec::new()),
            state: Mutex::new(TargetState::default()),
        }
    }

    pub fn key(&self) -> &ObjectKey {
        &self.key
    }

    /// Deep copy of the most recently observed subsets; readers never see
    /// the cached snapshot mutate under them.
    pub fn last_subsets(&self) -> Vec<EndpointSubset> {
        self.subsets
            .read()
            .expect("subsets lock poisoned")
            .clone()
    }

    pub fn update_subsets(&self, subsets: Vec<EndpointSubset>) {
        *self.subsets.write().expect("subsets lock poisoned") = subsets;
    }

    /// Reconcile the running probe set against the current subsets and probe
    /// confs: start probes for new (host, port, probe) combinations, stop the
    /// ones that vanished. Returns whether any probe confs exist.
    pub(super) async fn update_probes(
        &self,
        importer: &Importer,
        probe_confs: &[Config],
    ) -> Result<bool, ImportError> {
        let mut planned = Vec::new();
        for host in host_items(&self.last_subsets()) {
            let mut host_conf = Config::new();
            host_conf.insert("host", host.ip.clone());
            host_conf.insert("port", host.port.to_string());
            for conf in probe_confs {
                let update = enqueue_on_update(importer, self.key.clone());
                let prober = probes::load_probe(&host_conf.copy_with_all(conf), Some(update))?;
                if prober.name().is_empty() {
                    continue;
                }
                let key = ProbeKey {
                    object: self.key.clone(),
                    host: host.clone(),
                    probe: prober.name().to_string(),
                };
                planned.push((key, prober));
            }
        }

        let mut state = self.state.lock().await;
        let mut removed = std::mem::take(&mut state.probes);
        for (key, prober) in planned {
            removed.remove(&key);
            if !importer.probe_updater.start(key.clone(), prober.clone()) {
                info!(object = %self.key, probe = %prober, "healthcheck started");
            }
            state.probes.insert(key, prober);
        }
        state.probe_confs = probe_confs.to_vec();
        drop(state);

        for (key, prober) in removed {
            importer.probe_updater.stop(&key).await;
            info!(object = %self.key, probe = %prober, "healthcheck stopped");
        }
        Ok(!probe_confs.is_empty())
    }

    /// Reconcile the running source set against the source confs. Returns
    /// whether any source confs exist.
    pub(super) async fn update_sources(
        &self,
        importer: &Importer,
        source_confs: &[Config],
    ) -> Result<bool, ImportError> {
        let mut planned = Vec::new();
        for conf in source_confs {
            let update = enqueue_on_update(importer, self.key.clone());
            let prober = source::loader(conf, update, importer.resolver.clone())?;
            let key = SourceKey {
                object: self.key.clone(),
                source: prober.name().to_string(),
            };
            planned.push((key, prober));
        }

        let mut state = self.state.lock().await;
        let mut removed = std::mem::take(&mut state.sources);
        for (key, prober) in planned {
            removed.remove(&key);
            if !importer.source_updater.start(key.clone(), prober.clone()) {
                info!(object = %self.key, source = %prober, "source started");
            }
            state.sources.insert(key, prober);
        }
        state.source_confs = source_confs.to_vec();
        drop(state);

        for (key, prober) in removed {
            importer.source_updater.stop(&key).await;
            info!(object = %self.key, source = %prober, "source stopped");
        }
        Ok(!source_confs.is_empty())
    }

    /// Readiness opinion for one IP over the target's committed probe
    /// statuses: any negative weight forces not-ready, else any positive
    /// weight means ready, else no opinion.
    fn host_status(&self, state: &TargetState, importer: &Importer, ip: &str) -> Option<bool> {
        let mut status = None;
        for key in state.probes.keys() {
            if key.host.ip != ip {
                continue;
            }
            match importer.probe_updater.status(key) {
                None => continue,
                Some(ProbeWeight(w)) if w < 0 => return Some(false),
                Some(ProbeWeight(w)) if w > 0 => status = Some(true),
                Some(_) => {}
            }
        }
        status
    }

    fn source_results(&self, state: &TargetState, importer: &Importer) -> (Vec<LoadResult>, bool) {
        let mut results = Vec::new();
        let mut overwrite = false;
        for key in state.sources.keys() {
            if let Some(result) = importer.source_updater.status(key) {
                overwrite = overwrite || result.overwrite;
                results.push(result);
            }
        }
        (results, overwrite)
    }

    fn subsets_to_patch(
        &self,
        state: &TargetState,
        importer: &Importer,
    ) -> (Vec<EndpointSubset>, bool) {
        let (sources, overwrite) = self.source_results(state, importer);
        build_subsets(
            self.last_subsets(),
            &sources,
            overwrite,
            !state.probe_confs.is_empty(),
        )
    }

    /// Build the merge patch for this target, or `None` when nothing
    /// changed. Probe opinions flip addresses between the ready and
    /// not-ready lists on top of the composed subsets.
    pub(super) async fn build_patch(&self, importer: &Importer) -> Option<serde_json::Value> {
        let state = self.state.lock().await;
        let (subsets, mut update) = self.subsets_to_patch(&state, importer);
        let mut patched = Vec::with_capacity(subsets.len());
        for subset in subsets {
            let mut ready = Vec::new();
            let mut not_ready = Vec::new();
            for addr in subset.not_ready_addresses.unwrap_or_default() {
                if self.host_status(&state, importer, &addr.ip) == Some(true) {
                    update = true;
                    ready.push(addr);
                } else {
                    not_ready.push(addr);
                }
            }
            for addr in subset.addresses.unwrap_or_default() {
                if self.host_status(&state, importer, &addr.ip) == Some(false) {
                    update = true;
                    not_ready.push(addr);
                } else {
                    ready.push(addr);
                }
            }
            patched.push(EndpointSubset {
                addresses: (!ready.is_empty()).then_some(ready),
                not_ready_addresses: (!not_ready.is_empty()).then_some(not_ready),
                ports: subset.ports,
            });
        }
        update.then(|| json!({ "subsets": patched }))
    }

    /// Snapshot of the target's registrations and committed statuses, for
    /// the inspection endpoint.
    pub(super) async fn inspect(&self, importer: &Importer) -> serde_json::Value {
        let state = self.state.lock().await;
        let probes: Vec<_> = state
            .probes
            .keys()
            .map(|key| {
                json!({
                    "ip": key.host.ip,
                    "port": key.host.port,
                    "probe": key.probe,
                    "weight": importer.probe_updater.status(key).map(|w| w.0),
                })
            })
            .collect();
        let sources: Vec<_> = state
            .sources
            .keys()
            .map(|key| {
                let result = importer.source_updater.status(key);
                json!({
                    "source": key.source,
                    "ips": result.as_ref().map(|r| r.ips.clone()),
                    "ports": result.as_ref().map(|r| r.ports.clone()),
                })
            })
            .collect();
        json!({
            "namespace": self.key.namespace,
            "name": self.key.name,
            "probes": probes,
            "sources": sources,
        })
    }
}

fn enqueue_on_update<S: crate::prober::StatusValue>(
    importer: &Importer,
    key: ObjectKey,
) -> UpdateFn<S> {
    let queue = importer.queue.clone();
    Arc::new(move |_status| {
        queue.add(key.clone());
        Ok(())
    })
}

fn addresses(subset: &EndpointSubset) -> &[EndpointAddress] {
    subset.addresses.as_deref().unwrap_or_default()
}

fn not_ready_addresses(subset: &EndpointSubset) -> &[EndpointAddress] {
    subset.not_ready_addresses.as_deref().unwrap_or_default()
}

/// Every (ip, port) pair named by the subsets, across both the ready and
/// not-ready address lists.
fn host_items(subsets: &[EndpointSubset]) -> HashSet<HostKey> {
    let mut hosts = HashSet::new();
    for subset in subsets {
        for port in subset.ports.as_deref().unwrap_or_default() {
            if port.port <= 0 {
                continue;
            }
            for addr in not_ready_addresses(subset).iter().chain(addresses(subset)) {
                if !addr.ip.is_empty() {
                    hosts.insert(HostKey {
                        ip: addr.ip.clone(),
                        port: port.port,
                    });
                }
            }
        }
    }
    hosts
}

/// Two subsets are mergeable iff their port sets are equal: same ports, same
/// protocol on every port.
fn subset_matches(subset: &EndpointSubset, source: &LoadResult) -> bool {
    let ports = subset.ports.as_deref().unwrap_or_default();
    if source.ports.len() != ports.len() {
        return false;
    }
    let source_ports: HashSet<i32> = source.ports.iter().copied().collect();
    ports.iter().all(|port| {
        source_ports.contains(&port.port)
            && port.protocol.as_deref().unwrap_or_default() == source.protocol
    })
}

fn to_endpoint_ports(ports: &[i32], protocol: &str) -> Vec<EndpointPort> {
    ports
        .iter()
        .map(|&port| EndpointPort {
            port,
            protocol: Some(protocol.to_string()),
            ..Default::default()
        })
        .collect()
}

/// Remove the given IPs from both address lists. Returns whether anything
/// was removed.
fn exclude_addresses(subset: &mut EndpointSubset, exclude: &[String]) -> bool {
    let mut updated = false;
    for list in [&mut subset.addresses, &mut subset.not_ready_addresses] {
        if let Some(addrs) = list {
            let before = addrs.len();
            addrs.retain(|addr| !exclude.contains(&addr.ip));
            if addrs.len() != before {
                updated = true;
            }
            if addrs.is_empty() {
                *list = None;
            }
        }
    }
    updated
}

/// Add the given IPs to the subset unless already present in either list.
/// New IPs land in `not_ready_addresses` when `not_ready` is set.
fn include_addresses(subset: &mut EndpointSubset, include: &[String], not_ready: bool) -> bool {
    let mut updated = false;
    for ip in include {
        let present = addresses(subset).iter().any(|addr| addr.ip == *ip)
            || not_ready_addresses(subset).iter().any(|addr| addr.ip == *ip);
        if present {
            continue;
        }
        let list = if not_ready {
            &mut subset.not_ready_addresses
        } else {
            &mut subset.addresses
        };
        list.get_or_insert_with(Vec::new).push(EndpointAddress {
            ip: ip.clone(),
            ..Default::default()
        });
        updated = true;
    }
    updated
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Existing(usize),
    Created(usize),
}

/// Compose the existing subsets with the source results.
///
/// Each source maps to the first subset whose port set matches (creating one
/// if none does), contributes its IPs there, and evicts them from every
/// other subset. When any source carries the overwrite flag, IPs absent from
/// the union of all source results are swept out of the pre-existing
/// subsets, dropping subsets that become empty. The returned flag reports
/// whether anything changed.
pub fn build_subsets(
    subsets: Vec<EndpointSubset>,
    sources: &[LoadResult],
    overwrite: bool,
    not_ready: bool,
) -> (Vec<EndpointSubset>, bool) {
    if sources.is_empty() {
        return (subsets, false);
    }
    let mut subsets = subsets;
    let mut created: Vec<EndpointSubset> = Vec::new();
    let mut mappings: Vec<Slot> = Vec::with_capacity(sources.len());
    let mut update = false;

    for source in sources {
        if let Some(i) = subsets.iter().position(|s| subset_matches(s, source)) {
            mappings.push(Slot::Existing(i));
        } else if let Some(i) = created.iter().position(|s| subset_matches(s, source)) {
            mappings.push(Slot::Created(i));
        } else {
            created.push(EndpointSubset {
                ports: Some(to_endpoint_ports(&source.ports, &source.protocol)),
                ..Default::default()
            });
            mappings.push(Slot::Created(created.len() - 1));
            update = true;
        }
    }

    let mut source_ips: HashSet<String> = HashSet::new();
    for (source, slot) in sources.iter().zip(&mappings) {
        for (i, subset) in subsets.iter_mut().enumerate() {
            if *slot != Slot::Existing(i) {
                update |= exclude_addresses(subset, &source.ips);
            }
        }
        for (i, subset) in created.iter_mut().enumerate() {
            if *slot != Slot::Created(i) {
                update |= exclude_addresses(subset, &source.ips);
            }
        }
        let chosen = match slot {
            Slot::Existing(i) => &mut subsets[*i],
            Slot::Created(i) => &mut created[*i],
        };
        update |= include_addresses(chosen, &source.ips, not_ready);
        source_ips.extend(source.ips.iter().cloned());
    }

    let mut result = Vec::with_capacity(subsets.len() + created.len());
    for mut subset in subsets {
        let mut del_ips = Vec::new();
        let mut keep = false;
        for addr in addresses(&subset).iter().chain(not_ready_addresses(&subset)) {
            if overwrite && !source_ips.contains(&addr.ip) {
                del_ips.push(addr.ip.clone());
            } else {
                keep = true;
            }
        }
        if !del_ips.is_empty() {
            exclude_addresses(&mut subset, &del_ips);
        }
        let keep = keep
            && (!addresses(&subset).is_empty() || !not_ready_addresses(&subset).is_empty());
        update = update || !del_ips.is_empty() || !keep;
        if keep {
            result.push(subset);
        }
    }
    result.extend(created);
    (result, update)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str) -> EndpointAddress {
        EndpointAddress {
            ip: ip.to_string(),
            ..Default::default()
        }
    }

    fn port(p: i32) -> EndpointPort {
        EndpointPort {
            port: p,
            protocol: Some("TCP".to_string()),
            ..Default::default()
        }
    }

    fn subset(ips: &[&str], not_ready: &[&str], ports: &[i32]) -> EndpointSubset {
        EndpointSubset {
            addresses: (!ips.is_empty()).then(|| ips.iter().map(|ip| addr(ip)).collect()),
            not_ready_addresses: (!not_ready.is_empty())
                .then(|| not_ready.iter().map(|ip| addr(ip)).collect()),
            ports: Some(ports.iter().map(|&p| port(p)).collect()),
        }
    }

    fn source(ips: &[&str], ports: &[i32]) -> LoadResult {
        LoadResult {
            ips: ips.iter().map(|ip| ip.to_string()).collect(),
            ports: ports.to_vec(),
            protocol: "TCP".to_string(),
            overwrite: false,
        }
    }

    struct Case {
        name: &'static str,
        subsets: Vec<EndpointSubset>,
        sources: Vec<LoadResult>,
        overwrite: bool,
        not_ready: bool,
        want_subsets: Vec<EndpointSubset>,
        want_update: bool,
    }

    fn merge_fixture() -> (Vec<EndpointSubset>, Vec<LoadResult>) {
        (
            vec![
                subset(&["1.1.1.1"], &[], &[80, 443]),
                subset(&["4.4.4.4"], &[], &[80]),
            ],
            vec![
                source(&["2.2.2.2"], &[80, 443]),
                source(&["3.3.3.3"], &[80, 443]),
                source(&["5.5.5.5"], &[443]),
            ],
        )
    }

    #[test]
    fn build_subsets_cases() {
        let (merge_subsets, merge_sources) = merge_fixture();
        let cases = vec![
            Case {
                name: "case-empty",
                subsets: vec![],
                sources: vec![],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![],
                want_update: false,
            },
            Case {
                name: "case-simple-add.0",
                subsets: vec![],
                sources: vec![source(&["1.1.1.1"], &[80, 443])],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                want_update: true,
            },
            Case {
                name: "case-simple-add.1",
                subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                sources: vec![source(&["2.2.2.2"], &[80, 443])],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1", "2.2.2.2"], &[], &[80, 443])],
                want_update: true,
            },
            Case {
                name: "case-unchange.0",
                subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                sources: vec![],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                want_update: false,
            },
            Case {
                name: "case-unchange.1",
                subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                sources: vec![source(&["1.1.1.1"], &[80, 443])],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                want_update: false,
            },
            Case {
                name: "case-update-port.0",
                subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                sources: vec![source(&["1.1.1.1"], &[80])],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1"], &[], &[80])],
                want_update: true,
            },
            Case {
                name: "case-update-port.1",
                subsets: vec![subset(&["1.1.1.1"], &[], &[80])],
                sources: vec![source(&["1.1.1.1"], &[80, 443])],
                overwrite: false,
                not_ready: false,
                want_subsets: vec![subset(&["1.1.1.1"], &[], &[80, 443])],
                want_update: true,
            },
            Case {
                name: "case-merge-source.0",
                subsets: merge_subsets.clone(),
                sources: merge_sources.clone(),
                overwrite: false,
                not_ready: false,
                want_subsets: vec![
                    subset(&["1.1.1.1", "2.2.2.2", "3.3.3.3"], &[], &[80, 443]),
                    subset(&["4.4.4.4"], &[], &[80]),
                    subset(&["5.5.5.5"], &[], &[443]),
                ],
                want_update: true,
            },
            Case {
                name: "case-overwrite",
                subsets: merge_subsets.clone(),
                sources: merge_sources.clone(),
                overwrite: true,
                not_ready: false,
                want_subsets: vec![
                    subset(&["2.2.2.2", "3.3.3.3"], &[], &[80, 443]),
                    subset(&["5.5.5.5"], &[], &[443]),
                ],
                want_update: true,
            },
            Case {
                name: "case-not-ready",
                subsets: merge_subsets,
                sources: merge_sources,
                overwrite: false,
                not_ready: true,
                want_subsets: vec![
                    subset(&["1.1.1.1"], &["2.2.2.2", "3.3.3.3"], &[80, 443]),
                    subset(&["4.4.4.4"], &[], &[80]),
                    subset(&[], &["5.5.5.5"], &[443]),
                ],
                want_update: true,
            },
        ];
        for case in cases {
            let (got_subsets, got_update) =
                build_subsets(case.subsets, &case.sources, case.overwrite, case.not_ready);
            assert_eq!(got_subsets, case.want_subsets, "{}: subsets", case.name);
            assert_eq!(got_update, case.want_update, "{}: update flag", case.name);
        }
    }

    #[test]
    fn build_subsets_is_idempotent() {
        let (subsets, sources) = merge_fixture();
        for (overwrite, not_ready) in [(false, false), (true, false), (false, true)] {
            let (once, _) = build_subsets(subsets.clone(), &sources, overwrite, not_ready);
            let (twice, update) = build_subsets(once.clone(), &sources, overwrite, not_ready);
            assert!(!update, "second pass reported a change");
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn source_ips_never_land_in_two_subsets() {
        // 9.9.9.9 starts in the 80-only subset but the source maps it to
        // the 80+443 subset: it must be evicted from the former
        let subsets = vec![
            subset(&["1.1.1.1"], &[], &[80, 443]),
            subset(&["9.9.9.9"], &[], &[80]),
        ];
        let sources = vec![source(&["9.9.9.9"], &[80, 443])];
        let (got, update) = build_subsets(subsets, &sources, false, false);
        assert!(update);
        assert_eq!(
            got,
            vec![subset(&["1.1.1.1", "9.9.9.9"], &[], &[80, 443])]
        );
    }

    #[test]
    fn without_overwrite_unmatched_ips_survive() {
        let subsets = vec![subset(&["1.1.1.1", "7.7.7.7"], &[], &[80])];
        let sources = vec![source(&["2.2.2.2"], &[80])];
        let (got, _) = build_subsets(subsets, &sources, false, false);
        assert_eq!(got, vec![subset(&["1.1.1.1", "7.7.7.7", "2.2.2.2"], &[], &[80])]);
    }

    #[test]
    fn protocol_mismatch_prevents_merge() {
        let subsets = vec![subset(&["1.1.1.1"], &[], &[80])];
        let sources = vec![LoadResult {
            ips: vec!["2.2.2.2".to_string()],
            ports: vec![80],
            protocol: "UDP".to_string(),
            overwrite: false,
        }];
        let (got, update) = build_subsets(subsets, &sources, false, false);
        assert!(update);
        assert_eq!(got.len(), 2);
        assert_eq!(
            got[1].ports.as_deref().unwrap()[0].protocol.as_deref(),
            Some("UDP")
        );
    }

    #[test]
    fn two_sources_sharing_a_port_set_share_a_created_subset() {
        let sources = vec![source(&["1.1.1.1"], &[53]), source(&["2.2.2.2"], &[53])];
        let (got, update) = build_subsets(vec![], &sources, false, false);
        assert!(update);
        assert_eq!(got, vec![subset(&["1.1.1.1", "2.2.2.2"], &[], &[53])]);
    }

    #[test]
    fn host_items_cover_both_address_lists() {
        let subsets = vec![subset(&["1.1.1.1"], &["2.2.2.2"], &[80, 443])];
        let hosts = host_items(&subsets);
        assert_eq!(hosts.len(), 4);
        assert!(hosts.contains(&HostKey {
            ip: "2.2.2.2".to_string(),
            port: 443
        }));
    }

    #[test]
    fn host_items_skip_empty_ips_and_ports() {
        let subsets = vec![EndpointSubset {
            addresses: Some(vec![addr("")]),
            not_ready_addresses: None,
            ports: Some(vec![port(0), port(80)]),
        }];
        assert!(host_items(&subsets).is_empty());
    }
}
