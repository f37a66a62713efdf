//! Lease-based leader election.
//!
//! Multiple replicas may run; only the lease holder reconciles. Acquisition
//! blocks until leadership is held, and a background task cancels the root
//! context if leadership is lost, letting every prober and worker wind down.

use std::time::Duration;

use anyhow::{ensure, Context, Result};
use kube::Client;
use kube_lease_manager::LeaseManagerBuilder;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Configuration for leader election. Use [`LeaderElectionConfig::new`] for
/// validated construction or [`LeaderElectionConfig::disabled`] to run
/// without a lease (single-replica or local development).
#[derive(Debug, Clone)]
pub struct LeaderElectionConfig {
    enabled: bool,
    lease_name: String,
    namespace: String,
    identity: String,
    lease_duration: Duration,
    grace: Duration,
}

impl LeaderElectionConfig {
    pub fn new(
        lease_name: String,
        namespace: String,
        identity: String,
        lease_duration: Duration,
        grace: Duration,
    ) -> Result<Self> {
        ensure!(!lease_name.is_empty(), "lease_name cannot be empty");
        ensure!(!namespace.is_empty(), "namespace cannot be empty");
        ensure!(!identity.is_empty(), "identity cannot be empty");
        ensure!(
            grace < lease_duration,
            "grace ({:?}) must be less than lease_duration ({:?})",
            grace,
            lease_duration
        );
        Ok(Self {
            enabled: true,
            lease_name,
            namespace,
            identity,
            lease_duration,
            grace,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            lease_name: String::new(),
            namespace: String::new(),
            identity: String::new(),
            lease_duration: Duration::from_secs(15),
            grace: Duration::from_secs(5),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }
}

/// Block until this replica holds the lease, then keep renewing it in the
/// background. Loss of leadership cancels `root`.
pub async fn acquire_and_hold(
    client: Client,
    config: &LeaderElectionConfig,
    root: CancellationToken,
) -> Result<()> {
    if !config.enabled {
        info!("leader election disabled");
        return Ok(());
    }

    let manager = LeaseManagerBuilder::new(client, &config.lease_name)
        .with_namespace(&config.namespace)
        .with_identity(&config.identity)
        .with_duration(config.lease_duration.as_secs())
        .with_grace(config.grace.as_secs())
        .build()
        .await
        .context("failed to create lease manager")?;

    let (mut leader_rx, _renewal) = manager.watch().await;

    info!(
        lease = %config.lease_name,
        namespace = %config.namespace,
        identity = %config.identity,
        "waiting to acquire leadership"
    );
    while !*leader_rx.borrow_and_update() {
        leader_rx
            .changed()
            .await
            .context("lease watch channel closed")?;
    }
    info!("leadership acquired");

    tokio::spawn(async move {
        loop {
            if leader_rx.changed().await.is_err() {
                error!("lease renewal task ended");
                break;
            }
            if !*leader_rx.borrow() {
                error!("lost leadership lease");
                break;
            }
        }
        root.cancel();
    });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_config_skips_validation() {
        let config = LeaderElectionConfig::disabled();
        assert!(!config.enabled());
    }

    #[test]
    fn new_rejects_empty_fields() {
        let result = LeaderElectionConfig::new(
            String::new(),
            "default".to_string(),
            "pod-0".to_string(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        );
        assert!(result.unwrap_err().to_string().contains("lease_name"));
    }

    #[test]
    fn new_rejects_grace_not_below_duration() {
        let result = LeaderElectionConfig::new(
            "lease".to_string(),
            "default".to_string(),
            "pod-0".to_string(),
            Duration::from_secs(5),
            Duration::from_secs(15),
        );
        assert!(result.unwrap_err().to_string().contains("grace"));
    }

    #[test]
    fn new_accepts_valid_config() {
        let config = LeaderElectionConfig::new(
            "lease".to_string(),
            "default".to_string(),
            "pod-0".to_string(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(config.enabled());
    }
}
