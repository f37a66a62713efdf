use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use service_importer::controller::Importer;
use service_importer::health;
use service_importer::leader::{self, LeaderElectionConfig};
use service_importer::source::SystemResolver;

#[derive(Parser, Debug)]
#[command(name = "service-importer", version)]
#[command(about = "Imports Endpoints membership from external sources and health probes")]
struct Cli {
    /// Importer profile (watch label value)
    #[arg(long, env = "IMPORTER_OPTS_IMPORTER")]
    importer: String,

    /// Watch label/annotation prefix
    #[arg(
        long,
        short = 'p',
        env = "IMPORTER_OPTS_PREFIX",
        default_value = "kube-service-importer.xiaopal.github.com/"
    )]
    prefix: String,

    /// Resync period (0 disables)
    #[arg(
        long,
        env = "IMPORTER_OPTS_RESYNC",
        default_value = "0s",
        value_parser = humantime::parse_duration
    )]
    resync: Duration,

    /// Address for the /health and /endpoints HTTP server, e.g. :8080
    #[arg(long, env = "IMPORTER_OPTS_LISTEN")]
    listen: Option<String>,

    /// Disable Lease-based leader election
    #[arg(long, env = "IMPORTER_OPTS_NO_LEADER_ELECT")]
    no_leader_elect: bool,

    /// Lease name for leader election
    #[arg(
        long,
        env = "IMPORTER_OPTS_LEASE_NAME",
        default_value = "service-importer"
    )]
    lease_name: String,

    /// Lease namespace (defaults to the client's namespace)
    #[arg(long, env = "IMPORTER_OPTS_LEASE_NAMESPACE")]
    lease_namespace: Option<String>,
}

/// Accept Go-style `:8080` listen addresses as well as full socket
/// addresses.
fn parse_listen(listen: &str) -> Result<SocketAddr> {
    let addr = if listen.starts_with(':') {
        format!("0.0.0.0{listen}")
    } else {
        listen.to_string()
    };
    addr.parse()
        .with_context(|| format!("illegal listen address: {listen}"))
}

fn identity() -> String {
    std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| format!("service-importer-{}", std::process::id()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    info!(importer = %cli.importer, prefix = %cli.prefix, "service-importer starting");

    let client = Client::try_default()
        .await
        .context("failed to create kubernetes client")?;
    let resolver = SystemResolver::from_system_conf()
        .context("failed to configure dns resolver")?;
    let root = CancellationToken::new();

    let importer = Importer::new(&cli.prefix, &cli.importer, Arc::new(resolver), root.clone());

    if let Some(listen) = &cli.listen {
        let addr = parse_listen(listen)?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        info!(%addr, "inspection server listening");
        tokio::spawn(health::serve(listener, importer.clone(), root.clone()));
    }

    let leader_config = if cli.no_leader_elect {
        LeaderElectionConfig::disabled()
    } else {
        let namespace = cli
            .lease_namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        LeaderElectionConfig::new(
            cli.lease_name.clone(),
            namespace,
            identity(),
            Duration::from_secs(15),
            Duration::from_secs(5),
        )?
    };
    leader::acquire_and_hold(client.clone(), &leader_config, root.clone()).await?;

    let mut sigterm = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    tokio::select! {
        result = importer.clone().run(client, cli.resync) => {
            result.context("controller failure")?;
            info!("watch ended, shutting down");
        }
        _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("received SIGINT, shutting down"),
        _ = root.cancelled() => info!("leadership lost, shutting down"),
    }
    root.cancel();

    Ok(())
}
