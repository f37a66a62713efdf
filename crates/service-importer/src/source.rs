//! Member-discovery sources.
//!
//! A source periodically produces the set of backend IPs and ports for an
//! endpoints object: a static list, a DNS A/AAAA lookup, or a DNS SRV lookup.
//! Sources are registered as weightless probers whose committed status is the
//! whole [`LoadResult`]; a failing load leaves the last committed result in
//! place.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;
use tracing::warn;

use crate::fluconf::Config;
use crate::prober::{ProbeError, ProbeFn, Prober, StatusValue, UpdateFn};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("illegal port {0}")]
    IllegalPort(i64),
    #[error("illegal srv {0}")]
    IllegalSrv(String),
    #[error("illegal nslookup config: {0:?}")]
    IllegalNslookup(Config),
    #[error("illegal import config: {0:?}")]
    UnknownSource(Config),
    #[error("lookup srv failed")]
    SrvLookupFailed,
    #[error("dns resolve: {0}")]
    Resolve(String),
}

/// One discovery cycle's outcome.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadResult {
    pub ips: Vec<String>,
    pub ports: Vec<i32>,
    pub protocol: String,
    pub overwrite: bool,
}

impl StatusValue for LoadResult {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

/// DNS lookups behind a trait so sources can be exercised without a network.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DnsResolve: Send + Sync {
    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, SourceError>;
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SourceError>;
}

/// System-configured resolver (resolv.conf / in-cluster DNS).
pub struct SystemResolver(TokioAsyncResolver);

impl SystemResolver {
    pub fn from_system_conf() -> Result<Self, SourceError> {
        TokioAsyncResolver::tokio_from_system_conf()
            .map(Self)
            .map_err(|err| SourceError::Resolve(err.to_string()))
    }
}

#[async_trait]
impl DnsResolve for SystemResolver {
    async fn lookup_ips(&self, host: &str) -> Result<Vec<IpAddr>, SourceError> {
        let lookup = self
            .0
            .lookup_ip(host)
            .await
            .map_err(|err| SourceError::Resolve(err.to_string()))?;
        Ok(lookup.iter().collect())
    }

    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SourceError> {
        let lookup = self
            .0
            .srv_lookup(name)
            .await
            .map_err(|err| SourceError::Resolve(err.to_string()))?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8(),
                port: srv.port(),
            })
            .collect())
    }
}

pub type LoadFn = Arc<dyn Fn() -> BoxFuture<'static, Result<LoadResult, SourceError>> + Send + Sync>;

fn push_unique<T: PartialEq>(items: &mut Vec<T>, item: T) {
    if !items.contains(&item) {
        items.push(item);
    }
}

fn split_ips(val: &str) -> Vec<String> {
    val.split(',')
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .collect()
}

fn static_source(conf: &Config) -> Result<(LoadFn, String), SourceError> {
    let ips = split_ips(&conf.get_str("ip", ""));
    let port = conf.get_int("port", 0);
    let protocol = conf.get_str("protocol", "TCP").to_uppercase();
    let overwrite = conf.get_bool("overwrite", false);
    if port <= 0 {
        return Err(SourceError::IllegalPort(port));
    }
    let name = format!("static|{}:{}/{}", ips.join(","), port, protocol);
    let result = LoadResult {
        ips,
        ports: vec![port as i32],
        protocol,
        overwrite,
    };
    let load: LoadFn = Arc::new(move || {
        let result = result.clone();
        async move { Ok(result) }.boxed()
    });
    Ok((load, name))
}

fn nslookup_source(
    conf: &Config,
    resolver: Arc<dyn DnsResolve>,
) -> Result<(LoadFn, String), SourceError> {
    let host = conf.get_str("host", "");
    let srv = conf.get_str("srv", "");
    let port = conf.get_int("port", 0);
    let mut protocol = conf.get_str("protocol", "").to_uppercase();
    let overwrite = conf.get_bool("overwrite", false);

    if !srv.is_empty() {
        match srv.splitn(3, '.').nth(1) {
            Some("_tcp") => protocol = "TCP".to_string(),
            Some("_udp") => protocol = "UDP".to_string(),
            _ if protocol.is_empty() => return Err(SourceError::IllegalSrv(srv)),
            _ => {}
        }
        let name = format!("nslookup|SRV={srv}");
        let load: LoadFn = Arc::new(move || {
            let resolver = resolver.clone();
            let srv = srv.clone();
            let protocol = protocol.clone();
            async move {
                let mut ips = Vec::new();
                let mut ports = Vec::new();
                for record in resolver.lookup_srv(&srv).await? {
                    push_unique(&mut ports, record.port as i32);
                    let target = record.target.trim_end_matches('.').to_string();
                    if let Ok(ip) = target.parse::<IpAddr>() {
                        push_unique(&mut ips, ip.to_string());
                    } else {
                        match resolver.lookup_ips(&target).await {
                            Ok(addrs) => {
                                for addr in addrs {
                                    push_unique(&mut ips, addr.to_string());
                                }
                            }
                            Err(err) => warn!(target = %target, error = %err, "lookup host"),
                        }
                    }
                }
                if ips.is_empty() {
                    return Err(SourceError::SrvLookupFailed);
                }
                Ok(LoadResult {
                    ips,
                    ports,
                    protocol,
                    overwrite,
                })
            }
            .boxed()
        });
        return Ok((load, name));
    }

    if !host.is_empty() {
        if port <= 0 {
            return Err(SourceError::IllegalPort(port));
        }
        if protocol.is_empty() {
            protocol = "TCP".to_string();
        }
        let name = format!("nslookup|{host}:{port}/{protocol}");
        let load: LoadFn = Arc::new(move || {
            let resolver = resolver.clone();
            let host = host.clone();
            let protocol = protocol.clone();
            async move {
                let addrs = resolver.lookup_ips(&host).await?;
                Ok(LoadResult {
                    ips: addrs.iter().map(IpAddr::to_string).collect(),
                    ports: vec![port as i32],
                    protocol,
                    overwrite,
                })
            }
            .boxed()
        });
        return Ok((load, name));
    }

    Err(SourceError::IllegalNslookup(conf.clone()))
}

/// Build a source prober from a source entry. The committed status is the
/// full [`LoadResult`]; since it carries no weight, every successful load
/// commits immediately and a failed load leaves the previous result intact.
pub fn loader(
    conf: &Config,
    update: UpdateFn<LoadResult>,
    resolver: Arc<dyn DnsResolve>,
) -> Result<Arc<Prober<LoadResult>>, SourceError> {
    let (load, name) = match conf.get_str("source", "").as_str() {
        "static" => static_source(conf)?,
        "nslookup" => nslookup_source(conf, resolver)?,
        _ => return Err(SourceError::UnknownSource(conf.clone())),
    };
    let probe: ProbeFn<LoadResult> = Arc::new(move |_timeout| {
        let load = load.clone();
        async move {
            load()
                .await
                .map_err(|err| ProbeError::Other(anyhow::Error::new(err)))
        }
        .boxed()
    });
    let prober = Prober::new(conf.get_str("name", &name), probe)
        .with_interval(conf.get_duration("interval", Duration::from_secs(30)))
        .with_timeout(conf.get_duration("timeout", Duration::from_secs(30)))
        .with_update(update);
    Ok(Arc::new(prober))
}
