//! HTTP and TCP probe loaders.
//!
//! A probe observes one backend and yields a signed weight: positive favors
//! readiness, negative opposes it, zero abstains. The weight for each outcome
//! is configurable per entry through the `OK`, `FAIL` and `UNKNOWN` keys.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use thiserror::Error;
use tokio::net::TcpStream;

use crate::fluconf::Config;
use crate::prober::{ProbeFn, Prober, StatusValue, UpdateFn};

#[derive(Debug, Error)]
pub enum ProbeConfigError {
    #[error("illegal port: {0}")]
    IllegalPort(i64),
    #[error("illegal host or port: {0}:{1}")]
    IllegalHostPort(String, i64),
    #[error("illegal uri: {0}")]
    IllegalUri(String),
    #[error("illegal probe config: {0:?}")]
    UnknownProbe(Config),
}

/// A probe observation: the signed weight fed into the rise/fall counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeWeight(pub i32);

impl StatusValue for ProbeWeight {
    fn weight(&self) -> Option<i32> {
        Some(self.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct Weights {
    ok: i32,
    fail: i32,
    unknown: i32,
}

impl Weights {
    fn from_conf(conf: &Config) -> Self {
        Self {
            ok: conf.get_int("OK", 1) as i32,
            fail: conf.get_int("FAIL", -1) as i32,
            unknown: conf.get_int("UNKNOWN", 0) as i32,
        }
    }
}

async fn within<T>(timeout: Duration, fut: impl std::future::Future<Output = T>) -> Option<T> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}

fn http_probe(conf: &Config) -> Result<ProbeFn<ProbeWeight>, ProbeConfigError> {
    let host = conf.get_str("host", "127.0.0.1");
    let port = conf.get_int("port", 80);
    let uri = conf.get_str("uri", "/");
    if port <= 0 || port > i64::from(u16::MAX) {
        return Err(ProbeConfigError::IllegalPort(port));
    }
    let base = reqwest::Url::parse(&format!("http://{host}:{port}/"))
        .map_err(|_| ProbeConfigError::IllegalHostPort(host.clone(), port))?;
    let url = base
        .join(&uri)
        .map_err(|_| ProbeConfigError::IllegalUri(uri.clone()))?;
    let weights = Weights::from_conf(conf);
    let client = reqwest::Client::new();

    Ok(Arc::new(move |timeout| {
        let client = client.clone();
        let url = url.clone();
        async move {
            let weight = match within(timeout, client.get(url).send()).await {
                Some(Ok(resp)) if resp.status().as_u16() < 400 => weights.ok,
                Some(Ok(_)) => weights.fail,
                // transport error or timeout: no definite observation
                Some(Err(_)) | None => weights.unknown,
            };
            Ok(ProbeWeight(weight))
        }
        .boxed()
    }))
}

fn tcp_probe(conf: &Config) -> Result<ProbeFn<ProbeWeight>, ProbeConfigError> {
    let host = conf.get_str("host", "127.0.0.1");
    let port = conf.get_int("port", 0);
    if port <= 0 || port > i64::from(u16::MAX) {
        return Err(ProbeConfigError::IllegalPort(port));
    }
    let weights = Weights::from_conf(conf);

    Ok(Arc::new(move |timeout| {
        let addr = (host.clone(), port as u16);
        async move {
            let weight = match within(timeout, TcpStream::connect(addr)).await {
                Some(Ok(_stream)) => weights.ok,
                Some(Err(_)) => weights.fail,
                None => weights.unknown,
            };
            Ok(ProbeWeight(weight))
        }
        .boxed()
    }))
}

/// Build a prober from a probe entry. The `name` key (default: the probe
/// type label) becomes part of the probe key; interval/timeout/rise/fall
/// come from the entry, which already carries the annotation-level defaults.
pub fn load_probe(
    conf: &Config,
    update: Option<UpdateFn<ProbeWeight>>,
) -> Result<Arc<Prober<ProbeWeight>>, ProbeConfigError> {
    let kind = conf.get_str("probe", "");
    let probe = match kind.as_str() {
        "http" => http_probe(conf)?,
        "tcp" => tcp_probe(conf)?,
        _ => return Err(ProbeConfigError::UnknownProbe(conf.clone())),
    };
    let mut prober = Prober::new(conf.get_str("name", &kind), probe)
        .with_interval(conf.get_duration("interval", Duration::from_secs(10)))
        .with_timeout(conf.get_duration("timeout", Duration::from_secs(10)))
        .with_rise(conf.get_int("rise", 1) as i32)
        .with_fall(conf.get_int("fall", 1) as i32);
    if let Some(update) = update {
        prober = prober.with_update(update);
    }
    Ok(Arc::new(prober))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn load_probe_applies_config() {
        let conf = Config::from([
            ("probe", "tcp"),
            ("port", "80"),
            ("interval", "5s"),
            ("timeout", "2s"),
            ("rise", "3"),
            ("fall", "4"),
            ("name", "edge"),
        ]);
        let prober = load_probe(&conf, None).unwrap();
        assert_eq!(prober.name(), "edge");
        assert_eq!(prober.interval(), Duration::from_secs(5));
        assert_eq!(prober.timeout(), Duration::from_secs(2));
        assert_eq!(prober.rise(), 3);
        assert_eq!(prober.fall(), 4);
    }

    #[test]
    fn load_probe_defaults_name_to_kind() {
        let conf = Config::from([("probe", "http")]);
        let prober = load_probe(&conf, None).unwrap();
        assert_eq!(prober.name(), "http");
        assert_eq!(prober.interval(), Duration::from_secs(10));
    }

    #[test]
    fn load_probe_rejects_bad_configs() {
        assert!(matches!(
            load_probe(&Config::from([("probe", "tcp")]), None),
            Err(ProbeConfigError::IllegalPort(0))
        ));
        assert!(matches!(
            load_probe(&Config::from([("probe", "http"), ("port", "-1")]), None),
            Err(ProbeConfigError::IllegalPort(-1))
        ));
        assert!(matches!(
            load_probe(&Config::from([("probe", "exec")]), None),
            Err(ProbeConfigError::UnknownProbe(_))
        ));
    }

    #[tokio::test]
    async fn tcp_probe_reports_listener_state() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let conf = Config::from([("probe", "tcp"), ("host", "127.0.0.1")])
            .copy_with("port", &port.to_string());
        let probe = tcp_probe(&conf).unwrap();
        let status = probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeWeight(1));

        drop(listener);
        let status = probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeWeight(-1));
    }

    #[tokio::test]
    async fn tcp_probe_honors_weight_overrides() {
        let conf = Config::from([
            ("probe", "tcp"),
            ("host", "127.0.0.1"),
            ("port", "1"),
            ("FAIL", "-5"),
        ]);
        let probe = tcp_probe(&conf).unwrap();
        let status = probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeWeight(-5));
    }

    #[tokio::test]
    async fn http_probe_maps_status_codes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                let _ = socket
                    .write_all(b"HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\n\r\n")
                    .await;
            }
        });

        let conf = Config::from([("probe", "http"), ("host", "127.0.0.1"), ("uri", "/status")])
            .copy_with("port", &port.to_string());
        let probe = http_probe(&conf).unwrap();
        let status = probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeWeight(-1));
    }

    #[tokio::test]
    async fn http_probe_unknown_on_unreachable() {
        let conf = Config::from([("probe", "http"), ("host", "127.0.0.1"), ("port", "1")]);
        let probe = http_probe(&conf).unwrap();
        let status = probe(Duration::from_secs(1)).await.unwrap();
        assert_eq!(status, ProbeWeight(0));
    }
}
