//! Connectivity Prober
//!
//! Measures reachability and handshake latency of a server with raw TCP
//! connects. A host that refuses every attempt is a normal measurement
//! (`connected = false`, loss `1.0`); only failures that prevent measuring at
//! all, such as name resolution, are errors.

use futures_util::future::join_all;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

/// Probe configuration
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Sequential connect attempts per target
    pub attempts: usize,
    /// Timeout per attempt (also bounds name resolution)
    pub timeout: Duration,
    /// Pause between attempts
    pub interval: Duration,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            attempts: 3,
            timeout: Duration::from_secs(3),
            interval: Duration::ZERO,
        }
    }
}

/// One connect attempt
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeRecord {
    pub seq: usize,
    pub connected: bool,
    /// Handshake time in milliseconds
    pub time: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Aggregate over all attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeSummary {
    pub host: String,
    pub port: u16,
    pub attempts: usize,
    pub successes: usize,
    pub connected: bool,
    /// Average over successful attempts (milliseconds)
    pub time: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// failed / total
    pub loss: f64,
}

impl ProbeSummary {
    /// Aggregate attempt records
    pub fn from_records(host: &str, port: u16, records: &[ProbeRecord]) -> Self {
        let times: Vec<f64> = records.iter().filter_map(|r| r.time).collect();
        let successes = times.len();
        let attempts = records.len();

        let time = (successes > 0).then(|| times.iter().sum::<f64>() / successes as f64);
        let min = times.iter().copied().reduce(f64::min);
        let max = times.iter().copied().reduce(f64::max);
        let loss = if attempts == 0 {
            1.0
        } else {
            (attempts - successes) as f64 / attempts as f64
        };

        Self {
            host: host.to_string(),
            port,
            attempts,
            successes,
            connected: successes > 0,
            time,
            min,
            max,
            loss,
        }
    }

    /// Reachable with less than 20% loss
    pub fn is_healthy(&self) -> bool {
        self.connected && self.loss < 0.2
    }
}

/// Summary plus the raw attempts
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeReport {
    #[serde(flatten)]
    pub summary: ProbeSummary,
    pub records: Vec<ProbeRecord>,
}

/// A server to probe, keyed by config id
#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub id: String,
    pub host: String,
    pub port: u16,
}

/// TCP connect prober
pub struct Prober {
    options: ProbeOptions,
    resolver: OnceCell<TokioAsyncResolver>,
}

impl Prober {
    /// Create a new prober
    pub fn new(options: ProbeOptions) -> Self {
        Self {
            options,
            resolver: OnceCell::new(),
        }
    }

    /// Create with default options
    pub fn with_defaults() -> Self {
        Self::new(ProbeOptions::default())
    }

    /// Current options
    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    /// Probe `host:port` with the configured number of attempts
    pub async fn probe(&self, host: &str, port: u16) -> Result<ProbeReport, ProbeError> {
        self.probe_with(host, port, self.options.attempts).await
    }

    /// Probe with an explicit attempt count
    pub async fn probe_with(
        &self,
        host: &str,
        port: u16,
        attempts: usize,
    ) -> Result<ProbeReport, ProbeError> {
        let host = host.trim();
        if host.is_empty() || port == 0 || attempts == 0 {
            return Err(ProbeError::InvalidTarget(format!("{}:{}", host, port)));
        }

        let addr = SocketAddr::new(self.resolve(host).await?, port);
        debug!("Probing {} ({}) x{}", host, addr, attempts);

        let mut records = Vec::with_capacity(attempts);
        for seq in 0..attempts {
            if seq > 0 && !self.options.interval.is_zero() {
                tokio::time::sleep(self.options.interval).await;
            }
            records.push(self.attempt(seq, addr).await);
        }

        let summary = ProbeSummary::from_records(host, port, &records);
        debug!(
            "Probe {}:{} -> {}/{} ok, avg {:?}ms",
            host, port, summary.successes, summary.attempts, summary.time
        );

        Ok(ProbeReport { summary, records })
    }

    /// Probe many servers concurrently
    pub async fn probe_many(
        &self,
        targets: Vec<ProbeTarget>,
    ) -> Vec<(String, Result<ProbeReport, ProbeError>)> {
        let probes = targets.into_iter().map(|target| async move {
            let result = self.probe(&target.host, target.port).await;
            (target.id, result)
        });
        join_all(probes).await
    }

    async fn attempt(&self, seq: usize, addr: SocketAddr) -> ProbeRecord {
        let start = Instant::now();
        match tokio::time::timeout(self.options.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => ProbeRecord {
                seq,
                connected: true,
                time: Some(start.elapsed().as_secs_f64() * 1000.0),
                error: None,
            },
            Ok(Err(e)) => ProbeRecord {
                seq,
                connected: false,
                time: None,
                error: Some(e.to_string()),
            },
            Err(_) => ProbeRecord {
                seq,
                connected: false,
                time: None,
                error: Some("timeout".to_string()),
            },
        }
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr, ProbeError> {
        let literal = host.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = literal.parse::<IpAddr>() {
            return Ok(ip);
        }

        let resolver = self
            .resolver
            .get_or_init(|| async {
                TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|e| {
                    warn!("System DNS config unavailable ({}), using defaults", e);
                    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
                })
            })
            .await;

        let lookup = tokio::time::timeout(self.options.timeout, resolver.lookup_ip(host))
            .await
            .map_err(|_| ProbeError::Resolve {
                host: host.to_string(),
                reason: "timeout".to_string(),
            })?
            .map_err(|e| ProbeError::Resolve {
                host: host.to_string(),
                reason: e.to_string(),
            })?;

        lookup.iter().next().ok_or_else(|| ProbeError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })
    }
}

impl Default for Prober {
    fn default() -> Self {
        Self::with_defaults()
    }
}

/// Pick the reachable candidate with the lowest average latency
pub fn best_candidate(results: &[(String, ProbeSummary)]) -> Option<&str> {
    let mut candidates: Vec<_> = results.iter().filter(|(_, s)| s.connected).collect();

    candidates.sort_by(|(_, a), (_, b)| {
        let a_lat = a.time.unwrap_or(f64::MAX);
        let b_lat = b.time.unwrap_or(f64::MAX);
        a_lat
            .total_cmp(&b_lat)
            .then_with(|| a.loss.total_cmp(&b.loss))
    });

    candidates.first().map(|(id, _)| id.as_str())
}

/// Probe errors (refused connections are not errors)
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProbeError {
    #[error("Invalid probe target: {0}")]
    InvalidTarget(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn fast_options() -> ProbeOptions {
        ProbeOptions {
            attempts: 3,
            timeout: Duration::from_millis(500),
            interval: Duration::ZERO,
        }
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_probe_closed_port() {
        let port = closed_port().await;
        let prober = Prober::new(fast_options());

        let report = prober.probe("127.0.0.1", port).await.unwrap();

        assert_eq!(report.records.len(), 3);
        assert!(!report.summary.connected);
        assert_eq!(report.summary.time, None);
        assert_eq!(report.summary.loss, 1.0);
        assert!(report.records.iter().all(|r| !r.connected && r.error.is_some()));
    }

    #[tokio::test]
    async fn test_unroutable_host_attempts_are_bounded() {
        let timeout = Duration::from_millis(300);
        let prober = Prober::new(ProbeOptions {
            attempts: 3,
            timeout,
            interval: Duration::ZERO,
        });

        // TEST-NET-1: either dropped (timeout) or rejected by the local stack
        let started = Instant::now();
        let report = prober.probe("192.0.2.1", 9).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(report.records.len(), 3);
        assert!(!report.summary.connected);
        assert_eq!(report.summary.time, None);
        assert_eq!(report.summary.loss, 1.0);
        assert!(report.records.iter().all(|r| r.time.is_none() && r.error.is_some()));
        assert!(
            elapsed < timeout * 3 + Duration::from_millis(500),
            "attempts took {:?}",
            elapsed
        );
    }

    #[tokio::test]
    async fn test_probe_open_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let prober = Prober::new(fast_options());

        let report = prober.probe("127.0.0.1", port).await.unwrap();

        assert!(report.summary.connected);
        assert_eq!(report.summary.successes, 3);
        assert_eq!(report.summary.loss, 0.0);
        assert!(report.summary.time.is_some());
        assert!(report.summary.is_healthy());
        drop(listener);
    }

    #[tokio::test]
    async fn test_invalid_target() {
        let prober = Prober::new(fast_options());
        assert!(matches!(prober.probe("", 80).await, Err(ProbeError::InvalidTarget(_))));
        assert!(matches!(prober.probe("127.0.0.1", 0).await, Err(ProbeError::InvalidTarget(_))));
    }

    #[tokio::test]
    async fn test_unresolvable_host_is_error() {
        let prober = Prober::new(ProbeOptions {
            timeout: Duration::from_secs(1),
            ..fast_options()
        });
        let result = prober.probe("no-such-host.invalid", 443).await;
        assert!(matches!(result, Err(ProbeError::Resolve { .. })));
    }

    #[tokio::test]
    async fn test_probe_many() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let open = listener.local_addr().unwrap().port();
        let closed = closed_port().await;
        let prober = Prober::new(fast_options());

        let results = prober
            .probe_many(vec![
                ProbeTarget { id: "open".into(), host: "127.0.0.1".into(), port: open },
                ProbeTarget { id: "closed".into(), host: "127.0.0.1".into(), port: closed },
            ])
            .await;

        let summaries: Vec<(String, ProbeSummary)> = results
            .into_iter()
            .map(|(id, r)| (id, r.unwrap().summary))
            .collect();
        assert_eq!(best_candidate(&summaries), Some("open"));
    }

    #[test]
    fn test_summary_math() {
        let records = vec![
            ProbeRecord { seq: 0, connected: true, time: Some(10.0), error: None },
            ProbeRecord { seq: 1, connected: false, time: None, error: Some("timeout".into()) },
            ProbeRecord { seq: 2, connected: true, time: Some(30.0), error: None },
            ProbeRecord { seq: 3, connected: true, time: Some(20.0), error: None },
        ];
        let summary = ProbeSummary::from_records("h", 1, &records);

        assert_eq!(summary.time, Some(20.0));
        assert_eq!(summary.min, Some(10.0));
        assert_eq!(summary.max, Some(30.0));
        assert_eq!(summary.loss, 0.25);
        assert!(!summary.is_healthy());
    }

    #[test]
    fn test_best_candidate_prefers_latency() {
        let fast = ProbeSummary::from_records(
            "a", 1,
            &[ProbeRecord { seq: 0, connected: true, time: Some(5.0), error: None }],
        );
        let slow = ProbeSummary::from_records(
            "b", 1,
            &[ProbeRecord { seq: 0, connected: true, time: Some(50.0), error: None }],
        );
        let down = ProbeSummary::from_records(
            "c", 1,
            &[ProbeRecord { seq: 0, connected: false, time: None, error: None }],
        );
        let results = vec![("slow".into(), slow), ("down".into(), down), ("fast".into(), fast)];
        assert_eq!(best_candidate(&results), Some("fast"));
        assert_eq!(best_candidate(&[]), None);
    }
}
