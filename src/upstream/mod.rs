//! Upstream manager: per-upstream live state (backoff, latency EWMA),
//! selection strategies and the exchange path with pooled connections.

pub mod pool;

use crate::config::{UpstreamProtocol, UpstreamsConfig};
use crate::dns::wire;
use crate::error::{GjallarError, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use pool::{TcpPool, UdpPool};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};

const MAX_BACKOFF: Duration = Duration::from_secs(300);
const EWMA_ALPHA: f64 = 0.2;
const UDP_BUFFER: usize = 4096;
/// Assumed latency for upstreams with no samples yet, used by the weighted
/// strategy.
const DEFAULT_EWMA_MS: f64 = 50.0;

#[derive(Debug, Default)]
struct LiveState {
    skip_until: Option<Instant>,
    ewma_ms: Option<f64>,
    consecutive_failures: u32,
}

pub struct Upstream {
    pub name: String,
    pub addr: SocketAddr,
    pub protocol: UpstreamProtocol,
    pub weight: u32,
    state: Mutex<LiveState>,
    udp_pool: UdpPool,
    tcp_pool: TcpPool,
}

#[derive(Debug, Clone)]
pub struct UpstreamStats {
    pub name: String,
    pub address: SocketAddr,
    pub ewma_ms: Option<f64>,
    pub consecutive_failures: u32,
    pub in_backoff: bool,
}

impl Upstream {
    fn new(
        name: String,
        addr: SocketAddr,
        protocol: UpstreamProtocol,
        weight: u32,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            name,
            addr,
            protocol,
            weight,
            state: Mutex::new(LiveState::default()),
            udp_pool: UdpPool::new(addr),
            tcp_pool: TcpPool::new(addr, connect_timeout),
        }
    }

    fn is_available(&self, now: Instant) -> bool {
        self.state.lock().skip_until.is_none_or(|until| until <= now)
    }

    fn ewma_ms(&self) -> f64 {
        self.state.lock().ewma_ms.unwrap_or(DEFAULT_EWMA_MS)
    }

    fn record_success(&self, latency: Duration) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        state.skip_until = None;
        let sample = latency.as_secs_f64() * 1000.0;
        state.ewma_ms = Some(match state.ewma_ms {
            Some(ewma) => EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * ewma,
            None => sample,
        });
    }

    fn record_failure(&self, base_backoff: Duration) {
        let mut state = self.state.lock();
        state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        let exponent = state.consecutive_failures.saturating_sub(1).min(16);
        let backoff = base_backoff
            .saturating_mul(1u32 << exponent)
            .min(MAX_BACKOFF);
        state.skip_until = Some(Instant::now() + backoff);
        debug!(
            upstream = %self.name,
            failures = state.consecutive_failures,
            backoff_secs = backoff.as_secs(),
            "upstream backing off"
        );
        // A dead upstream's parked connections are not worth keeping.
        self.tcp_pool.drain();
    }

    fn stats(&self) -> UpstreamStats {
        let state = self.state.lock();
        UpstreamStats {
            name: self.name.clone(),
            address: self.addr,
            ewma_ms: state.ewma_ms,
            consecutive_failures: state.consecutive_failures,
            in_backoff: state
                .skip_until
                .is_some_and(|until| until > Instant::now()),
        }
    }

    async fn exchange_udp(&self, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let socket = self.udp_pool.get().await?;
        socket.send(query).await?;

        let mut buf = vec![0u8; UDP_BUFFER];
        let len = tokio::time::timeout(timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| GjallarError::Timeout)??;
        buf.truncate(len);
        self.udp_pool.put(socket);

        if len < wire::HEADER_LEN {
            return Err(GjallarError::ParseError("short UDP response".into()));
        }
        Ok(buf)
    }

    async fn exchange_tcp_once(&self, query: &[u8]) -> Result<(Vec<u8>, bool)> {
        let (mut stream, pooled) = self.tcp_pool.get().await?;

        let result: std::io::Result<Vec<u8>> = async {
            stream.write_all(&(query.len() as u16).to_be_bytes()).await?;
            stream.write_all(query).await?;
            stream.flush().await?;

            let mut len_buf = [0u8; 2];
            stream.read_exact(&mut len_buf).await?;
            let len = u16::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            stream.read_exact(&mut buf).await?;
            Ok(buf)
        }
        .await;

        match result {
            Ok(buf) => {
                self.tcp_pool.put(stream);
                Ok((buf, pooled))
            }
            Err(e) => {
                let eof = e.kind() == std::io::ErrorKind::UnexpectedEof;
                if pooled && eof {
                    // Stale pooled connection; the caller retries once fresh.
                    Err(GjallarError::Io("pooled connection EOF".into()))
                } else {
                    Err(e.into())
                }
            }
        }
    }

    async fn exchange_tcp(&self, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let attempt = async {
            match self.exchange_tcp_once(query).await {
                Ok((buf, _)) => Ok(buf),
                Err(GjallarError::Io(_)) => {
                    // The request bytes are only copied here, on retry.
                    let retry_query = query.to_vec();
                    self.exchange_tcp_once(&retry_query).await.map(|(buf, _)| buf)
                }
                Err(e) => Err(e),
            }
        };
        tokio::time::timeout(timeout, attempt)
            .await
            .map_err(|_| GjallarError::Timeout)?
    }

    async fn exchange_once(&self, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        match self.protocol {
            UpstreamProtocol::Udp => {
                let response = self.exchange_udp(query, timeout).await?;
                // Truncated answer: fall back to TCP for the full response.
                if response[2] & 0x02 != 0 {
                    debug!(upstream = %self.name, "UDP response truncated, retrying over TCP");
                    self.exchange_tcp(query, timeout).await
                } else {
                    Ok(response)
                }
            }
            UpstreamProtocol::Tcp => self.exchange_tcp(query, timeout).await,
            other => Err(GjallarError::UnsupportedProtocol(format!("{:?}", other))),
        }
    }
}

struct UpstreamSet {
    upstreams: Vec<Arc<Upstream>>,
    config: UpstreamsConfig,
}

/// Result of a successful exchange; SERVFAIL responses are surfaced with
/// `servfail = true` so the pipeline can apply backoff and stale-serving.
#[derive(Debug)]
pub struct Exchange {
    pub response: Vec<u8>,
    pub upstream: String,
    pub latency: Duration,
    pub servfail: bool,
}

pub struct UpstreamManager {
    set: ArcSwap<UpstreamSet>,
    rr: AtomicUsize,
}

impl UpstreamManager {
    pub fn new(config: &UpstreamsConfig) -> Result<Self> {
        let set = Self::build_set(config)?;
        Ok(Self {
            set: ArcSwap::from_pointee(set),
            rr: AtomicUsize::new(0),
        })
    }

    fn build_set(config: &UpstreamsConfig) -> Result<UpstreamSet> {
        let mut upstreams = Vec::with_capacity(config.servers.len());
        for entry in &config.servers {
            let addr: SocketAddr = entry
                .address
                .parse()
                .map_err(|_| GjallarError::InvalidUpstream(entry.address.clone()))?;
            upstreams.push(Arc::new(Upstream::new(
                entry.name.clone(),
                addr,
                entry.protocol,
                entry.weight.max(1),
                config.upstream_timeout,
            )));
        }
        Ok(UpstreamSet {
            upstreams,
            config: config.clone(),
        })
    }

    /// Swap in a new upstream list; live state of removed upstreams is
    /// dropped, surviving addresses start fresh.
    pub fn apply_config(&self, config: &UpstreamsConfig) -> Result<()> {
        let set = Self::build_set(config)?;
        self.set.store(Arc::new(set));
        Ok(())
    }

    /// Attempt order for one query under the configured strategy.
    fn select(&self, set: &UpstreamSet) -> Vec<Arc<Upstream>> {
        use crate::config::ResolverStrategy;

        let now = Instant::now();
        let mut available: Vec<Arc<Upstream>> = Vec::with_capacity(set.upstreams.len());
        let mut backed_off: Vec<Arc<Upstream>> = Vec::new();
        for upstream in &set.upstreams {
            if upstream.is_available(now) {
                available.push(upstream.clone());
            } else {
                backed_off.push(upstream.clone());
            }
        }

        match set.config.resolver_strategy {
            ResolverStrategy::Failover => {
                // Config order; backed-off upstreams rotate at the end as a
                // last resort.
                let cursor = self.rr.fetch_add(1, Ordering::Relaxed);
                if !backed_off.is_empty() {
                    let len = backed_off.len();
                    backed_off.rotate_left(cursor % len);
                }
            }
            ResolverStrategy::LoadBalance => {
                let cursor = self.rr.fetch_add(1, Ordering::Relaxed);
                if !available.is_empty() {
                    let len = available.len();
                    available.rotate_left(cursor % len);
                }
            }
            ResolverStrategy::Weighted => {
                // Faster upstreams first: order by EWMA scaled down by the
                // configured weight. No latency data sorts mid-field.
                available.sort_by(|a, b| {
                    let score_a = a.ewma_ms() / a.weight as f64;
                    let score_b = b.ewma_ms() / b.weight as f64;
                    score_a.partial_cmp(&score_b).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        available.extend(backed_off);
        available
    }

    /// Try upstreams in selection order until one answers. SERVFAIL counts
    /// as an upstream failure for backoff but is still a response; it is
    /// returned only when no later upstream does better.
    pub async fn exchange(&self, query: &[u8]) -> Result<Exchange> {
        let set = self.set.load_full();
        if set.upstreams.is_empty() {
            return Err(GjallarError::AllUpstreamsFailed("no upstreams configured".into()));
        }

        let candidates = self.select(&set);
        let attempts = set.config.max_attempts.max(1).min(candidates.len());
        let mut last_error: Option<GjallarError> = None;
        let mut servfail: Option<Exchange> = None;

        for upstream in candidates.into_iter().take(attempts) {
            let started = Instant::now();
            match upstream
                .exchange_once(query, set.config.upstream_timeout)
                .await
            {
                Ok(response) => {
                    let latency = started.elapsed();
                    if wire::rcode(&response) == 2 {
                        upstream.record_failure(set.config.upstream_backoff);
                        debug!(upstream = %upstream.name, "upstream answered SERVFAIL");
                        servfail.get_or_insert(Exchange {
                            response,
                            upstream: upstream.name.clone(),
                            latency,
                            servfail: true,
                        });
                        continue;
                    }
                    upstream.record_success(latency);
                    return Ok(Exchange {
                        response,
                        upstream: upstream.name.clone(),
                        latency,
                        servfail: false,
                    });
                }
                Err(e) => {
                    upstream.record_failure(set.config.upstream_backoff);
                    warn!(upstream = %upstream.name, error = %e, "upstream exchange failed");
                    last_error = Some(e);
                }
            }
        }

        if let Some(exchange) = servfail {
            return Ok(exchange);
        }
        Err(GjallarError::AllUpstreamsFailed(
            last_error.map_or_else(|| "no upstream attempted".into(), |e| e.to_string()),
        ))
    }

    pub fn stats(&self) -> Vec<UpstreamStats> {
        self.set.load().upstreams.iter().map(|u| u.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ResolverStrategy, UpstreamEntry};

    fn manager_with(strategy: ResolverStrategy, addrs: &[&str]) -> UpstreamManager {
        let config = UpstreamsConfig {
            servers: addrs
                .iter()
                .enumerate()
                .map(|(i, addr)| UpstreamEntry {
                    name: format!("u{}", i),
                    address: addr.to_string(),
                    protocol: UpstreamProtocol::Udp,
                    weight: 1,
                })
                .collect(),
            resolver_strategy: strategy,
            ..UpstreamsConfig::default()
        };
        UpstreamManager::new(&config).unwrap()
    }

    #[test]
    fn failover_prefers_config_order() {
        let manager = manager_with(
            ResolverStrategy::Failover,
            &["127.0.0.1:5301", "127.0.0.1:5302"],
        );
        let set = manager.set.load_full();
        let order = manager.select(&set);
        assert_eq!(order[0].name, "u0");
        assert_eq!(order[1].name, "u1");
    }

    #[test]
    fn failover_skips_backed_off_upstreams() {
        let manager = manager_with(
            ResolverStrategy::Failover,
            &["127.0.0.1:5301", "127.0.0.1:5302"],
        );
        let set = manager.set.load_full();
        set.upstreams[0].record_failure(Duration::from_secs(30));

        let order = manager.select(&set);
        assert_eq!(order[0].name, "u1");
        // Backed-off upstream stays reachable as a last resort.
        assert_eq!(order[1].name, "u0");
    }

    #[test]
    fn load_balance_rotates() {
        let manager = manager_with(
            ResolverStrategy::LoadBalance,
            &["127.0.0.1:5301", "127.0.0.1:5302", "127.0.0.1:5303"],
        );
        let set = manager.set.load_full();
        let first = manager.select(&set)[0].name.clone();
        let second = manager.select(&set)[0].name.clone();
        assert_ne!(first, second);
    }

    #[test]
    fn weighted_orders_by_latency() {
        let manager = manager_with(
            ResolverStrategy::Weighted,
            &["127.0.0.1:5301", "127.0.0.1:5302"],
        );
        let set = manager.set.load_full();
        set.upstreams[0].record_success(Duration::from_millis(80));
        set.upstreams[1].record_success(Duration::from_millis(5));

        let order = manager.select(&set);
        assert_eq!(order[0].name, "u1");
    }

    #[test]
    fn backoff_grows_exponentially_and_resets() {
        let upstream = Upstream::new(
            "test".into(),
            "127.0.0.1:5301".parse().unwrap(),
            UpstreamProtocol::Udp,
            1,
            Duration::from_secs(1),
        );

        upstream.record_failure(Duration::from_secs(1));
        let first = upstream.state.lock().skip_until.unwrap();
        upstream.record_failure(Duration::from_secs(1));
        let second = upstream.state.lock().skip_until.unwrap();
        assert!(second > first);
        assert_eq!(upstream.state.lock().consecutive_failures, 2);

        upstream.record_success(Duration::from_millis(10));
        assert_eq!(upstream.state.lock().consecutive_failures, 0);
        assert!(upstream.is_available(Instant::now()));
    }

    #[test]
    fn backoff_is_capped() {
        let upstream = Upstream::new(
            "test".into(),
            "127.0.0.1:5301".parse().unwrap(),
            UpstreamProtocol::Udp,
            1,
            Duration::from_secs(1),
        );
        for _ in 0..40 {
            upstream.record_failure(Duration::from_secs(30));
        }
        let until = upstream.state.lock().skip_until.unwrap();
        assert!(until.duration_since(Instant::now()) <= MAX_BACKOFF);
    }
}
