//! Query analytics events, the non-blocking sink seam and webhooks.

use parking_lot::Mutex;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// How a query left the pipeline. The label set is part of the analytics
/// contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Local,
    SafeSearch,
    Blocked,
    Cached,
    CachedStale,
    Upstream,
    UpstreamError,
    UpstreamServfail,
    ServfailBackoff,
    Invalid,
}

impl Outcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Outcome::Local => "local",
            Outcome::SafeSearch => "safesearch",
            Outcome::Blocked => "blocked",
            Outcome::Cached => "cached",
            Outcome::CachedStale => "cached_stale",
            Outcome::Upstream => "upstream",
            Outcome::UpstreamError => "upstream_error",
            Outcome::UpstreamServfail => "upstream_servfail",
            Outcome::ServfailBackoff => "servfail_backoff",
            Outcome::Invalid => "invalid",
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub timestamp: u64,
    pub qname: String,
    pub qtype: u16,
    pub client: IpAddr,
    pub client_name: Option<Arc<str>>,
    pub protocol: &'static str,
    pub outcome: Outcome,
    pub rcode: &'static str,
    pub upstream: Option<String>,
    /// Latency breakdown, sampled before async side effects so the numbers
    /// reflect the client-visible path.
    pub cache_lookup: Duration,
    pub upstream_exchange: Duration,
    pub network_write: Duration,
    pub total: Duration,
}

/// Non-blocking analytics seam. `record` must never block the query task;
/// implementations drop on overload.
pub trait EventSink: Send + Sync {
    fn record(&self, event: QueryEvent);
}

pub struct NoopSink;

impl EventSink for NoopSink {
    fn record(&self, _event: QueryEvent) {}
}

/// Bounded-channel sink: `try_send` semantics, drop counting, and a log
/// line every `log_every` drops.
pub struct ChannelSink {
    tx: mpsc::Sender<QueryEvent>,
    dropped: AtomicU64,
    log_every: u64,
}

impl ChannelSink {
    pub fn new(capacity: usize, log_every: u64) -> (Self, mpsc::Receiver<QueryEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: AtomicU64::new(0),
                log_every: log_every.max(1),
            },
            rx,
        )
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl EventSink for ChannelSink {
    fn record(&self, event: QueryEvent) {
        if self.tx.try_send(event).is_err() {
            let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped % self.log_every == 0 {
                warn!(dropped, "event sink full, dropping query events");
            }
        }
    }
}

/// Fire-and-forget notification seam for blocked queries and upstream
/// errors. Rate-limited; never blocks or fails the query.
pub trait Webhook: Send + Sync {
    fn fire_on_block(&self, event: &QueryEvent);
    fn fire_on_error(&self, event: &QueryEvent);
}

pub struct NoopWebhook;

impl Webhook for NoopWebhook {
    fn fire_on_block(&self, _event: &QueryEvent) {}
    fn fire_on_error(&self, _event: &QueryEvent) {}
}

/// Logs webhook-worthy events at most once per interval per kind. Stands in
/// for an HTTP dispatcher, which lives outside the core.
pub struct LoggingWebhook {
    min_interval: Duration,
    last_block: Mutex<Option<Instant>>,
    last_error: Mutex<Option<Instant>>,
}

impl LoggingWebhook {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_block: Mutex::new(None),
            last_error: Mutex::new(None),
        }
    }

    fn allowed(&self, slot: &Mutex<Option<Instant>>) -> bool {
        let mut last = slot.lock();
        let now = Instant::now();
        if last.is_none_or(|at| now.duration_since(at) >= self.min_interval) {
            *last = Some(now);
            true
        } else {
            false
        }
    }
}

impl Webhook for LoggingWebhook {
    fn fire_on_block(&self, event: &QueryEvent) {
        if self.allowed(&self.last_block) {
            info!(qname = %event.qname, client = %event.client, "on_block webhook");
        }
    }

    fn fire_on_error(&self, event: &QueryEvent) {
        if self.allowed(&self.last_error) {
            info!(qname = %event.qname, client = %event.client, "on_error webhook");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event() -> QueryEvent {
        QueryEvent {
            timestamp: 0,
            qname: "example.com".into(),
            qtype: 1,
            client: "127.0.0.1".parse().unwrap(),
            client_name: None,
            protocol: "udp",
            outcome: Outcome::Cached,
            rcode: "NOERROR",
            upstream: None,
            cache_lookup: Duration::ZERO,
            upstream_exchange: Duration::ZERO,
            network_write: Duration::ZERO,
            total: Duration::ZERO,
        }
    }

    #[test]
    fn channel_sink_drops_on_full_and_counts() {
        let (sink, mut rx) = ChannelSink::new(2, 100);
        sink.record(event());
        sink.record(event());
        sink.record(event());
        assert_eq!(sink.dropped(), 1);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outcome_labels_are_stable() {
        assert_eq!(Outcome::Cached.as_str(), "cached");
        assert_eq!(Outcome::ServfailBackoff.as_str(), "servfail_backoff");
        assert_eq!(Outcome::UpstreamServfail.as_str(), "upstream_servfail");
    }
}
