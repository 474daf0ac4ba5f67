//! Shared fixtures: an in-process stub upstream, response/event capture,
//! and a resolver builder wired for L0-only operation.
#![allow(dead_code)]

use async_trait::async_trait;
use gjallar::blocking::{BlocklistFetcher, BlocklistManager};
use gjallar::cache::{DnsCache, HitCounters, SieveCache};
use gjallar::clients::ClientResolver;
use gjallar::config::Config;
use gjallar::dns::{Message, Question, RecordClass, RecordType, ResourceRecord};
use gjallar::error::{GjallarError, Result};
use gjallar::events::{EventSink, NoopWebhook, QueryEvent};
use gjallar::metrics::Metrics;
use gjallar::resolver::{Resolver, ResponseWriter};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::UdpSocket;

pub const L0_SHARDS: usize = 32;

#[derive(Debug, Clone, Copy)]
pub enum StubBehavior {
    /// Answer every query with an A record.
    Answer { ip: Ipv4Addr, ttl: u32 },
    Servfail,
    /// Swallow queries so the exchange times out.
    Ignore,
}

pub struct StubUpstream {
    pub addr: std::net::SocketAddr,
    queries: Arc<AtomicUsize>,
}

impl StubUpstream {
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

pub async fn spawn_stub(behavior: StubBehavior) -> StubUpstream {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let queries = Arc::new(AtomicUsize::new(0));
    let counter = queries.clone();

    tokio::spawn(async move {
        let mut buf = vec![0u8; 4096];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else {
                return;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            let Ok(query) = Message::parse(&buf[..len]) else {
                continue;
            };

            let response = match behavior {
                StubBehavior::Answer { ip, ttl } => {
                    let qname = query.questions[0].name();
                    Message::answer_for(&query, vec![ResourceRecord::a(&qname, ttl, ip)])
                }
                StubBehavior::Servfail => Message::servfail_for(&query),
                StubBehavior::Ignore => continue,
            };
            if let Ok(bytes) = response.serialize() {
                let _ = socket.send_to(&bytes, peer).await;
            }
        }
    });

    StubUpstream { addr, queries }
}

pub struct CaptureWriter {
    responses: Mutex<Vec<Vec<u8>>>,
}

impl CaptureWriter {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(Vec::new()),
        }
    }

    pub fn last(&self) -> Vec<u8> {
        self.responses.lock().unwrap().last().cloned().expect("no response written")
    }

    pub fn count(&self) -> usize {
        self.responses.lock().unwrap().len()
    }
}

#[async_trait]
impl ResponseWriter for CaptureWriter {
    async fn write(&self, response: &[u8]) -> std::io::Result<()> {
        self.responses.lock().unwrap().push(response.to_vec());
        Ok(())
    }
}

pub struct CaptureSink {
    events: Mutex<Vec<QueryEvent>>,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn last_outcome(&self) -> Option<gjallar::events::Outcome> {
        self.events.lock().unwrap().last().map(|e| e.outcome)
    }

    pub fn outcomes(&self) -> Vec<gjallar::events::Outcome> {
        self.events.lock().unwrap().iter().map(|e| e.outcome).collect()
    }
}

impl EventSink for CaptureSink {
    fn record(&self, event: QueryEvent) {
        self.events.lock().unwrap().push(event);
    }
}

/// Serves blocklist sources from memory.
pub struct MapFetcher {
    bodies: HashMap<String, String>,
}

impl MapFetcher {
    pub fn new(entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            bodies: entries
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        })
    }

    pub fn empty() -> Arc<Self> {
        Arc::new(Self {
            bodies: HashMap::new(),
        })
    }
}

#[async_trait]
impl BlocklistFetcher for MapFetcher {
    async fn fetch(&self, url: &str) -> Result<String> {
        self.bodies
            .get(url)
            .cloned()
            .ok_or_else(|| GjallarError::BlocklistFetch(url.to_string()))
    }
}

pub struct Harness {
    pub resolver: Arc<Resolver>,
    pub cache: Arc<DnsCache>,
    pub sink: Arc<CaptureSink>,
}

/// Build a resolver over an L0-only cache, stub fetcher sources, and the
/// given config (upstreams already pointed at a stub).
pub async fn build_harness(config: Config, fetcher: Arc<MapFetcher>) -> Harness {
    let l0 = (config.cache.redis.lru_size > 0)
        .then(|| SieveCache::new(config.cache.redis.lru_size, L0_SHARDS));
    let hit_counters = HitCounters::new(
        L0_SHARDS,
        config.refresh.hit_window,
        config.refresh.sweep_hit_window,
        config.refresh.hit_count_sample_rate,
    );
    let cache = Arc::new(DnsCache::new(l0, None, hit_counters, config.cache.lru_grace_period));

    let blocklist = Arc::new(BlocklistManager::new(fetcher));
    blocklist
        .apply_group_configs(&config.client_groups)
        .await
        .unwrap();
    blocklist.apply_config(&config.blocklist).await.unwrap();

    let upstreams = Arc::new(gjallar::upstream::UpstreamManager::new(&config.upstreams).unwrap());
    let sink = CaptureSink::new();

    let resolver = Resolver::new(
        &config,
        cache.clone(),
        blocklist,
        upstreams,
        Arc::new(ClientResolver::new()),
        sink.clone(),
        Arc::new(NoopWebhook),
        Arc::new(Metrics::new().unwrap()),
    )
    .unwrap();

    Harness {
        resolver,
        cache,
        sink,
    }
}

/// A config pointed at one stub upstream, short timeouts, caching on.
pub fn test_config(upstream: &StubUpstream) -> Config {
    let mut config = Config::default();
    config.upstreams.servers = vec![gjallar::config::UpstreamEntry {
        name: "stub".to_string(),
        address: upstream.addr.to_string(),
        protocol: gjallar::config::UpstreamProtocol::Udp,
        weight: 1,
    }];
    config.upstreams.upstream_timeout = std::time::Duration::from_millis(500);
    config.upstreams.max_attempts = 1;
    config
}

pub fn make_query(name: &str, qtype: RecordType, id: u16) -> Message {
    let mut query = Message::default();
    query.header.id = id;
    query.header.rd = true;
    query.questions.push(Question {
        labels: name.split('.').map(|s| s.to_string()).collect(),
        qtype,
        qclass: RecordClass::IN,
    });
    query
}

pub fn client_addr() -> std::net::SocketAddr {
    "127.0.0.1:55353".parse().unwrap()
}
