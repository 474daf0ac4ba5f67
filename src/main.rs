use clap::Parser;
use gjallar::blocking::{BlocklistManager, HttpFetcher, updater};
use gjallar::cache::{DnsCache, HitCounters, RedisStore, SieveCache, hits};
use gjallar::clients::ClientResolver;
use gjallar::config::Config;
use gjallar::events::{ChannelSink, LoggingWebhook, QueryEvent};
use gjallar::metrics::Metrics;
use gjallar::resolver::Resolver;
use gjallar::server;
use gjallar::sweeper::Sweeper;
use gjallar::upstream::UpstreamManager;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, trace, warn};
use tracing_subscriber::EnvFilter;

const L0_SHARDS: usize = 32;
const EVENT_BUFFER: usize = 4096;
const EVENT_DROP_LOG_EVERY: u64 = 1000;
const WEBHOOK_MIN_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "gjallar", about = "Ad-blocking DNS forwarder with multi-tier caching")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<String>,
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Drains the analytics channel. The real event store lives outside the
/// core; this keeps the contract visible and the channel moving.
async fn drain_events(mut rx: tokio::sync::mpsc::Receiver<QueryEvent>) {
    while let Some(event) = rx.recv().await {
        trace!(
            event = %json!({
                "ts": event.timestamp,
                "qname": event.qname,
                "qtype": event.qtype,
                "client": event.client.to_string(),
                "client_name": event.client_name.as_deref(),
                "protocol": event.protocol,
                "outcome": event.outcome.as_str(),
                "rcode": event.rcode,
                "upstream": event.upstream,
                "cache_us": event.cache_lookup.as_micros() as u64,
                "upstream_us": event.upstream_exchange.as_micros() as u64,
                "write_us": event.network_write.as_micros() as u64,
                "total_us": event.total.as_micros() as u64,
            }),
            "query"
        );
    }
}

#[tokio::main]
async fn main() {
    init_logging();
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };
    if let Err(e) = config.validate() {
        error!("invalid configuration: {}", e);
        std::process::exit(1);
    }

    let metrics = match Metrics::new() {
        Ok(metrics) => Arc::new(metrics),
        Err(e) => {
            error!("metrics registry init failed: {}", e);
            std::process::exit(1);
        }
    };

    // L1 is optional: without Redis the forwarder runs on L0 + upstreams.
    let l1 = if config.cache.redis.enabled() {
        match RedisStore::connect(&config.cache.redis).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!("Redis unavailable, running without L1: {}", e);
                None
            }
        }
    } else {
        info!("no Redis configured, running without L1");
        None
    };

    let l0 = (config.cache.redis.lru_size > 0)
        .then(|| SieveCache::new(config.cache.redis.lru_size, L0_SHARDS));
    let hit_counters = HitCounters::new(
        L0_SHARDS,
        config.refresh.hit_window,
        config.refresh.sweep_hit_window,
        config.refresh.hit_count_sample_rate,
    );
    let cache = Arc::new(DnsCache::new(
        l0,
        l1.clone(),
        hit_counters,
        config.cache.lru_grace_period,
    ));

    if let Some(l1) = &l1 {
        if let Some(rx) = cache.hit_counters().take_flush_receiver() {
            tokio::spawn(hits::run_flusher(
                rx,
                l1.clone(),
                config.refresh.hit_window,
                config.refresh.sweep_hit_window,
            ));
        }
    }

    let blocklist = Arc::new(BlocklistManager::new(Arc::new(HttpFetcher::new())));
    if let Err(e) = blocklist.apply_group_configs(&config.client_groups).await {
        error!("client group blocklists rejected: {}", e);
        std::process::exit(1);
    }
    if let Err(e) = blocklist.apply_config(&config.blocklist).await {
        error!("blocklist configuration rejected: {}", e);
        std::process::exit(1);
    }
    tokio::spawn(updater::run_refresh(
        blocklist.clone(),
        config.blocklist.refresh_interval,
    ));

    let upstreams = match UpstreamManager::new(&config.upstreams) {
        Ok(upstreams) => Arc::new(upstreams),
        Err(e) => {
            error!("upstream configuration rejected: {}", e);
            std::process::exit(1);
        }
    };

    let (sink, events_rx) = ChannelSink::new(EVENT_BUFFER, EVENT_DROP_LOG_EVERY);
    tokio::spawn(drain_events(events_rx));

    let resolver = match Resolver::new(
        &config,
        cache.clone(),
        blocklist,
        upstreams,
        Arc::new(ClientResolver::new()),
        Arc::new(sink),
        Arc::new(LoggingWebhook::new(WEBHOOK_MIN_INTERVAL)),
        metrics.clone(),
    ) {
        Ok(resolver) => resolver,
        Err(e) => {
            error!("resolver init failed: {}", e);
            std::process::exit(1);
        }
    };

    let sweeper = Arc::new(Sweeper::new(
        resolver.clone(),
        cache.clone(),
        metrics.clone(),
        &config.refresh,
    ));
    tokio::spawn(sweeper.run());

    let udp = config.server.protocols.iter().any(|p| p == "udp");
    let tcp = config.server.protocols.iter().any(|p| p == "tcp");
    for listen in &config.server.listen {
        let addr = match listen.parse() {
            Ok(addr) => addr,
            Err(_) => {
                error!("invalid listen address {}", listen);
                std::process::exit(1);
            }
        };
        if udp {
            let resolver = resolver.clone();
            let server_config = config.server.clone();
            tokio::spawn(async move {
                if let Err(e) = server::run_udp_server(addr, server_config, resolver).await {
                    error!("UDP server on {} failed: {}", addr, e);
                }
            });
        }
        if tcp {
            let resolver = resolver.clone();
            let server_config = config.server.clone();
            tokio::spawn(async move {
                if let Err(e) = server::run_tcp_server(addr, server_config, resolver).await {
                    error!("TCP server on {} failed: {}", addr, e);
                }
            });
        }
    }

    info!("gjallar is up");
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("signal handler failed: {}", e);
    }
    info!("shutting down");
}
