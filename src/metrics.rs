use prometheus::{
    Histogram, IntCounter, IntCounterVec, IntGauge, Registry, histogram_opts, opts,
};

/// Prometheus collectors for the forwarder core. The registry is exposed to
/// whatever metrics plane the deployment wires up; the core only records.
pub struct Metrics {
    registry: Registry,

    pub queries_total: IntCounterVec,
    pub query_duration: Histogram,
    pub blocked_queries: IntCounter,
    pub cache_hits: IntCounterVec,
    pub cache_misses: IntCounter,
    pub stale_serves: IntCounter,
    pub upstream_failures: IntCounterVec,
    pub servfail_backoff_hits: IntCounter,
    pub event_drops: IntCounter,
    pub refreshes_scheduled: IntCounter,
    pub refreshes_completed: IntCounter,
    pub sweep_last_count: IntGauge,
    pub sweep_last_removed: IntGauge,
    pub sweep_deletion_candidates: IntGauge,
    pub l0_entries: IntGauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            opts!("gjallar_queries_total", "Queries by pipeline outcome"),
            &["outcome"],
        )?;
        let query_duration = Histogram::with_opts(histogram_opts!(
            "gjallar_query_duration_seconds",
            "Client-visible query latency",
            vec![0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
        ))?;
        let blocked_queries = IntCounter::with_opts(opts!(
            "gjallar_blocked_queries_total",
            "Queries answered by blocklist policy"
        ))?;
        let cache_hits = IntCounterVec::new(
            opts!("gjallar_cache_hits_total", "Cache hits by tier"),
            &["tier"],
        )?;
        let cache_misses = IntCounter::with_opts(opts!(
            "gjallar_cache_misses_total",
            "Queries that reached an upstream"
        ))?;
        let stale_serves = IntCounter::with_opts(opts!(
            "gjallar_stale_serves_total",
            "Responses served past their soft expiry"
        ))?;
        let upstream_failures = IntCounterVec::new(
            opts!("gjallar_upstream_failures_total", "Exchange failures by upstream"),
            &["upstream"],
        )?;
        let servfail_backoff_hits = IntCounter::with_opts(opts!(
            "gjallar_servfail_backoff_hits_total",
            "Queries short-circuited by SERVFAIL backoff"
        ))?;
        let event_drops = IntCounter::with_opts(opts!(
            "gjallar_event_drops_total",
            "Analytics events dropped on a full sink"
        ))?;
        let refreshes_scheduled = IntCounter::with_opts(opts!(
            "gjallar_refreshes_scheduled_total",
            "Background refreshes scheduled"
        ))?;
        let refreshes_completed = IntCounter::with_opts(opts!(
            "gjallar_refreshes_completed_total",
            "Background refreshes that wrote a fresh answer"
        ))?;
        let sweep_last_count = IntGauge::with_opts(opts!(
            "gjallar_sweep_last_count",
            "Candidates examined by the last sweep"
        ))?;
        let sweep_last_removed = IntGauge::with_opts(opts!(
            "gjallar_sweep_last_removed",
            "Keys removed by the last sweep"
        ))?;
        let sweep_deletion_candidates = IntGauge::with_opts(opts!(
            "gjallar_sweep_deletion_candidates",
            "Cached count of keys nearing expiry"
        ))?;
        let l0_entries = IntGauge::with_opts(opts!(
            "gjallar_l0_entries",
            "Entries resident in the in-process cache"
        ))?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;
        registry.register(Box::new(blocked_queries.clone()))?;
        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(stale_serves.clone()))?;
        registry.register(Box::new(upstream_failures.clone()))?;
        registry.register(Box::new(servfail_backoff_hits.clone()))?;
        registry.register(Box::new(event_drops.clone()))?;
        registry.register(Box::new(refreshes_scheduled.clone()))?;
        registry.register(Box::new(refreshes_completed.clone()))?;
        registry.register(Box::new(sweep_last_count.clone()))?;
        registry.register(Box::new(sweep_last_removed.clone()))?;
        registry.register(Box::new(sweep_deletion_candidates.clone()))?;
        registry.register(Box::new(l0_entries.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            query_duration,
            blocked_queries,
            cache_hits,
            cache_misses,
            stale_serves,
            upstream_failures,
            servfail_backoff_hits,
            event_drops,
            refreshes_scheduled,
            refreshes_completed,
            sweep_last_count,
            sweep_last_removed,
            sweep_deletion_candidates,
            l0_entries,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}
