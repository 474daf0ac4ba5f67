//! The request pipeline: local records → safe-search → blocklist → L0 → L1
//! → upstream, with stale serving, SERVFAIL backoff and refresh-ahead.
//!
//! The response is written to the client before any cache write, hit
//! increment, webhook or analytics send; those run in detached tasks and
//! never fail the query.

use crate::blocking::{BlockDecision, BlocklistManager};
use crate::cache::{CacheEntry, CacheKey, DnsCache, HitKind, now_unix};
use crate::clients::ClientResolver;
use crate::config::{Config, ResponseConfig, SafeSearchConfig, UpstreamsConfig};
use crate::dns::{Message, Question, Rcode, RecordType, ResourceRecord, wire};
use crate::error::Result;
use crate::events::{EventSink, Outcome, QueryEvent, Webhook};
use crate::local_records::LocalRecords;
use crate::metrics::Metrics;
use crate::safesearch::SafeSearch;
use crate::servfail::ServfailTracker;
use crate::upstream::UpstreamManager;
use arc_swap::ArcSwap;
use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashSet;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

const SAFE_SEARCH_TTL: u32 = 300;

static UPSTREAM_ID: AtomicU16 = AtomicU16::new(1);

/// Where the response bytes go. The server wraps its sockets in this; tests
/// use an in-memory writer.
#[async_trait]
pub trait ResponseWriter: Send + Sync {
    async fn write(&self, response: &[u8]) -> std::io::Result<()>;
}

#[derive(Debug, Clone, Copy)]
enum BlockedMode {
    NxDomain,
    Sink(IpAddr),
}

struct ResponsePolicy {
    mode: BlockedMode,
    ttl: u32,
}

impl ResponsePolicy {
    fn from_config(config: &ResponseConfig) -> Self {
        let mode = match config.blocked_addr() {
            Some(addr) => BlockedMode::Sink(addr),
            None => BlockedMode::NxDomain,
        };
        Self {
            mode,
            ttl: config.blocked_ttl.as_secs() as u32,
        }
    }
}

#[derive(Debug, Default)]
pub struct RefreshCounters {
    pub scheduled: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub lock_contended: AtomicU64,
    pub suppressed: AtomicU64,
    pub saturated: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct RefreshStats {
    pub scheduled: u64,
    pub completed: u64,
    pub failed: u64,
    pub lock_contended: u64,
    pub suppressed: u64,
    pub saturated: u64,
}

struct RefreshSettings {
    enabled: bool,
    hot_threshold: u64,
    min_ttl: u64,
    hot_ttl: u64,
    lock_ttl: Duration,
    serve_stale: bool,
    stale_ttl: u32,
}

struct TtlPolicy {
    min_ttl: u64,
    max_ttl: u64,
    negative_ttl: u64,
    expired_entry_ttl: u32,
    respect_source_ttl: bool,
}

impl TtlPolicy {
    /// Clamp an upstream answer's minimum RR TTL into the configured band.
    fn cache_ttl(&self, response: &[u8]) -> u64 {
        if wire::is_negative(response) {
            return self.negative_ttl;
        }
        if !self.respect_source_ttl {
            return self.min_ttl;
        }
        let source = wire::min_answer_ttl(response)
            .ok()
            .flatten()
            .map_or(self.min_ttl, u64::from);
        source.clamp(self.min_ttl, self.max_ttl)
    }
}

pub struct Resolver {
    cache: Arc<DnsCache>,
    blocklist: Arc<BlocklistManager>,
    upstreams: Arc<UpstreamManager>,
    servfail: Arc<ServfailTracker>,
    clients: Arc<ClientResolver>,
    safe_search: SafeSearch,
    local_records: LocalRecords,
    response_policy: ArcSwap<ResponsePolicy>,
    trace_events: ArcSwap<FxHashSet<String>>,
    sink: Arc<dyn EventSink>,
    webhook: Arc<dyn Webhook>,
    metrics: Arc<Metrics>,
    refresh_semaphore: Arc<Semaphore>,
    refresh: RefreshSettings,
    ttl_policy: TtlPolicy,
    pub refresh_counters: RefreshCounters,
}

impl Resolver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        cache: Arc<DnsCache>,
        blocklist: Arc<BlocklistManager>,
        upstreams: Arc<UpstreamManager>,
        clients: Arc<ClientResolver>,
        sink: Arc<dyn EventSink>,
        webhook: Arc<dyn Webhook>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let local_records = LocalRecords::new();
        local_records.apply_config(&config.local_records)?;

        let clients_config = &config.client_identification;
        clients.apply_config(clients_config, &config.client_groups);

        let refresh = RefreshSettings {
            enabled: config.refresh.enabled && config.refresh.max_inflight > 0,
            hot_threshold: config.refresh.hot_threshold,
            min_ttl: config.refresh.min_ttl.as_secs(),
            hot_ttl: config.refresh.hot_ttl.as_secs(),
            lock_ttl: config.refresh.lock_ttl,
            serve_stale: config.refresh.serve_stale,
            stale_ttl: config.refresh.stale_ttl.as_secs() as u32,
        };
        let ttl_policy = TtlPolicy {
            min_ttl: config.cache.min_ttl.as_secs(),
            max_ttl: config.cache.max_ttl.as_secs(),
            negative_ttl: config.cache.negative_ttl.as_secs(),
            expired_entry_ttl: config.cache.expired_entry_ttl.as_secs() as u32,
            respect_source_ttl: config.cache.respect_source_ttl,
        };

        let servfail = Arc::new(ServfailTracker::new(
            config.cache.servfail_backoff,
            config.cache.servfail_log_interval,
            config.cache.servfail_refresh_threshold,
        ));

        Ok(Arc::new(Self {
            cache,
            blocklist,
            upstreams,
            servfail,
            clients,
            safe_search: SafeSearch::new(config.safe_search.clone()),
            local_records,
            response_policy: ArcSwap::from_pointee(ResponsePolicy::from_config(&config.response)),
            trace_events: ArcSwap::from_pointee(FxHashSet::default()),
            sink,
            webhook,
            metrics,
            refresh_semaphore: Arc::new(Semaphore::new(config.refresh.max_inflight)),
            refresh,
            ttl_policy,
            refresh_counters: RefreshCounters::default(),
        }))
    }

    pub fn servfail_tracker(&self) -> &Arc<ServfailTracker> {
        &self.servfail
    }

    pub fn cache(&self) -> &Arc<DnsCache> {
        &self.cache
    }

    pub fn refresh_stats(&self) -> RefreshStats {
        RefreshStats {
            scheduled: self.refresh_counters.scheduled.load(Ordering::Relaxed),
            completed: self.refresh_counters.completed.load(Ordering::Relaxed),
            failed: self.refresh_counters.failed.load(Ordering::Relaxed),
            lock_contended: self.refresh_counters.lock_contended.load(Ordering::Relaxed),
            suppressed: self.refresh_counters.suppressed.load(Ordering::Relaxed),
            saturated: self.refresh_counters.saturated.load(Ordering::Relaxed),
        }
    }

    // --- hot-reload mutators ---

    pub async fn apply_blocklist_config(&self, config: &crate::config::BlocklistConfig) -> Result<bool> {
        self.blocklist.apply_config(config).await
    }

    pub fn apply_upstream_config(&self, config: &UpstreamsConfig) -> Result<()> {
        self.upstreams.apply_config(config)
    }

    pub fn apply_response_config(&self, config: &ResponseConfig) {
        self.response_policy
            .store(Arc::new(ResponsePolicy::from_config(config)));
    }

    pub fn apply_safe_search_config(&self, config: SafeSearchConfig) {
        self.safe_search.apply_config(config);
    }

    pub fn apply_local_records(&self, records: &[crate::config::LocalRecordConfig]) -> Result<()> {
        self.local_records.apply_config(records)
    }

    pub fn apply_client_identification_config(
        &self,
        identification: &crate::config::ClientIdentificationConfig,
        groups: &[crate::config::ClientGroupConfig],
    ) {
        self.clients.apply_config(identification, groups);
    }

    pub async fn apply_groups_config(&self, groups: &[crate::config::ClientGroupConfig]) -> Result<bool> {
        self.blocklist.apply_group_configs(groups).await
    }

    pub fn set_trace_events(&self, names: Vec<String>) {
        let set: FxHashSet<String> = names
            .into_iter()
            .map(|n| n.trim_end_matches('.').to_ascii_lowercase())
            .collect();
        self.trace_events.store(Arc::new(set));
    }

    // --- pipeline ---

    pub async fn serve_query(
        self: &Arc<Self>,
        query_bytes: &[u8],
        client: SocketAddr,
        protocol: &'static str,
        writer: &dyn ResponseWriter,
    ) {
        let started = Instant::now();

        let query = match Message::parse(query_bytes) {
            Ok(query) if !query.questions.is_empty() && !query.header.qr => query,
            Ok(query) if query.header.qr => {
                // A response packet aimed at us; never reflect it back.
                debug!(client = %client, "dropping unsolicited response packet");
                return;
            }
            Ok(query) => {
                self.answer_formerr(&query, client, protocol, writer, started).await;
                return;
            }
            Err(e) => {
                debug!(client = %client, error = %e, "dropping unparseable packet");
                self.metrics
                    .queries_total
                    .with_label_values(&[Outcome::Invalid.as_str()])
                    .inc();
                return;
            }
        };

        let question = query.questions[0].clone();
        let qname = question.name();
        let key = CacheKey::from_question(&question);
        let traced = self.trace_events.load().contains(&qname);
        if traced {
            info!(qname = %qname, client = %client, "trace: query entered pipeline");
        }

        let client_name = self.clients.resolve_name(client.ip());
        let group_id = self.clients.resolve_group(client.ip());

        let mut ctx = QueryContext {
            resolver: self.clone(),
            query,
            query_bytes,
            question,
            qname,
            key,
            client,
            client_name,
            group_id,
            protocol,
            traced,
            started,
            cache_lookup: Duration::ZERO,
            upstream_exchange: Duration::ZERO,
            upstream_name: None,
        };
        ctx.run(writer).await;
    }

    async fn answer_formerr(
        self: &Arc<Self>,
        query: &Message,
        client: SocketAddr,
        protocol: &'static str,
        writer: &dyn ResponseWriter,
        started: Instant,
    ) {
        let response = Message::formerr_for(query);
        let bytes = match response.serialize() {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let write_started = Instant::now();
        if let Err(e) = writer.write(&bytes).await {
            debug!(client = %client, error = %e, "client write failed");
        }
        let event = QueryEvent {
            timestamp: now_unix(),
            qname: query.questions.first().map(|q| q.name()).unwrap_or_default(),
            qtype: query.questions.first().map_or(0, |q| q.qtype.into()),
            client: client.ip(),
            client_name: None,
            protocol,
            outcome: Outcome::Invalid,
            rcode: Rcode::FormErr.as_str(),
            upstream: None,
            cache_lookup: Duration::ZERO,
            upstream_exchange: Duration::ZERO,
            network_write: write_started.elapsed(),
            total: started.elapsed(),
        };
        self.metrics
            .queries_total
            .with_label_values(&[Outcome::Invalid.as_str()])
            .inc();
        self.sink.record(event);
    }

    /// Background refresh of one key: in-process semaphore, cluster-wide
    /// lock, upstream exchange, cache write. Saturation and lock contention
    /// are silent no-ops (the sweeper returns to the key later).
    pub fn schedule_refresh(self: &Arc<Self>, key: CacheKey) {
        if !self.refresh.enabled {
            return;
        }
        // Keys in active backoff (or past the failure threshold) are not
        // refreshed; the sweeper reconsiders them once the backoff lapses.
        let redis_key = key.redis_key();
        if self.servfail.is_backoff(&redis_key) || self.servfail.refresh_suppressed(&redis_key) {
            self.refresh_counters.suppressed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let Ok(permit) = self.refresh_semaphore.clone().try_acquire_owned() else {
            self.refresh_counters.saturated.fetch_add(1, Ordering::Relaxed);
            return;
        };

        self.refresh_counters.scheduled.fetch_add(1, Ordering::Relaxed);
        self.metrics.refreshes_scheduled.inc();
        let resolver = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            resolver.run_refresh(key).await;
        });
    }

    async fn run_refresh(self: Arc<Self>, key: CacheKey) {
        match self.cache.try_acquire_refresh(&key, self.refresh.lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                self.refresh_counters.lock_contended.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(e) => {
                debug!(key = %key, error = %e, "refresh lock acquire failed");
                return;
            }
        }

        let result = self.refresh_exchange(&key).await;
        if let Err(e) = self.cache.release_refresh(&key).await {
            debug!(key = %key, error = %e, "refresh lock release failed");
        }

        match result {
            Ok(()) => {
                self.refresh_counters.completed.fetch_add(1, Ordering::Relaxed);
                self.metrics.refreshes_completed.inc();
            }
            Err(e) => {
                self.refresh_counters.failed.fetch_add(1, Ordering::Relaxed);
                debug!(key = %key, error = %e, "refresh failed");
            }
        }
    }

    async fn refresh_exchange(&self, key: &CacheKey) -> Result<()> {
        let mut query = Message::default();
        query.header.id = UPSTREAM_ID.fetch_add(1, Ordering::Relaxed);
        query.header.rd = true;
        query.questions.push(Question {
            labels: key.name.split('.').map(|l| l.to_string()).collect(),
            qtype: RecordType::from(key.qtype),
            qclass: key.qclass.into(),
        });
        let query_bytes = query.serialize()?;

        let exchange = self.upstreams.exchange(&query_bytes).await?;
        if exchange.servfail {
            let record = self.servfail.record_backoff(&key.redis_key());
            if record.should_log {
                debug!(key = %key, fail_count = record.fail_count, "refresh got SERVFAIL");
            }
            return Err(crate::error::GjallarError::UpstreamServfail);
        }

        let ttl = self.ttl_policy.cache_ttl(&exchange.response);
        let mut response = exchange.response;
        let _ = wire::rewrite_ttls(&mut response, ttl as u32);
        self.store_response(key, &response, ttl).await;
        Ok(())
    }

    /// Write-through used by both the foreground miss path (from a detached
    /// task) and refreshes. L1 failures drop the write with a warning.
    async fn store_response(&self, key: &CacheKey, response: &[u8], ttl: u64) {
        let now = now_unix();
        let entry = CacheEntry {
            msg: Bytes::copy_from_slice(response),
            soft_expiry: now + ttl,
            created_at: now,
        };
        self.cache.set(key, entry);

        if let Err(e) = self.cache.set_with_index(key, response, ttl).await {
            self.cache.counters.l1_errors.fetch_add(1, Ordering::Relaxed);
            warn!(key = %key, error = %e, "cache write failed, dropping");
        }
    }
}

/// Per-query working state, carried through the pipeline stages.
struct QueryContext<'a> {
    resolver: Arc<Resolver>,
    query: Message,
    query_bytes: &'a [u8],
    question: Question,
    qname: String,
    key: CacheKey,
    client: SocketAddr,
    client_name: Option<Arc<str>>,
    group_id: Option<Arc<str>>,
    protocol: &'static str,
    traced: bool,
    started: Instant,
    cache_lookup: Duration,
    upstream_exchange: Duration,
    upstream_name: Option<String>,
}

impl QueryContext<'_> {
    async fn run(&mut self, writer: &dyn ResponseWriter) {
        // 1. Local records.
        if !self.resolver.local_records.is_empty() {
            if let Some(records) = self
                .resolver
                .local_records
                .lookup(&self.qname, self.question.qtype)
            {
                if self.traced {
                    info!(qname = %self.qname, "trace: answered from local records");
                }
                let response = Message::answer_for(&self.query, records);
                self.send_message(&response, Outcome::Local, writer).await;
                return;
            }
        }

        // 2. Safe-search rewrite.
        let group_safe_search = self
            .group_id
            .as_deref()
            .and_then(|g| self.resolver.clients.group_safe_search(g));
        if let Some(target) = self
            .resolver
            .safe_search
            .rewrite(&self.qname, group_safe_search.as_ref())
        {
            if self.traced {
                info!(qname = %self.qname, target, "trace: safe-search rewrite");
            }
            match ResourceRecord::cname(&self.qname, SAFE_SEARCH_TTL, target) {
                Ok(cname) => {
                    let response = Message::answer_for(&self.query, vec![cname]);
                    self.send_message(&response, Outcome::SafeSearch, writer).await;
                    return;
                }
                Err(e) => debug!(error = %e, "safe-search CNAME build failed"),
            }
        }

        // 3. Blocklist.
        let decision = self
            .resolver
            .blocklist
            .decide(&self.qname, self.group_id.as_deref());
        if decision == BlockDecision::Block {
            if self.traced {
                info!(qname = %self.qname, "trace: blocked by policy");
            }
            self.answer_blocked(writer).await;
            return;
        }

        // 4. L0 lookup.
        let now = now_unix();
        let lookup_started = Instant::now();
        let (l0_entry, l0_kind) = self.resolver.cache.get(&self.key, now);
        self.cache_lookup = lookup_started.elapsed();

        let mut stale_fallback: Option<CacheEntry> = None;
        match (l0_entry, l0_kind) {
            (Some(entry), HitKind::Fresh) => {
                self.resolver.cache.counters.l0_hits.fetch_add(1, Ordering::Relaxed);
                self.resolver.metrics.cache_hits.with_label_values(&["l0"]).inc();
                self.serve_cached(entry, now, false, Outcome::Cached, writer).await;
                return;
            }
            (Some(entry), HitKind::Stale) if self.resolver.refresh.serve_stale => {
                self.resolver
                    .cache
                    .counters
                    .l0_stale_hits
                    .fetch_add(1, Ordering::Relaxed);
                self.resolver.metrics.cache_hits.with_label_values(&["l0"]).inc();
                self.resolver.metrics.stale_serves.inc();
                self.serve_cached(entry, now, true, Outcome::CachedStale, writer).await;
                return;
            }
            (Some(entry), HitKind::Stale) => {
                // Kept only as a fallback for the SERVFAIL/error paths.
                stale_fallback = Some(entry);
            }
            // Past hard expiry is never served; the next CleanExpired pass
            // collects it.
            _ => {}
        }

        // 5. SERVFAIL backoff check.
        if self.resolver.servfail.is_backoff(&self.key.redis_key()) {
            self.resolver.metrics.servfail_backoff_hits.inc();
            if self.traced {
                info!(qname = %self.qname, "trace: SERVFAIL backoff active");
            }
            let fallback = match stale_fallback.take() {
                Some(entry) => Some(entry),
                None => self.l1_lookup().await,
            };
            match fallback {
                // Any cached response at any usable freshness is served as
                // stale here, independent of the serve_stale toggle.
                Some(entry) => {
                    self.serve_stale_bytes(entry, Outcome::ServfailBackoff, writer).await;
                }
                None => {
                    let response = Message::servfail_for(&self.query);
                    self.send_message(&response, Outcome::ServfailBackoff, writer).await;
                }
            }
            return;
        }

        // 6. L1 lookup. Even when L0 held a non-servable entry, another
        // instance may have refreshed the key in L1.
        let lookup_started = Instant::now();
        if let Some((entry, kind)) = self.l1_lookup_classified(now).await {
            self.cache_lookup += lookup_started.elapsed();
            match kind {
                HitKind::Fresh => {
                    self.resolver.cache.counters.l1_hits.fetch_add(1, Ordering::Relaxed);
                    self.resolver.metrics.cache_hits.with_label_values(&["l1"]).inc();
                    self.resolver.cache.set(&self.key, entry.clone());
                    self.serve_cached(entry, now, false, Outcome::Cached, writer).await;
                    return;
                }
                HitKind::Stale if self.resolver.refresh.serve_stale => {
                    self.resolver
                        .cache
                        .counters
                        .l1_stale_hits
                        .fetch_add(1, Ordering::Relaxed);
                    self.resolver.metrics.cache_hits.with_label_values(&["l1"]).inc();
                    self.resolver.metrics.stale_serves.inc();
                    self.resolver.cache.set(&self.key, entry.clone());
                    self.serve_cached(entry, now, true, Outcome::CachedStale, writer).await;
                    return;
                }
                HitKind::Stale => {
                    stale_fallback = Some(entry);
                }
                // Past hard expiry is never served.
                HitKind::Expired | HitKind::Miss => {}
            }
        } else {
            self.cache_lookup += lookup_started.elapsed();
        }

        self.resolver.cache.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.resolver.metrics.cache_misses.inc();

        // 7. Upstream exchange.
        self.answer_from_upstream(stale_fallback, writer).await;
    }

    /// L1 read for the fallback paths. Entries past their hard expiry are
    /// never served, so they count as misses here too.
    async fn l1_lookup(&self) -> Option<CacheEntry> {
        self.l1_lookup_classified(now_unix())
            .await
            .filter(|(_, kind)| *kind != HitKind::Expired)
            .map(|(entry, _)| entry)
    }

    async fn l1_lookup_classified(&self, now: u64) -> Option<(CacheEntry, HitKind)> {
        match self.resolver.cache.get_with_ttl(&self.key).await {
            Ok(Some(entry)) => {
                let hard_expiry = self.resolver.cache.hard_expiry_of(&entry);
                let kind = crate::cache::classify(now, entry.soft_expiry, hard_expiry);
                Some((entry, kind))
            }
            Ok(None) => None,
            Err(e) => {
                // Never fatal: fall through to the next layer.
                self.resolver.cache.counters.l1_errors.fetch_add(1, Ordering::Relaxed);
                warn!(key = %self.key, error = %e, "L1 lookup failed, falling through");
                None
            }
        }
    }

    async fn answer_blocked(&mut self, writer: &dyn ResponseWriter) {
        let policy = self.resolver.response_policy.load();
        let qtype = self.question.qtype;

        let response = match policy.mode {
            BlockedMode::NxDomain => Message::nxdomain_for(&self.query),
            BlockedMode::Sink(addr) => match (qtype, addr) {
                (RecordType::A, IpAddr::V4(v4)) => Message::answer_for(
                    &self.query,
                    vec![ResourceRecord::a(&self.qname, policy.ttl, v4)],
                ),
                (RecordType::AAAA, IpAddr::V6(v6)) => Message::answer_for(
                    &self.query,
                    vec![ResourceRecord::aaaa(&self.qname, policy.ttl, v6)],
                ),
                // Address family mismatch (and non-address types): NODATA.
                _ => Message::nodata_for(&self.query),
            },
        };

        self.resolver.metrics.blocked_queries.inc();
        self.send_message(&response, Outcome::Blocked, writer).await;
    }

    /// Serve a cached entry: copy the shared buffer, patch ID + question,
    /// override TTLs on stale serves, then dispatch hit accounting and
    /// refresh-ahead in the background.
    async fn serve_cached(
        &mut self,
        entry: CacheEntry,
        now: u64,
        stale: bool,
        outcome: Outcome,
        writer: &dyn ResponseWriter,
    ) {
        let mut response = entry.msg.to_vec();
        if wire::patch_reply(&mut response, self.query_bytes).is_err() {
            // Corrupt entry; drop it and resolve upstream instead.
            warn!(key = %self.key, "cached entry mismatched question, evicting");
            let _ = self.resolver.cache.delete_cache_key(&self.key).await;
            self.answer_from_upstream(None, writer).await;
            return;
        }
        if stale {
            let _ = wire::rewrite_ttls(&mut response, self.resolver.refresh.stale_ttl);
        }

        self.send_bytes(&response, outcome, writer).await;

        // Post-write side effects: hit counters and refresh-ahead.
        let resolver = self.resolver.clone();
        let key = self.key.clone();
        let soft_expiry = entry.soft_expiry;
        tokio::spawn(async move {
            let hits = resolver.cache.increment_hit(&key, now);
            resolver.cache.increment_sweep_hit(&key, now);

            let hot = hits >= resolver.refresh.hot_threshold;
            let threshold = if hot {
                resolver.refresh.hot_ttl
            } else {
                resolver.refresh.min_ttl
            };
            let remaining = soft_expiry.saturating_sub(now);
            if remaining <= threshold {
                resolver.schedule_refresh(key);
            }
        });
    }

    /// Stale serve outside the normal hit path (SERVFAIL backoff, upstream
    /// failure): short TTL override, no refresh scheduling.
    async fn serve_stale_bytes(
        &mut self,
        entry: CacheEntry,
        outcome: Outcome,
        writer: &dyn ResponseWriter,
    ) {
        let mut response = entry.msg.to_vec();
        if wire::patch_reply(&mut response, self.query_bytes).is_err() {
            let message = Message::servfail_for(&self.query);
            self.send_message(&message, outcome, writer).await;
            return;
        }
        let _ = wire::rewrite_ttls(&mut response, self.resolver.ttl_policy.expired_entry_ttl);
        self.resolver.metrics.stale_serves.inc();
        self.send_bytes(&response, outcome, writer).await;
    }

    async fn answer_from_upstream(
        &mut self,
        stale_fallback: Option<CacheEntry>,
        writer: &dyn ResponseWriter,
    ) {
        let mut upstream_query = self.query_bytes.to_vec();
        wire::set_id(&mut upstream_query, UPSTREAM_ID.fetch_add(1, Ordering::Relaxed));

        let exchange_started = Instant::now();
        let result = self.resolver.upstreams.exchange(&upstream_query).await;
        self.upstream_exchange = exchange_started.elapsed();

        match result {
            Ok(exchange) if !exchange.servfail => {
                self.upstream_name = Some(exchange.upstream.clone());
                let ttl = self.resolver.ttl_policy.cache_ttl(&exchange.response);
                let mut response = exchange.response;
                let _ = wire::rewrite_ttls(&mut response, ttl as u32);
                if wire::patch_reply(&mut response, self.query_bytes).is_err() {
                    let message = Message::servfail_for(&self.query);
                    self.send_message(&message, Outcome::UpstreamError, writer).await;
                    return;
                }

                self.send_bytes(&response, Outcome::Upstream, writer).await;

                // 8. Cache write after the client has its answer.
                let resolver = self.resolver.clone();
                let key = self.key.clone();
                tokio::spawn(async move {
                    resolver.store_response(&key, &response, ttl).await;
                });
            }
            Ok(exchange) => {
                self.upstream_name = Some(exchange.upstream.clone());
                let record = self.resolver.servfail.record_backoff(&self.key.redis_key());
                if record.should_log {
                    warn!(
                        key = %self.key,
                        upstream = %exchange.upstream,
                        fail_count = record.fail_count,
                        "upstream answered SERVFAIL, backing off"
                    );
                }
                self.answer_degraded(stale_fallback, Outcome::UpstreamServfail, writer)
                    .await;
            }
            Err(e) => {
                let record = self.resolver.servfail.record_backoff(&self.key.redis_key());
                if record.should_log {
                    warn!(key = %self.key, error = %e, "all upstreams failed, backing off");
                }
                self.resolver
                    .metrics
                    .upstream_failures
                    .with_label_values(&["all"])
                    .inc();
                self.answer_degraded(stale_fallback, Outcome::UpstreamError, writer).await;
            }
        }
    }

    /// Upstream failed or answered SERVFAIL: stale if we can, SERVFAIL
    /// otherwise.
    async fn answer_degraded(
        &mut self,
        stale_fallback: Option<CacheEntry>,
        outcome: Outcome,
        writer: &dyn ResponseWriter,
    ) {
        let fallback = match stale_fallback {
            Some(entry) => Some(entry),
            None if self.resolver.refresh.serve_stale => self.l1_lookup().await,
            None => None,
        };

        match fallback {
            Some(entry) if self.resolver.refresh.serve_stale => {
                self.serve_stale_bytes(entry, outcome, writer).await;
            }
            _ => {
                let response = Message::servfail_for(&self.query);
                self.send_message(&response, outcome, writer).await;
            }
        }
    }

    async fn send_message(
        &mut self,
        response: &Message,
        outcome: Outcome,
        writer: &dyn ResponseWriter,
    ) {
        match response.serialize() {
            Ok(bytes) => self.send_bytes(&bytes, outcome, writer).await,
            Err(e) => {
                warn!(qname = %self.qname, error = %e, "response serialization failed");
            }
        }
    }

    async fn send_bytes(&mut self, response: &[u8], outcome: Outcome, writer: &dyn ResponseWriter) {
        let write_started = Instant::now();
        if let Err(e) = writer.write(response).await {
            debug!(client = %self.client, error = %e, "client write failed");
        }
        let network_write = write_started.elapsed();
        // Sampled before async side effects so the recorded latency is what
        // the client saw.
        let total = self.started.elapsed();

        let rcode = Rcode::from_u8(wire::rcode(response)).as_str();
        let event = QueryEvent {
            timestamp: now_unix(),
            qname: self.qname.clone(),
            qtype: self.question.qtype.into(),
            client: self.client.ip(),
            client_name: self.client_name.clone(),
            protocol: self.protocol,
            outcome,
            rcode,
            upstream: self.upstream_name.clone(),
            cache_lookup: self.cache_lookup,
            upstream_exchange: self.upstream_exchange,
            network_write,
            total,
        };

        if self.traced {
            info!(
                qname = %self.qname,
                outcome = outcome.as_str(),
                rcode,
                total_us = total.as_micros() as u64,
                "trace: query finished"
            );
        }

        self.resolver
            .metrics
            .queries_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.resolver.metrics.query_duration.observe(total.as_secs_f64());

        match outcome {
            Outcome::Blocked => self.resolver.webhook.fire_on_block(&event),
            Outcome::UpstreamError => self.resolver.webhook.fire_on_error(&event),
            _ => {}
        }
        self.resolver.sink.record(event);
    }
}
