pub mod hits;
pub mod redis_backend;
pub mod sieve;

pub use hits::{HitCounters, HitDelta};
pub use redis_backend::{RedisStore, SweepProbe};
pub use sieve::{SieveCache, SieveStats};

use crate::dns::Question;
use crate::error::Result;
use bytes::Bytes;
use rustc_hash::FxHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Canonical cache identity: lowercased name, numeric type and class.
/// The wire form `dns:<name>:<type>:<class>` is shared with the L1 store
/// and must stay bit-exact across implementations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub name: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl CacheKey {
    pub fn new(name: &str, qtype: u16, qclass: u16) -> Self {
        let mut name = name.trim_end_matches('.').to_string();
        name.make_ascii_lowercase();
        Self {
            name,
            qtype,
            qclass,
        }
    }

    pub fn from_question(question: &Question) -> Self {
        Self {
            name: question.name(),
            qtype: question.qtype.into(),
            qclass: question.qclass.into(),
        }
    }

    pub fn redis_key(&self) -> String {
        format!("dns:{}:{}:{}", self.name, self.qtype, self.qclass)
    }

    /// Parse the wire form back into a key (used by the sweeper, which reads
    /// members out of the expiry index).
    pub fn from_redis_key(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix("dns:")?;
        let (name_and_type, qclass) = rest.rsplit_once(':')?;
        let (name, qtype) = name_and_type.rsplit_once(':')?;
        Some(Self {
            name: name.to_string(),
            qtype: qtype.parse().ok()?,
            qclass: qclass.parse().ok()?,
        })
    }

    pub fn shard_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.name.hash(&mut hasher);
        self.qtype.hash(&mut hasher);
        self.qclass.hash(&mut hasher);
        hasher.finish()
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dns:{}:{}:{}", self.name, self.qtype, self.qclass)
    }
}

/// A cached wire-format response. `msg` is shared; serving code copies it
/// before patching the ID and question section.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub msg: Bytes,
    pub soft_expiry: u64,
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitKind {
    Fresh,
    Stale,
    Expired,
    Miss,
}

pub fn classify(now: u64, soft_expiry: u64, hard_expiry: u64) -> HitKind {
    if now <= soft_expiry {
        HitKind::Fresh
    } else if now <= hard_expiry {
        HitKind::Stale
    } else {
        HitKind::Expired
    }
}

#[derive(Debug, Default)]
pub struct CacheCounters {
    pub l0_hits: AtomicU64,
    pub l0_stale_hits: AtomicU64,
    pub l1_hits: AtomicU64,
    pub l1_stale_hits: AtomicU64,
    pub misses: AtomicU64,
    pub l1_errors: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct CacheStatsSnapshot {
    pub l0: SieveStats,
    pub l0_hits: u64,
    pub l0_stale_hits: u64,
    pub l1_hits: u64,
    pub l1_stale_hits: u64,
    pub misses: u64,
    pub l1_errors: u64,
    pub l1_keys: Option<u64>,
}

/// The two-tier cache composite: in-process SIEVE L0 in front of the
/// Redis-backed L1, plus the sharded hit counters. Either tier may be
/// disabled (`lru_size = 0`, no Redis address); the pipeline falls through
/// whatever is missing.
pub struct DnsCache {
    l0: Option<SieveCache>,
    l1: Option<Arc<RedisStore>>,
    hits: HitCounters,
    grace_cap: u64,
    pub counters: CacheCounters,
}

impl DnsCache {
    pub fn new(
        l0: Option<SieveCache>,
        l1: Option<Arc<RedisStore>>,
        hits: HitCounters,
        grace_cap: Duration,
    ) -> Self {
        Self {
            l0,
            l1,
            hits,
            grace_cap: grace_cap.as_secs(),
            counters: CacheCounters::default(),
        }
    }

    pub fn l1(&self) -> Option<&Arc<RedisStore>> {
        self.l1.as_ref()
    }

    pub fn has_l0(&self) -> bool {
        self.l0.is_some()
    }

    /// `grace = min(ttl, lru_grace_period)`.
    pub fn grace_for(&self, ttl: u64) -> u64 {
        ttl.min(self.grace_cap)
    }

    pub fn hard_expiry_of(&self, entry: &CacheEntry) -> u64 {
        let ttl = entry.soft_expiry.saturating_sub(entry.created_at);
        entry.soft_expiry + self.grace_for(ttl)
    }

    // --- L0 ---

    pub fn get(&self, key: &CacheKey, now: u64) -> (Option<CacheEntry>, HitKind) {
        match &self.l0 {
            Some(l0) => l0.get(key, now),
            None => (None, HitKind::Miss),
        }
    }

    pub fn set(&self, key: &CacheKey, entry: CacheEntry) {
        if let Some(l0) = &self.l0 {
            let hard_expiry = self.hard_expiry_of(&entry);
            l0.insert(key.clone(), entry, hard_expiry);
        }
    }

    pub fn remove_local(&self, key: &CacheKey) {
        if let Some(l0) = &self.l0 {
            l0.remove(key);
        }
    }

    pub fn clean_lru_cache(&self, now: u64) -> usize {
        self.l0.as_ref().map_or(0, |l0| l0.clean_expired(now))
    }

    // --- L1 ---

    pub async fn get_with_ttl(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
        match &self.l1 {
            Some(l1) => Ok(l1.get_with_ttl(key).await?.map(|(entry, _ttl)| entry)),
            None => Ok(None),
        }
    }

    pub async fn set_with_index(&self, key: &CacheKey, msg: &[u8], soft_ttl: u64) -> Result<()> {
        if let Some(l1) = &self.l1 {
            let grace = self.grace_for(soft_ttl);
            l1.set_with_index(key, msg, soft_ttl, grace).await?;
        }
        Ok(())
    }

    pub async fn try_acquire_refresh(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        match &self.l1 {
            Some(l1) => l1.try_acquire_refresh(key, ttl).await,
            // Without L1 the in-process semaphore is the only guard.
            None => Ok(true),
        }
    }

    pub async fn release_refresh(&self, key: &CacheKey) -> Result<()> {
        match &self.l1 {
            Some(l1) => l1.release_refresh(key).await,
            None => Ok(()),
        }
    }

    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        if let Some(l0) = &self.l0 {
            if !matches!(l0.get(key, now_unix()).1, HitKind::Miss) {
                return Ok(true);
            }
        }
        match &self.l1 {
            Some(l1) => l1.exists(key).await,
            None => Ok(false),
        }
    }

    pub async fn expiry_candidates(&self, until: u64, limit: usize) -> Result<Vec<String>> {
        match &self.l1 {
            Some(l1) => l1.expiry_candidates(until, limit).await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn remove_from_index(&self, redis_key: &str) -> Result<()> {
        match &self.l1 {
            Some(l1) => l1.remove_from_index(redis_key).await,
            None => Ok(()),
        }
    }

    pub async fn delete_cache_key(&self, key: &CacheKey) -> Result<()> {
        self.remove_local(key);
        match &self.l1 {
            Some(l1) => l1.delete_cache_key(key).await,
            None => Ok(()),
        }
    }

    pub async fn clear_cache(&self) -> Result<()> {
        if let Some(l0) = &self.l0 {
            l0.clear();
        }
        self.hits.clear();
        match &self.l1 {
            Some(l1) => l1.clear_cache().await,
            None => Ok(()),
        }
    }

    // --- hit counters ---

    /// Bump the short-window counter and, when sampling allows, enqueue a
    /// shared-counter delta for the flusher. Returns the local count.
    pub fn increment_hit(&self, key: &CacheKey, now: u64) -> u64 {
        self.hits.increment_hit(key, now)
    }

    pub fn get_hit_count(&self, key: &CacheKey, now: u64) -> u64 {
        self.hits.get_hit_count(key, now)
    }

    pub fn increment_sweep_hit(&self, key: &CacheKey, now: u64) -> u64 {
        self.hits.increment_sweep_hit(key, now)
    }

    pub fn get_sweep_hit_count(&self, key: &CacheKey, now: u64) -> u64 {
        self.hits.get_sweep_hit_count(key, now)
    }

    pub fn hit_counters(&self) -> &HitCounters {
        &self.hits
    }

    pub async fn cache_stats(&self, now: u64) -> CacheStatsSnapshot {
        let l1_keys = match &self.l1 {
            Some(l1) => l1.count_keys_by_prefix().await.ok(),
            None => None,
        };
        CacheStatsSnapshot {
            l0: self
                .l0
                .as_ref()
                .map(|l0| l0.stats(now))
                .unwrap_or_default(),
            l0_hits: self.counters.l0_hits.load(Ordering::Relaxed),
            l0_stale_hits: self.counters.l0_stale_hits.load(Ordering::Relaxed),
            l1_hits: self.counters.l1_hits.load(Ordering::Relaxed),
            l1_stale_hits: self.counters.l1_stale_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            l1_errors: self.counters.l1_errors.load(Ordering::Relaxed),
            l1_keys,
        }
    }
}
