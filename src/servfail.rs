//! Per-cache-key SERVFAIL backoff tracking.
//!
//! A key that keeps failing upstream is answered from stale cache (or with a
//! synthesized SERVFAIL) without contacting upstreams until its backoff
//! lapses. The map is bounded; overflowing evicts the entries closest to
//! expiry. Log emission is rate-limited per key.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    until: Instant,
    fail_count: u32,
    last_log_at: Option<Instant>,
}

pub struct ServfailTracker {
    entries: Mutex<HashMap<String, Entry>>,
    backoff: Duration,
    log_interval: Duration,
    refresh_threshold: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffRecord {
    pub fail_count: u32,
    /// False when the per-key log interval has not lapsed yet.
    pub should_log: bool,
}

impl ServfailTracker {
    pub fn new(backoff: Duration, log_interval: Duration, refresh_threshold: u32) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            backoff,
            log_interval,
            refresh_threshold,
        }
    }

    pub fn record_backoff(&self, key: &str) -> BackoffRecord {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if entries.len() >= MAX_ENTRIES && !entries.contains_key(key) {
            Self::evict_nearest_expiring(&mut entries);
        }

        let entry = entries.entry(key.to_string()).or_insert(Entry {
            until: now,
            fail_count: 0,
            last_log_at: None,
        });
        entry.fail_count = entry.fail_count.saturating_add(1);
        entry.until = now + self.backoff;

        let should_log = entry
            .last_log_at
            .is_none_or(|last| now.duration_since(last) >= self.log_interval);
        if should_log {
            entry.last_log_at = Some(now);
        }

        BackoffRecord {
            fail_count: entry.fail_count,
            should_log,
        }
    }

    fn evict_nearest_expiring(entries: &mut HashMap<String, Entry>) {
        // Evict in small batches so a full map doesn't scan on every insert.
        let batch = (MAX_ENTRIES / 100).max(1);
        let mut soonest: Vec<(String, Instant)> = entries
            .iter()
            .map(|(k, e)| (k.clone(), e.until))
            .collect();
        soonest.sort_by_key(|(_, until)| *until);
        for (key, _) in soonest.into_iter().take(batch) {
            entries.remove(&key);
        }
    }

    pub fn is_backoff(&self, key: &str) -> bool {
        let entries = self.entries.lock();
        entries
            .get(key)
            .is_some_and(|entry| entry.until > Instant::now())
    }

    pub fn fail_count(&self, key: &str) -> u32 {
        self.entries.lock().get(key).map_or(0, |e| e.fail_count)
    }

    /// Refresh scheduling is suppressed once a key has failed often enough;
    /// the sweeper's cold-deletion path eventually retires the entry.
    pub fn refresh_suppressed(&self, key: &str) -> bool {
        self.fail_count(key) >= self.refresh_threshold
    }

    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| entry.until >= now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
