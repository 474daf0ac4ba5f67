//! Periodic sweep over the expiry index: refreshes keys that are still
//! earning hits, deletes cold ones, and keeps the index honest.

use crate::cache::{CacheKey, DnsCache, SweepProbe, now_unix};
use crate::config::RefreshConfig;
use crate::metrics::Metrics;
use crate::resolver::Resolver;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(3600);
const RECONCILE_SAMPLE: usize = 1000;
const CANDIDATE_COUNT_INTERVAL: Duration = Duration::from_secs(300);
const CANDIDATE_COUNT_CAP: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepAction {
    /// The cache key is gone; drop the index member.
    RemoveFromIndex,
    /// Cold: old enough to have earned hits and didn't.
    DeleteCold,
    Refresh,
}

/// Deletion policy for one candidate. An entry below the hit floor is only
/// deleted once it has been around for a full hit window (or its creation
/// time is unknown); younger entries get refreshed instead.
pub fn classify_candidate(
    probe: &SweepProbe,
    now: u64,
    sweep_min_hits: u64,
    sweep_hit_window: u64,
) -> SweepAction {
    if !probe.exists {
        return SweepAction::RemoveFromIndex;
    }
    if probe.sweep_hits < sweep_min_hits {
        return match probe.created_at {
            Some(created_at) if now.saturating_sub(created_at) < sweep_hit_window => {
                SweepAction::Refresh
            }
            _ => SweepAction::DeleteCold,
        };
    }
    SweepAction::Refresh
}

/// Hour-bucketed rolling counter covering the last 24 hours.
#[derive(Debug, Default)]
struct RollingDay {
    buckets: Mutex<[(u64, u64); 24]>,
}

impl RollingDay {
    fn add(&self, count: u64, now: u64) {
        let hour = now / 3600;
        let mut buckets = self.buckets.lock();
        let slot = &mut buckets[(hour % 24) as usize];
        if slot.0 != hour {
            *slot = (hour, 0);
        }
        slot.1 += count;
    }

    fn total(&self, now: u64) -> u64 {
        let hour = now / 3600;
        self.buckets
            .lock()
            .iter()
            .filter(|(h, _)| hour.saturating_sub(*h) < 24)
            .map(|(_, count)| count)
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweeperStats {
    pub last_sweep_count: u64,
    pub last_sweep_removed_count: u64,
    pub refreshed_24h: u64,
    pub removed_24h: u64,
    pub deletion_candidates: u64,
}

pub struct Sweeper {
    resolver: Arc<Resolver>,
    cache: Arc<DnsCache>,
    metrics: Arc<Metrics>,
    interval: Duration,
    window: u64,
    max_batch: usize,
    min_hits: u64,
    hit_window: u64,
    last_sweep_count: AtomicU64,
    last_sweep_removed: AtomicU64,
    refreshed_24h: RollingDay,
    removed_24h: RollingDay,
    deletion_candidates: AtomicU64,
}

impl Sweeper {
    pub fn new(
        resolver: Arc<Resolver>,
        cache: Arc<DnsCache>,
        metrics: Arc<Metrics>,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            resolver,
            cache,
            metrics,
            interval: config.sweep_interval,
            window: config.sweep_window.as_secs(),
            max_batch: config.max_batch_size,
            min_hits: config.sweep_min_hits,
            hit_window: config.sweep_hit_window.as_secs(),
            last_sweep_count: AtomicU64::new(0),
            last_sweep_removed: AtomicU64::new(0),
            refreshed_24h: RollingDay::default(),
            removed_24h: RollingDay::default(),
            deletion_candidates: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> SweeperStats {
        let now = now_unix();
        SweeperStats {
            last_sweep_count: self.last_sweep_count.load(Ordering::Relaxed),
            last_sweep_removed_count: self.last_sweep_removed.load(Ordering::Relaxed),
            refreshed_24h: self.refreshed_24h.total(now),
            removed_24h: self.removed_24h.total(now),
            deletion_candidates: self.deletion_candidates.load(Ordering::Relaxed),
        }
    }

    /// Sweep forever. Per-instance jitter keeps replicas from hammering the
    /// index in lockstep.
    pub async fn run(self: Arc<Self>) {
        let jitter = Duration::from_millis(
            rand::rng().random_range(0..self.interval.as_millis().max(1) as u64 / 10 + 1),
        );
        tokio::time::sleep(jitter).await;

        let mut last_reconcile = Instant::now();
        let mut last_count = Instant::now()
            .checked_sub(CANDIDATE_COUNT_INTERVAL)
            .unwrap_or_else(Instant::now);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let now = now_unix();

            self.sweep_once(now).await;

            // Local housekeeping rides along with every sweep.
            let cleaned = self.cache.clean_lru_cache(now);
            if cleaned > 0 {
                debug!(cleaned, "dropped hard-expired L0 entries");
            }
            self.cache.hit_counters().prune(now);
            self.resolver.servfail_tracker().prune_expired();
            self.metrics
                .l0_entries
                .set(self.cache.cache_stats(now).await.l0.entries as i64);

            if last_reconcile.elapsed() >= RECONCILE_INTERVAL {
                last_reconcile = Instant::now();
                if let Some(l1) = self.cache.l1() {
                    match l1.reconcile_expiry_index(RECONCILE_SAMPLE).await {
                        Ok(removed) if removed > 0 => {
                            info!(removed, "expiry index reconciled");
                        }
                        Ok(_) => {}
                        Err(e) => warn!("expiry index reconcile failed: {}", e),
                    }
                }
            }

            if last_count.elapsed() >= CANDIDATE_COUNT_INTERVAL {
                last_count = Instant::now();
                if let Some(l1) = self.cache.l1() {
                    if let Ok(count) = l1.expiry_candidate_count(now + self.window).await {
                        let capped = count.min(CANDIDATE_COUNT_CAP);
                        self.deletion_candidates.store(capped, Ordering::Relaxed);
                        self.metrics.sweep_deletion_candidates.set(capped as i64);
                    }
                }
            }
        }
    }

    async fn sweep_once(&self, now: u64) {
        let Some(l1) = self.cache.l1() else {
            return;
        };

        // The index is scored by soft_expiry, so the batch comes back
        // soonest-expiring first; keys within seconds of going stale are
        // handled before the rest of the window.
        let members = match l1.expiry_candidates(now + self.window, self.max_batch).await {
            Ok(members) => members,
            Err(e) => {
                warn!("sweep candidate fetch failed: {}", e);
                return;
            }
        };
        self.last_sweep_count.store(members.len() as u64, Ordering::Relaxed);
        self.metrics.sweep_last_count.set(members.len() as i64);
        if members.is_empty() {
            self.last_sweep_removed.store(0, Ordering::Relaxed);
            self.metrics.sweep_last_removed.set(0);
            return;
        }

        let probes = match l1.sweep_probe(&members).await {
            Ok(probes) => probes,
            Err(e) => {
                warn!("sweep probe failed: {}", e);
                return;
            }
        };

        let mut removed = 0u64;
        let mut refreshed = 0u64;
        for (member, mut probe) in members.iter().zip(probes) {
            let Some(key) = CacheKey::from_redis_key(member) else {
                // Foreign member in the index; drop it.
                let _ = l1.remove_from_index(member).await;
                removed += 1;
                continue;
            };

            // Flush sampling means the shared counter can lag the local one.
            probe.sweep_hits = probe
                .sweep_hits
                .max(self.cache.get_sweep_hit_count(&key, now));

            match classify_candidate(&probe, now, self.min_hits, self.hit_window) {
                SweepAction::RemoveFromIndex => {
                    if let Err(e) = l1.remove_from_index(member).await {
                        debug!(member, error = %e, "index removal failed");
                    } else {
                        removed += 1;
                    }
                }
                SweepAction::DeleteCold => {
                    if let Err(e) = self.cache.delete_cache_key(&key).await {
                        debug!(member, error = %e, "cold deletion failed");
                    } else {
                        removed += 1;
                    }
                }
                SweepAction::Refresh => {
                    self.resolver.schedule_refresh(key);
                    refreshed += 1;
                }
            }
        }

        self.last_sweep_removed.store(removed, Ordering::Relaxed);
        self.metrics.sweep_last_removed.set(removed as i64);
        self.refreshed_24h.add(refreshed, now);
        self.removed_24h.add(removed, now);
        debug!(
            candidates = members.len(),
            refreshed, removed, "sweep complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: u64 = 48 * 3600;

    fn probe(exists: bool, sweep_hits: u64, created_at: Option<u64>) -> SweepProbe {
        SweepProbe {
            exists,
            sweep_hits,
            created_at,
        }
    }

    #[test]
    fn missing_key_leaves_the_index() {
        assert_eq!(
            classify_candidate(&probe(false, 5, None), 1_000_000, 1, WINDOW),
            SweepAction::RemoveFromIndex
        );
    }

    #[test]
    fn cold_aged_entry_is_deleted() {
        let now = 1_000_000;
        let created = now - WINDOW - 10;
        assert_eq!(
            classify_candidate(&probe(true, 0, Some(created)), now, 1, WINDOW),
            SweepAction::DeleteCold
        );
    }

    #[test]
    fn young_quiet_entry_is_refreshed_not_deleted() {
        let now = 1_000_000;
        let created = now - 10;
        assert_eq!(
            classify_candidate(&probe(true, 0, Some(created)), now, 1, WINDOW),
            SweepAction::Refresh
        );
    }

    #[test]
    fn unknown_created_at_counts_as_aged() {
        assert_eq!(
            classify_candidate(&probe(true, 0, None), 1_000_000, 1, WINDOW),
            SweepAction::DeleteCold
        );
    }

    #[test]
    fn warm_entry_is_refreshed() {
        assert_eq!(
            classify_candidate(&probe(true, 3, Some(0)), 1_000_000, 1, WINDOW),
            SweepAction::Refresh
        );
    }

    #[test]
    fn rolling_day_expires_old_buckets() {
        let day = RollingDay::default();
        let now = 100 * 3600;
        day.add(5, now);
        day.add(7, now + 3600);
        assert_eq!(day.total(now + 3600), 12);
        // A day later the first buckets have aged out.
        assert_eq!(day.total(now + 25 * 3600), 0);
    }
}
