//! Sharded in-process hit counters with async flush to the shared store.
//!
//! Two rolling windows per key: a short one for hot-key detection and a
//! longer one for sweep decisions. Local counts are authoritative for this
//! instance and returned synchronously; sampled deltas are queued on a
//! non-blocking channel and batched to L1 so other instances can see an
//! approximate cross-instance count.

use super::{CacheKey, redis_backend::RedisStore};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const FLUSH_INTERVAL: Duration = Duration::from_millis(50);
const FLUSH_CHANNEL_CAPACITY: usize = 8192;

#[derive(Debug, Clone)]
pub struct HitDelta {
    pub redis_key: String,
    pub sweep: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct Window {
    count: u64,
    start: u64,
}

impl Window {
    fn roll(&mut self, now: u64, size: u64) {
        if now.saturating_sub(self.start) >= size {
            self.count = 0;
            self.start = now;
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Windows {
    hit: Window,
    sweep: Window,
}

pub struct HitCounters {
    shards: Vec<Mutex<FxHashMap<CacheKey, Windows>>>,
    shard_mask: u64,
    hit_window: u64,
    sweep_window: u64,
    sample_rate: f64,
    tx: mpsc::Sender<HitDelta>,
    rx: Mutex<Option<mpsc::Receiver<HitDelta>>>,
    pub dropped_deltas: AtomicU64,
}

impl HitCounters {
    /// `shards` should match the L0 shard count so key distribution lines up.
    pub fn new(shards: usize, hit_window: Duration, sweep_window: Duration, sample_rate: f64) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let (tx, rx) = mpsc::channel(FLUSH_CHANNEL_CAPACITY);
        Self {
            shards: (0..shard_count)
                .map(|_| Mutex::new(FxHashMap::default()))
                .collect(),
            shard_mask: shard_count as u64 - 1,
            hit_window: hit_window.as_secs().max(1),
            sweep_window: sweep_window.as_secs().max(1),
            sample_rate,
            tx,
            rx: Mutex::new(Some(rx)),
            dropped_deltas: AtomicU64::new(0),
        }
    }

    /// Hand the flush receiver to the batcher task. Yields `Some` exactly
    /// once.
    pub fn take_flush_receiver(&self) -> Option<mpsc::Receiver<HitDelta>> {
        self.rx.lock().take()
    }

    fn shard(&self, key: &CacheKey) -> &Mutex<FxHashMap<CacheKey, Windows>> {
        &self.shards[(key.shard_hash() & self.shard_mask) as usize]
    }

    fn enqueue_delta(&self, key: &CacheKey, sweep: bool) {
        if self.sample_rate < 1.0 && rand::random::<f64>() >= self.sample_rate {
            return;
        }
        let delta = HitDelta {
            redis_key: key.redis_key(),
            sweep,
        };
        if self.tx.try_send(delta).is_err() {
            self.dropped_deltas.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn increment_hit(&self, key: &CacheKey, now: u64) -> u64 {
        let count = {
            let mut shard = self.shard(key).lock();
            let windows = shard.entry(key.clone()).or_default();
            windows.hit.roll(now, self.hit_window);
            if windows.hit.count == 0 {
                windows.hit.start = now;
            }
            windows.hit.count += 1;
            windows.hit.count
        };
        self.enqueue_delta(key, false);
        count
    }

    pub fn get_hit_count(&self, key: &CacheKey, now: u64) -> u64 {
        let shard = self.shard(key).lock();
        match shard.get(key) {
            Some(windows) if now.saturating_sub(windows.hit.start) < self.hit_window => {
                windows.hit.count
            }
            _ => 0,
        }
    }

    pub fn increment_sweep_hit(&self, key: &CacheKey, now: u64) -> u64 {
        let count = {
            let mut shard = self.shard(key).lock();
            let windows = shard.entry(key.clone()).or_default();
            windows.sweep.roll(now, self.sweep_window);
            if windows.sweep.count == 0 {
                windows.sweep.start = now;
            }
            windows.sweep.count += 1;
            windows.sweep.count
        };
        self.enqueue_delta(key, true);
        count
    }

    pub fn get_sweep_hit_count(&self, key: &CacheKey, now: u64) -> u64 {
        let shard = self.shard(key).lock();
        match shard.get(key) {
            Some(windows) if now.saturating_sub(windows.sweep.start) < self.sweep_window => {
                windows.sweep.count
            }
            _ => 0,
        }
    }

    /// Drop entries whose windows have all lapsed; called from the sweeper
    /// to bound memory.
    pub fn prune(&self, now: u64) -> usize {
        let mut removed = 0;
        for lock in &self.shards {
            let mut shard = lock.lock();
            let before = shard.len();
            shard.retain(|_, windows| {
                now.saturating_sub(windows.hit.start) < self.hit_window
                    || now.saturating_sub(windows.sweep.start) < self.sweep_window
            });
            removed += before - shard.len();
        }
        removed
    }

    pub fn clear(&self) {
        for lock in &self.shards {
            lock.lock().clear();
        }
    }
}

/// Batcher: drains the delta channel on a coarse cadence and flushes
/// aggregated `INCRBY` + `EXPIRE` pipelines to L1.
pub async fn run_flusher(
    mut rx: mpsc::Receiver<HitDelta>,
    store: Arc<RedisStore>,
    hit_window: Duration,
    sweep_window: Duration,
) {
    let mut ticker = tokio::time::interval(FLUSH_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let mut pending: HashMap<String, (u64, u64)> = HashMap::new();
        loop {
            match rx.try_recv() {
                Ok(delta) => {
                    let slot = pending.entry(delta.redis_key).or_default();
                    if delta.sweep {
                        slot.1 += 1;
                    } else {
                        slot.0 += 1;
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    if !pending.is_empty() {
                        let _ = store
                            .flush_hit_deltas(&pending, hit_window, sweep_window)
                            .await;
                    }
                    debug!("hit-counter flusher shutting down");
                    return;
                }
            }
        }

        if pending.is_empty() {
            continue;
        }
        if let Err(e) = store
            .flush_hit_deltas(&pending, hit_window, sweep_window)
            .await
        {
            warn!("hit-counter flush failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counters() -> HitCounters {
        HitCounters::new(4, Duration::from_secs(300), Duration::from_secs(86400), 1.0)
    }

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, 1, 1)
    }

    #[test]
    fn increments_return_running_count() {
        let hits = counters();
        let k = key("example.com");
        assert_eq!(hits.increment_hit(&k, 1000), 1);
        assert_eq!(hits.increment_hit(&k, 1001), 2);
        assert_eq!(hits.get_hit_count(&k, 1002), 2);
        assert_eq!(hits.get_hit_count(&key("other.com"), 1002), 0);
    }

    #[test]
    fn window_rolls_forward_and_zeroes() {
        let hits = counters();
        let k = key("example.com");
        hits.increment_hit(&k, 1000);
        hits.increment_hit(&k, 1000);

        // Window lapsed: the count restarts at 1.
        assert_eq!(hits.increment_hit(&k, 1300), 1);
        assert_eq!(hits.get_hit_count(&k, 1301), 1);
    }

    #[test]
    fn hit_and_sweep_windows_are_independent() {
        let hits = counters();
        let k = key("example.com");
        hits.increment_hit(&k, 1000);
        hits.increment_sweep_hit(&k, 1000);
        hits.increment_sweep_hit(&k, 1000);

        // Hit window (300s) lapses; sweep window (24h) keeps counting.
        assert_eq!(hits.get_hit_count(&k, 2000), 0);
        assert_eq!(hits.get_sweep_hit_count(&k, 2000), 2);
    }

    #[test]
    fn prune_drops_lapsed_entries() {
        let hits = HitCounters::new(4, Duration::from_secs(10), Duration::from_secs(10), 1.0);
        hits.increment_hit(&key("a.example"), 1000);
        hits.increment_hit(&key("b.example"), 1500);

        assert_eq!(hits.prune(1505), 1);
        assert_eq!(hits.get_hit_count(&key("b.example"), 1505), 1);
    }
}
