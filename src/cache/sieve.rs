//! Sharded in-process response cache (L0) with SIEVE eviction.
//!
//! SIEVE keeps the hot path read-only: a hit only sets an atomic visited
//! bit under the shard's shared lock, never reorders the list. Eviction
//! scans a persistent hand from the tail toward the head, giving visited
//! entries a second chance.

use super::{CacheEntry, CacheKey, HitKind, classify};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

const NIL: usize = usize::MAX;

struct Node {
    key: CacheKey,
    entry: CacheEntry,
    hard_expiry: u64,
    visited: AtomicBool,
    prev: usize,
    next: usize,
}

struct Shard {
    map: FxHashMap<CacheKey, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
    /// SIEVE hand; persists across evictions.
    hand: usize,
}

impl Shard {
    fn new() -> Self {
        Self {
            map: FxHashMap::default(),
            nodes: Vec::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
            hand: NIL,
        }
    }

    fn alloc(&mut self, node: Node) -> usize {
        if let Some(idx) = self.free.pop() {
            self.nodes[idx] = Some(node);
            idx
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn push_front(&mut self, idx: usize) {
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = NIL;
            node.next = self.head;
        }
        if self.head != NIL {
            if let Some(old_head) = self.nodes[self.head].as_mut() {
                old_head.prev = idx;
            }
        }
        self.head = idx;
        if self.tail == NIL {
            self.tail = idx;
        }
    }

    fn unlink(&mut self, idx: usize) -> Option<Node> {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return None,
        };

        if prev != NIL {
            if let Some(node) = self.nodes[prev].as_mut() {
                node.next = next;
            }
        } else {
            self.head = next;
        }
        if next != NIL {
            if let Some(node) = self.nodes[next].as_mut() {
                node.prev = prev;
            }
        } else {
            self.tail = prev;
        }

        if self.hand == idx {
            self.hand = prev;
        }

        let node = self.nodes[idx].take();
        self.free.push(idx);
        node
    }

    /// Scan from the hand (or tail) toward the head: clear visited bits
    /// until an unvisited node is found, evict it, stop.
    fn evict_one(&mut self) -> Option<CacheKey> {
        let mut idx = if self.hand != NIL { self.hand } else { self.tail };
        let mut scanned = 0;
        let live = self.map.len();

        while idx != NIL && scanned < live * 2 {
            let (visited, prev) = match self.nodes[idx].as_ref() {
                Some(node) => (node.visited.swap(false, Ordering::Relaxed), node.prev),
                None => (true, NIL),
            };

            if !visited {
                self.hand = prev;
                let node = self.unlink(idx)?;
                self.map.remove(&node.key);
                return Some(node.key);
            }

            idx = if prev != NIL { prev } else { self.tail };
            scanned += 1;
        }

        // Every node was visited twice over; fall back to the tail.
        let tail = self.tail;
        if tail != NIL {
            let node = self.unlink(tail)?;
            self.map.remove(&node.key);
            return Some(node.key);
        }
        None
    }
}

pub struct SieveCache {
    shards: Vec<RwLock<Shard>>,
    shard_mask: u64,
    capacity_per_shard: usize,
    evictions: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct SieveStats {
    pub entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub expired: usize,
    pub capacity: usize,
    pub evictions: u64,
}

impl SieveStats {
    pub fn fill_ratio(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.entries as f64 / self.capacity as f64
        }
    }
}

impl SieveCache {
    /// `capacity` is the total entry count, split across `shards` (rounded
    /// up to a power of two, default 32).
    pub fn new(capacity: usize, shards: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let capacity_per_shard = capacity.div_ceil(shard_count).max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(Shard::new())).collect(),
            shard_mask: shard_count as u64 - 1,
            capacity_per_shard,
            evictions: AtomicU64::new(0),
        }
    }

    fn shard(&self, key: &CacheKey) -> &RwLock<Shard> {
        &self.shards[(key.shard_hash() & self.shard_mask) as usize]
    }

    /// Shared-lock lookup. A hit sets the visited bit; the entry is returned
    /// as a cheap handle to the shared buffer (callers copy before mutating,
    /// see the serving path).
    pub fn get(&self, key: &CacheKey, now: u64) -> (Option<CacheEntry>, HitKind) {
        let shard = self.shard(key).read();
        let Some(&idx) = shard.map.get(key) else {
            return (None, HitKind::Miss);
        };
        let Some(node) = shard.nodes[idx].as_ref() else {
            return (None, HitKind::Miss);
        };

        node.visited.store(true, Ordering::Relaxed);
        let kind = classify(now, node.entry.soft_expiry, node.hard_expiry);
        (Some(node.entry.clone()), kind)
    }

    /// Exclusive-lock insert (or in-place replace). Runs SIEVE eviction when
    /// the shard is full.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry, hard_expiry: u64) {
        let mut shard = self.shard(&key).write();

        if let Some(&idx) = shard.map.get(&key) {
            if let Some(node) = shard.nodes[idx].as_mut() {
                node.entry = entry;
                node.hard_expiry = hard_expiry;
                node.visited.store(true, Ordering::Relaxed);
                return;
            }
        }

        // Make room first so the incoming entry is never its own victim.
        while shard.map.len() >= self.capacity_per_shard {
            if shard.evict_one().is_none() {
                break;
            }
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }

        let idx = shard.alloc(Node {
            key: key.clone(),
            entry,
            hard_expiry,
            visited: AtomicBool::new(false),
            prev: NIL,
            next: NIL,
        });
        shard.push_front(idx);
        shard.map.insert(key, idx);
    }

    pub fn remove(&self, key: &CacheKey) {
        let mut shard = self.shard(key).write();
        if let Some(idx) = shard.map.remove(key) {
            shard.unlink(idx);
        }
    }

    /// Drop every entry whose hard expiry has passed.
    pub fn clean_expired(&self, now: u64) -> usize {
        let mut removed = 0;
        for lock in &self.shards {
            let mut shard = lock.write();
            let dead: Vec<usize> = shard
                .nodes
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    slot.as_ref()
                        .filter(|node| node.hard_expiry < now)
                        .map(|_| idx)
                })
                .collect();
            for idx in dead {
                if let Some(node) = shard.unlink(idx) {
                    shard.map.remove(&node.key);
                    removed += 1;
                }
            }
        }
        removed
    }

    pub fn clear(&self) {
        for lock in &self.shards {
            *lock.write() = Shard::new();
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self, now: u64) -> SieveStats {
        let mut stats = SieveStats {
            capacity: self.capacity_per_shard * self.shards.len(),
            evictions: self.evictions.load(Ordering::Relaxed),
            ..SieveStats::default()
        };
        for lock in &self.shards {
            let shard = lock.read();
            for node in shard.nodes.iter().flatten() {
                stats.entries += 1;
                match classify(now, node.entry.soft_expiry, node.hard_expiry) {
                    HitKind::Fresh => stats.fresh += 1,
                    HitKind::Stale => stats.stale += 1,
                    _ => stats.expired += 1,
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn key(name: &str) -> CacheKey {
        CacheKey::new(name, 1, 1)
    }

    fn entry(soft_expiry: u64) -> CacheEntry {
        CacheEntry {
            msg: Bytes::from_static(b"\x00\x01response"),
            soft_expiry,
            created_at: soft_expiry.saturating_sub(300),
        }
    }

    #[test]
    fn get_classifies_freshness() {
        let cache = SieveCache::new(16, 1);
        cache.insert(key("fresh.example"), entry(1000), 1300);

        assert!(matches!(cache.get(&key("fresh.example"), 900).1, HitKind::Fresh));
        assert!(matches!(cache.get(&key("fresh.example"), 1100).1, HitKind::Stale));
        assert!(matches!(cache.get(&key("fresh.example"), 1400).1, HitKind::Expired));
        assert!(matches!(cache.get(&key("missing.example"), 900).1, HitKind::Miss));
    }

    #[test]
    fn sieve_gives_visited_entries_a_second_chance() {
        // Single shard, capacity 3.
        let cache = SieveCache::new(3, 1);
        cache.insert(key("a"), entry(1000), 1300);
        cache.insert(key("b"), entry(1000), 1300);
        cache.insert(key("c"), entry(1000), 1300);

        // Visit "a" (the tail); the next insert must evict "b" instead.
        cache.get(&key("a"), 900);
        cache.insert(key("d"), entry(1000), 1300);

        assert!(matches!(cache.get(&key("a"), 900).1, HitKind::Fresh));
        assert!(matches!(cache.get(&key("b"), 900).1, HitKind::Miss));
        assert!(matches!(cache.get(&key("c"), 900).1, HitKind::Fresh));
        assert!(matches!(cache.get(&key("d"), 900).1, HitKind::Fresh));
    }

    #[test]
    fn hand_persists_across_evictions() {
        let cache = SieveCache::new(3, 1);
        cache.insert(key("a"), entry(1000), 1300);
        cache.insert(key("b"), entry(1000), 1300);
        cache.insert(key("c"), entry(1000), 1300);
        for name in ["a", "b", "c"] {
            cache.get(&key(name), 900);
        }

        // First eviction clears visited bits from the tail up and evicts
        // the tail ("a") on the wrap-around pass.
        cache.insert(key("d"), entry(1000), 1300);
        assert!(matches!(cache.get(&key("a"), 900).1, HitKind::Miss));

        // The hand now sits past "b"; the next eviction takes "b" without
        // rescanning the whole shard.
        cache.insert(key("e"), entry(1000), 1300);
        assert!(matches!(cache.get(&key("b"), 900).1, HitKind::Miss));
        assert!(matches!(cache.get(&key("c"), 900).1, HitKind::Fresh));
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn clean_expired_removes_past_hard_expiry() {
        let cache = SieveCache::new(16, 4);
        cache.insert(key("old.example"), entry(100), 200);
        cache.insert(key("live.example"), entry(1000), 1300);

        assert_eq!(cache.clean_expired(500), 1);
        assert!(matches!(cache.get(&key("old.example"), 500).1, HitKind::Miss));
        assert!(matches!(cache.get(&key("live.example"), 500).1, HitKind::Fresh));
    }

    #[test]
    fn insert_replaces_in_place() {
        let cache = SieveCache::new(4, 1);
        cache.insert(key("a"), entry(1000), 1300);
        cache.insert(key("a"), entry(2000), 2300);
        assert_eq!(cache.len(), 1);
        let (got, kind) = cache.get(&key("a"), 1500);
        assert!(matches!(kind, HitKind::Fresh));
        assert_eq!(got.unwrap().soft_expiry, 2000);
    }
}
