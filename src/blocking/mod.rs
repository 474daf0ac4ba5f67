//! Blocklist engine: snapshot lifecycle, per-group policies, reload.

pub mod parser;
pub mod schedule;
pub mod snapshot;
pub mod updater;

pub use snapshot::{BlockDecision, BlocklistSnapshot};
pub use updater::{BlocklistFetcher, HttpFetcher};

use crate::config::{BlocklistConfig, ClientGroupConfig};
use crate::error::Result;
use arc_swap::ArcSwap;
use chrono::Local;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

#[derive(Debug, Clone, Default)]
pub struct BlocklistStats {
    pub domains: usize,
    pub allow_rules: usize,
    pub deny_rules: usize,
    pub sources: usize,
    pub group_snapshots: usize,
    pub queries_blocked: u64,
    pub queries_allowed: u64,
    pub last_reload_unix: u64,
    pub bloom_fill_ratio: f64,
    pub bloom_estimated_fpr: f64,
}

/// Owns the global snapshot and any per-group snapshots. All reads go
/// through atomic pointer loads; rebuilds happen off-path and swap in
/// wholesale.
pub struct BlocklistManager {
    global: ArcSwap<BlocklistSnapshot>,
    groups: ArcSwap<HashMap<String, Arc<BlocklistSnapshot>>>,
    fetcher: Arc<dyn BlocklistFetcher>,
    last_config: Mutex<Option<BlocklistConfig>>,
    last_group_configs: Mutex<Vec<ClientGroupConfig>>,
    queries_blocked: AtomicU64,
    queries_allowed: AtomicU64,
    last_reload_unix: AtomicU64,
}

impl BlocklistManager {
    pub fn new(fetcher: Arc<dyn BlocklistFetcher>) -> Self {
        Self {
            global: ArcSwap::from_pointee(BlocklistSnapshot::empty()),
            groups: ArcSwap::from_pointee(HashMap::new()),
            fetcher,
            last_config: Mutex::new(None),
            last_group_configs: Mutex::new(Vec::new()),
            queries_blocked: AtomicU64::new(0),
            queries_allowed: AtomicU64::new(0),
            last_reload_unix: AtomicU64::new(0),
        }
    }

    async fn fetch_bodies(&self, urls: &[String]) -> HashMap<String, String> {
        let mut bodies = HashMap::new();
        for url in urls {
            if bodies.contains_key(url) {
                continue;
            }
            match self.fetcher.fetch(url).await {
                Ok(body) => {
                    bodies.insert(url.clone(), body);
                }
                Err(e) => warn!("blocklist source {} failed: {}", url, e),
            }
        }
        bodies
    }

    /// Rebuild and swap the global snapshot. Equal config is a no-op (the
    /// comparison is content equality on sources, allow/deny, pause and
    /// family time); returns whether a rebuild happened.
    pub async fn apply_config(&self, config: &BlocklistConfig) -> Result<bool> {
        {
            let last = self.last_config.lock();
            if last.as_ref() == Some(config) {
                return Ok(false);
            }
        }
        self.rebuild(config).await?;
        *self.last_config.lock() = Some(config.clone());
        Ok(true)
    }

    /// Re-fetch sources and rebuild even when the config is unchanged; the
    /// periodic refresh uses this because source content moves under the
    /// same URLs.
    pub async fn reload(&self) -> Result<()> {
        let config = match self.last_config.lock().clone() {
            Some(config) => config,
            None => return Ok(()),
        };
        self.rebuild(&config).await
    }

    async fn rebuild(&self, config: &BlocklistConfig) -> Result<()> {
        let group_configs = self.last_group_configs.lock().clone();

        let mut urls = config.sources.clone();
        for group in &group_configs {
            if let Some(blocklist) = &group.blocklist {
                urls.extend(blocklist.sources.iter().cloned());
            }
        }
        let bodies = self.fetch_bodies(&urls).await;

        let snapshot = BlocklistSnapshot::from_config(config, &bodies)?;
        info!(
            domains = snapshot.domain_count(),
            sources = config.sources.len(),
            "blocklist snapshot rebuilt"
        );
        self.global.store(Arc::new(snapshot));

        let mut groups = HashMap::new();
        for group in &group_configs {
            let Some(blocklist) = &group.blocklist else {
                continue;
            };
            let mut sources = Vec::new();
            let mut allowlist = blocklist.allowlist.clone();
            let mut denylist = blocklist.denylist.clone();
            if blocklist.inherit_global {
                sources.extend(config.sources.iter().cloned());
                allowlist.extend(config.allowlist.iter().cloned());
                denylist.extend(config.denylist.iter().cloned());
            }
            sources.extend(blocklist.sources.iter().cloned());

            let snapshot = BlocklistSnapshot::build(
                &sources,
                &bodies,
                &allowlist,
                &denylist,
                &blocklist.scheduled_pause,
                &blocklist.family_time,
            )?;
            groups.insert(group.id.clone(), Arc::new(snapshot));
        }
        self.groups.store(Arc::new(groups));

        self.last_reload_unix
            .store(crate::cache::now_unix(), Ordering::Relaxed);
        Ok(())
    }

    /// Install the group configs and rebuild if they changed.
    pub async fn apply_group_configs(&self, groups: &[ClientGroupConfig]) -> Result<bool> {
        {
            let mut last = self.last_group_configs.lock();
            if *last == groups {
                return Ok(false);
            }
            *last = groups.to_vec();
        }
        let config = self.last_config.lock().clone();
        if let Some(config) = config {
            self.rebuild(&config).await?;
        }
        Ok(true)
    }

    /// True when some group carries its own snapshot; the resolver skips the
    /// group indirection entirely otherwise.
    pub fn has_group_snapshots(&self) -> bool {
        !self.groups.load().is_empty()
    }

    pub fn decide(&self, name: &str, group_id: Option<&str>) -> BlockDecision {
        let now = Local::now();
        let decision = match group_id {
            Some(group_id) => {
                let groups = self.groups.load();
                match groups.get(group_id) {
                    Some(snapshot) => snapshot.decide(name, &now),
                    None => self.global.load().decide(name, &now),
                }
            }
            None => self.global.load().decide(name, &now),
        };

        match decision {
            BlockDecision::Block => {
                self.queries_blocked.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.queries_allowed.fetch_add(1, Ordering::Relaxed);
            }
        }
        decision
    }

    pub fn stats(&self) -> BlocklistStats {
        let snapshot = self.global.load();
        BlocklistStats {
            domains: snapshot.domain_count(),
            allow_rules: snapshot.allow_rule_count(),
            deny_rules: snapshot.deny_rule_count(),
            sources: snapshot.source_count(),
            group_snapshots: self.groups.load().len(),
            queries_blocked: self.queries_blocked.load(Ordering::Relaxed),
            queries_allowed: self.queries_allowed.load(Ordering::Relaxed),
            last_reload_unix: self.last_reload_unix.load(Ordering::Relaxed),
            bloom_fill_ratio: snapshot.bloom_fill_ratio(),
            bloom_estimated_fpr: snapshot.estimated_fpr(),
        }
    }
}
