//! Client identification: maps a client address to a display name and a
//! policy group. Snapshot-swapped on reload; the resolver skips the lookup
//! entirely when no group carries custom policy.

use crate::config::{ClientGroupConfig, ClientIdentificationConfig, SafeSearchConfig};
use arc_swap::ArcSwap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub name: Arc<str>,
    pub group_id: Option<Arc<str>>,
}

#[derive(Debug, Clone, Default)]
pub struct GroupPolicy {
    pub has_blocklist: bool,
    pub safe_search: Option<SafeSearchConfig>,
}

#[derive(Default)]
struct ClientSnapshot {
    by_ip: HashMap<IpAddr, ClientInfo>,
    groups: HashMap<String, GroupPolicy>,
    /// True when any group overrides blocklist or safe-search; the fast
    /// path skips group resolution otherwise.
    has_custom_policy: bool,
}

pub struct ClientResolver {
    snapshot: ArcSwap<ClientSnapshot>,
}

impl ClientResolver {
    pub fn new() -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(ClientSnapshot::default()),
        }
    }

    pub fn apply_config(
        &self,
        identification: &ClientIdentificationConfig,
        groups: &[ClientGroupConfig],
    ) {
        let mut snapshot = ClientSnapshot::default();

        for group in groups {
            let policy = GroupPolicy {
                has_blocklist: group.blocklist.is_some(),
                safe_search: group.safe_search.clone(),
            };
            snapshot.has_custom_policy |= policy.has_blocklist || policy.safe_search.is_some();
            snapshot.groups.insert(group.id.clone(), policy);
        }

        if identification.enabled {
            for client in &identification.clients {
                let Ok(ip) = client.ip.parse::<IpAddr>() else {
                    warn!("client identification: invalid IP {:?}, skipping", client.ip);
                    continue;
                };
                let group_id = if client.group_id.is_empty() {
                    None
                } else {
                    if !snapshot.groups.contains_key(&client.group_id) {
                        warn!(
                            "client {} references unknown group {:?}",
                            client.ip, client.group_id
                        );
                    }
                    Some(Arc::from(client.group_id.as_str()))
                };
                snapshot.by_ip.insert(
                    ip,
                    ClientInfo {
                        name: Arc::from(client.name.as_str()),
                        group_id,
                    },
                );
            }
        }

        self.snapshot.store(Arc::new(snapshot));
    }

    /// Display name for logging; `None` falls back to the bare address.
    pub fn resolve_name(&self, ip: IpAddr) -> Option<Arc<str>> {
        self.snapshot.load().by_ip.get(&ip).map(|c| c.name.clone())
    }

    /// Group id for policy selection. Returns `None` when the client is
    /// unknown or when no group defines custom policy (fast path).
    pub fn resolve_group(&self, ip: IpAddr) -> Option<Arc<str>> {
        let snapshot = self.snapshot.load();
        if !snapshot.has_custom_policy {
            return None;
        }
        snapshot.by_ip.get(&ip).and_then(|c| c.group_id.clone())
    }

    pub fn group_safe_search(&self, group_id: &str) -> Option<SafeSearchConfig> {
        self.snapshot
            .load()
            .groups
            .get(group_id)
            .and_then(|g| g.safe_search.clone())
    }

    pub fn has_custom_policy(&self) -> bool {
        self.snapshot.load().has_custom_policy
    }
}

impl Default for ClientResolver {
    fn default() -> Self {
        Self::new()
    }
}
