use crate::error::{GjallarError, Result};
use serde::{Deserialize, Deserializer};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// Parse a duration from either an integer (seconds) or a human string such
/// as "300s", "50ms", "5m", "1h". Bare numbers in strings are also seconds.
pub fn parse_duration(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GjallarError::InvalidDuration(value.to_string()));
    }

    let split = value
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(value.len());
    let (number, unit) = value.split_at(split);
    let number: f64 = number
        .parse()
        .map_err(|_| GjallarError::InvalidDuration(value.to_string()))?;

    let duration = match unit.trim() {
        "" | "s" | "sec" | "secs" => Duration::from_secs_f64(number),
        "ms" => Duration::from_secs_f64(number / 1000.0),
        "m" | "min" | "mins" => Duration::from_secs_f64(number * 60.0),
        "h" | "hr" | "hrs" => Duration::from_secs_f64(number * 3600.0),
        "d" => Duration::from_secs_f64(number * 86400.0),
        _ => return Err(GjallarError::InvalidDuration(value.to_string())),
    };
    Ok(duration)
}

fn de_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(u64),
        Human(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) => Ok(Duration::from_secs(secs)),
        Raw::Human(s) => parse_duration(&s).map_err(serde::de::Error::custom),
    }
}

macro_rules! default_duration {
    ($name:ident, $secs:expr) => {
        fn $name() -> Duration {
            Duration::from_secs($secs)
        }
    };
}

default_duration!(default_read_timeout, 5);
default_duration!(default_write_timeout, 5);
default_duration!(default_min_ttl, 60);
default_duration!(default_max_ttl, 86400);
default_duration!(default_negative_ttl, 30);
default_duration!(default_servfail_backoff, 30);
default_duration!(default_servfail_log_interval, 30);
default_duration!(default_lru_grace_period, 3600);
default_duration!(default_expired_entry_ttl, 30);
default_duration!(default_hit_window, 300);
default_duration!(default_refresh_min_ttl, 60);
default_duration!(default_hot_ttl, 300);
default_duration!(default_lock_ttl, 10);
default_duration!(default_sweep_interval, 60);
default_duration!(default_sweep_window, 60);
default_duration!(default_sweep_hit_window, 86400);
default_duration!(default_stale_ttl, 30);
default_duration!(default_upstream_timeout, 2);
default_duration!(default_upstream_backoff, 1);
default_duration!(default_blocklist_refresh, 86400);
default_duration!(default_connect_timeout, 5);
default_duration!(default_op_timeout, 1);

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cache: CacheConfig,
    pub refresh: RefreshConfig,
    pub upstreams: UpstreamsConfig,
    pub blocklist: BlocklistConfig,
    pub response: ResponseConfig,
    pub safe_search: SafeSearchConfig,
    pub local_records: Vec<LocalRecordConfig>,
    pub client_identification: ClientIdentificationConfig,
    pub client_groups: Vec<ClientGroupConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            refresh: RefreshConfig::default(),
            upstreams: UpstreamsConfig::default(),
            blocklist: BlocklistConfig::default(),
            response: ResponseConfig::default(),
            safe_search: SafeSearchConfig::default(),
            local_records: Vec::new(),
            client_identification: ClientIdentificationConfig::default(),
            client_groups: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen addresses for plain DNS (UDP and TCP).
    pub listen: Vec<String>,
    /// Protocols to serve on the listen addresses.
    pub protocols: Vec<String>,
    /// Number of receive tasks per UDP socket.
    pub listeners: usize,
    #[serde(deserialize_with = "de_duration")]
    pub read_timeout: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: vec!["0.0.0.0:53".to_string()],
            protocols: vec!["udp".to_string(), "tcp".to_string()],
            listeners: 4,
            read_timeout: default_read_timeout(),
            write_timeout: default_write_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(deserialize_with = "de_duration")]
    pub min_ttl: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub max_ttl: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub negative_ttl: Duration,
    #[serde(deserialize_with = "de_duration")]
    pub servfail_backoff: Duration,
    pub servfail_refresh_threshold: u32,
    #[serde(deserialize_with = "de_duration")]
    pub servfail_log_interval: Duration,
    /// When false, every positive answer is cached for `min_ttl` regardless
    /// of the TTLs in the upstream response.
    pub respect_source_ttl: bool,
    /// Upper bound on the stale-serving grace period.
    #[serde(deserialize_with = "de_duration")]
    pub lru_grace_period: Duration,
    /// TTL shown to clients on stale serves.
    #[serde(deserialize_with = "de_duration")]
    pub expired_entry_ttl: Duration,
    pub redis: RedisConfig,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            negative_ttl: default_negative_ttl(),
            servfail_backoff: default_servfail_backoff(),
            servfail_refresh_threshold: 10,
            servfail_log_interval: default_servfail_log_interval(),
            respect_source_ttl: true,
            lru_grace_period: default_lru_grace_period(),
            expired_entry_ttl: default_expired_entry_ttl(),
            redis: RedisConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Standalone address, e.g. "redis://127.0.0.1:6379". Empty disables L1.
    pub address: String,
    /// Cluster node addresses. Non-empty switches to cluster mode.
    pub cluster_addresses: Vec<String>,
    pub db: i64,
    pub password: String,
    /// Entry capacity of the in-process L0 cache. 0 disables L0.
    pub lru_size: usize,
    /// Advisory cap on the number of L1 keys (enforced by the sweeper).
    pub max_keys: usize,
    pub pool_size: usize,
    #[serde(deserialize_with = "de_duration")]
    pub connect_timeout: Duration,
    /// Per-operation deadline for every L1 call.
    #[serde(deserialize_with = "de_duration")]
    pub op_timeout: Duration,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            cluster_addresses: Vec::new(),
            db: 0,
            password: String::new(),
            lru_size: 10_000,
            max_keys: 1_000_000,
            pool_size: 8,
            connect_timeout: default_connect_timeout(),
            op_timeout: default_op_timeout(),
        }
    }
}

impl RedisConfig {
    pub fn enabled(&self) -> bool {
        !self.address.is_empty() || !self.cluster_addresses.is_empty()
    }

    pub fn cluster_mode(&self) -> bool {
        !self.cluster_addresses.is_empty()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub enabled: bool,
    /// Rolling window for hot-key detection.
    #[serde(deserialize_with = "de_duration")]
    pub hit_window: Duration,
    /// Hits within `hit_window` at which a key counts as hot.
    pub hot_threshold: u64,
    /// Refresh-ahead threshold for ordinary keys.
    #[serde(deserialize_with = "de_duration")]
    pub min_ttl: Duration,
    /// Refresh-ahead threshold for hot keys.
    #[serde(deserialize_with = "de_duration")]
    pub hot_ttl: Duration,
    /// TTL of the cluster-wide per-key refresh lock.
    #[serde(deserialize_with = "de_duration")]
    pub lock_ttl: Duration,
    /// Maximum concurrent in-process refreshes. 0 disables refreshing.
    pub max_inflight: usize,
    #[serde(deserialize_with = "de_duration")]
    pub sweep_interval: Duration,
    /// Sweep looks at entries expiring within this window.
    #[serde(deserialize_with = "de_duration")]
    pub sweep_window: Duration,
    pub max_batch_size: usize,
    /// Entries below this many sweep-window hits are deletion candidates.
    pub sweep_min_hits: u64,
    #[serde(deserialize_with = "de_duration")]
    pub sweep_hit_window: Duration,
    /// Probability that a hit increments the shared (L1) counters.
    pub hit_count_sample_rate: f64,
    pub serve_stale: bool,
    /// TTL shown to clients on a stale L0/L1 hit.
    #[serde(deserialize_with = "de_duration")]
    pub stale_ttl: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            hit_window: default_hit_window(),
            hot_threshold: 3,
            min_ttl: default_refresh_min_ttl(),
            hot_ttl: default_hot_ttl(),
            lock_ttl: default_lock_ttl(),
            max_inflight: 16,
            sweep_interval: default_sweep_interval(),
            sweep_window: default_sweep_window(),
            max_batch_size: 1000,
            sweep_min_hits: 1,
            sweep_hit_window: default_sweep_hit_window(),
            hit_count_sample_rate: 1.0,
            serve_stale: true,
            stale_ttl: default_stale_ttl(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    Udp,
    Tcp,
    Tls,
    Https,
    Quic,
}

impl Default for UpstreamProtocol {
    fn default() -> Self {
        UpstreamProtocol::Udp
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum ResolverStrategy {
    #[serde(rename = "failover")]
    Failover,
    #[serde(rename = "load-balance", alias = "load_balance")]
    LoadBalance,
    #[serde(rename = "weighted")]
    Weighted,
}

impl Default for ResolverStrategy {
    fn default() -> Self {
        ResolverStrategy::Failover
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamEntry {
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub protocol: UpstreamProtocol,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamsConfig {
    pub servers: Vec<UpstreamEntry>,
    pub resolver_strategy: ResolverStrategy,
    #[serde(deserialize_with = "de_duration")]
    pub upstream_timeout: Duration,
    /// Base backoff; doubles per consecutive failure, capped at 5 minutes.
    #[serde(deserialize_with = "de_duration")]
    pub upstream_backoff: Duration,
    /// Upstreams attempted per query before giving up.
    pub max_attempts: usize,
}

impl Default for UpstreamsConfig {
    fn default() -> Self {
        Self {
            servers: vec![
                UpstreamEntry {
                    name: "cloudflare".to_string(),
                    address: "1.1.1.1:53".to_string(),
                    protocol: UpstreamProtocol::Udp,
                    weight: 1,
                },
                UpstreamEntry {
                    name: "google".to_string(),
                    address: "8.8.8.8:53".to_string(),
                    protocol: UpstreamProtocol::Udp,
                    weight: 1,
                },
            ],
            resolver_strategy: ResolverStrategy::Failover,
            upstream_timeout: default_upstream_timeout(),
            upstream_backoff: default_upstream_backoff(),
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct TimeWindowConfig {
    pub enabled: bool,
    /// "HH:MM"
    pub start: String,
    /// "HH:MM"
    pub end: String,
    /// Weekday names: "mon".."sun" (or full names).
    pub days: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FamilyTimeConfig {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    pub days: Vec<String>,
    /// Service ids from the static service→domain map ("tiktok", "youtube", ...).
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    #[serde(deserialize_with = "de_duration")]
    pub refresh_interval: Duration,
    /// Source URLs (or file paths) of host-style blocklists.
    pub sources: Vec<String>,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub scheduled_pause: TimeWindowConfig,
    pub family_time: FamilyTimeConfig,
    pub health_check: bool,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_blocklist_refresh(),
            sources: Vec::new(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            scheduled_pause: TimeWindowConfig::default(),
            family_time: FamilyTimeConfig::default(),
            health_check: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ResponseConfig {
    /// "nxdomain", or an IPv4/IPv6 sink address.
    pub blocked: String,
    #[serde(deserialize_with = "de_duration")]
    pub blocked_ttl: Duration,
}

impl Default for ResponseConfig {
    fn default() -> Self {
        Self {
            blocked: "nxdomain".to_string(),
            blocked_ttl: Duration::from_secs(3600),
        }
    }
}

impl ResponseConfig {
    pub fn blocked_addr(&self) -> Option<IpAddr> {
        self.blocked.parse().ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SafeSearchConfig {
    pub enabled: bool,
    pub google: bool,
    pub bing: bool,
}

impl Default for SafeSearchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            google: true,
            bing: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LocalRecordConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ClientEntryConfig {
    pub ip: String,
    pub name: String,
    #[serde(default)]
    pub group_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ClientIdentificationConfig {
    pub enabled: bool,
    pub clients: Vec<ClientEntryConfig>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct GroupBlocklistConfig {
    pub inherit_global: bool,
    pub sources: Vec<String>,
    pub allowlist: Vec<String>,
    pub denylist: Vec<String>,
    pub scheduled_pause: TimeWindowConfig,
    pub family_time: FamilyTimeConfig,
}

impl Default for GroupBlocklistConfig {
    fn default() -> Self {
        Self {
            inherit_global: true,
            sources: Vec::new(),
            allowlist: Vec::new(),
            denylist: Vec::new(),
            scheduled_pause: TimeWindowConfig::default(),
            family_time: FamilyTimeConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClientGroupConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub blocklist: Option<GroupBlocklistConfig>,
    #[serde(default)]
    pub safe_search: Option<SafeSearchConfig>,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| GjallarError::ConfigParseError(format!("{}: {}", path, e)))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|e| GjallarError::ConfigParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot run. Called at load and before
    /// every hot reload; a rejected reload leaves the running snapshot
    /// untouched.
    pub fn validate(&self) -> Result<()> {
        for addr in &self.server.listen {
            addr.parse::<SocketAddr>()
                .map_err(|_| GjallarError::InvalidListenAddress(addr.clone()))?;
        }

        if self.upstreams.servers.is_empty() {
            return Err(GjallarError::InvalidUpstream("no upstreams configured".into()));
        }
        for upstream in &self.upstreams.servers {
            upstream
                .address
                .parse::<SocketAddr>()
                .map_err(|_| GjallarError::InvalidUpstream(upstream.address.clone()))?;
            match upstream.protocol {
                UpstreamProtocol::Udp | UpstreamProtocol::Tcp => {}
                other => {
                    return Err(GjallarError::UnsupportedProtocol(format!(
                        "{:?} (upstream {})",
                        other, upstream.name
                    )));
                }
            }
        }

        if self.response.blocked != "nxdomain" && self.response.blocked_addr().is_none() {
            return Err(GjallarError::ConfigParseError(format!(
                "response.blocked must be \"nxdomain\" or an IP address, got {:?}",
                self.response.blocked
            )));
        }

        if !(0.0..=1.0).contains(&self.refresh.hit_count_sample_rate)
            || self.refresh.hit_count_sample_rate == 0.0
        {
            return Err(GjallarError::ConfigParseError(
                "refresh.hit_count_sample_rate must be in (0, 1]".into(),
            ));
        }

        for record in &self.local_records {
            crate::local_records::validate_record(record)?;
        }

        if self.blocklist.scheduled_pause.enabled {
            crate::blocking::schedule::TimeWindow::from_config(&self.blocklist.scheduled_pause)?;
        }
        if self.blocklist.family_time.enabled {
            crate::blocking::schedule::TimeWindow::parse(
                &self.blocklist.family_time.start,
                &self.blocklist.family_time.end,
                &self.blocklist.family_time.days,
            )?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_accepts_integers_and_strings() {
        assert_eq!(parse_duration("300").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("300s").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("50ms").unwrap(), Duration::from_millis(50));
        assert!(parse_duration("five").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn toml_durations_deserialize_both_forms() {
        let config: Config = toml::from_str(
            r#"
            [cache]
            min_ttl = 300
            max_ttl = "1h"

            [refresh]
            sweep_interval = "90s"
            "#,
        )
        .unwrap();
        assert_eq!(config.cache.min_ttl, Duration::from_secs(300));
        assert_eq!(config.cache.max_ttl, Duration::from_secs(3600));
        assert_eq!(config.refresh.sweep_interval, Duration::from_secs(90));
    }

    #[test]
    fn validate_rejects_unsupported_upstream_protocol() {
        let mut config = Config::default();
        config.upstreams.servers[0].protocol = UpstreamProtocol::Quic;
        assert!(matches!(
            config.validate(),
            Err(GjallarError::UnsupportedProtocol(_))
        ));
    }

    #[test]
    fn validate_rejects_bad_blocked_response() {
        let mut config = Config::default();
        config.response.blocked = "not-an-ip".to_string();
        assert!(config.validate().is_err());

        config.response.blocked = "0.0.0.0".to_string();
        assert!(config.validate().is_ok());
        config.response.blocked = "::".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_config_validates() {
        Config::default().validate().unwrap();
    }
}
