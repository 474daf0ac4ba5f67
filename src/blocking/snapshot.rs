//! Immutable blocklist snapshot: exact set + bloom pre-filter, allow/deny
//! rules, scheduled pause and family time. Built off-path on reload and
//! swapped in wholesale; readers never observe a half-updated rule set.

use super::parser;
use super::schedule::TimeWindow;
use crate::bloom::BloomFilter;
use crate::config::{BlocklistConfig, FamilyTimeConfig, TimeWindowConfig};
use crate::error::{GjallarError, Result};
use chrono::{DateTime, Local};
use regex::Regex;
use rustc_hash::FxHashSet;
use std::collections::HashMap;
use tracing::{debug, warn};

const BLOOM_FP_RATE: f64 = 0.001;
const BLOOM_SEED: u64 = 0x6762_6c6f_636b; // stable across reloads
const MAX_REGEX_LEN: usize = 2048;

/// Static service → domain map for family time.
const FAMILY_SERVICES: &[(&str, &[&str])] = &[
    ("youtube", &["youtube.com", "youtu.be", "googlevideo.com", "ytimg.com"]),
    ("tiktok", &["tiktok.com", "tiktokv.com", "tiktokcdn.com", "musical.ly"]),
    ("instagram", &["instagram.com", "cdninstagram.com", "ig.me"]),
    ("facebook", &["facebook.com", "fbcdn.net", "fb.com", "messenger.com"]),
    ("snapchat", &["snapchat.com", "sc-cdn.net", "snap.com"]),
    ("twitch", &["twitch.tv", "ttvnw.net", "jtvnw.net"]),
    ("discord", &["discord.com", "discord.gg", "discordapp.com", "discordapp.net"]),
    ("roblox", &["roblox.com", "rbxcdn.com"]),
    ("fortnite", &["fortnite.com", "epicgames.com"]),
    ("netflix", &["netflix.com", "nflxvideo.net", "nflximg.net"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDecision {
    Allow,
    Block,
    None,
}

/// Name plus each parent: `a.b.c` yields `a.b.c`, `b.c`, `c`.
fn suffixes(name: &str) -> impl Iterator<Item = &str> {
    std::iter::once(name).chain(
        name.char_indices()
            .filter(|&(_, c)| c == '.')
            .map(|(i, _)| &name[i + 1..]),
    )
}

/// Suffix rules: a rule `x.y` matches `x.y` and any `*.x.y`.
#[derive(Debug, Default)]
pub struct SuffixRules {
    rules: FxHashSet<String>,
}

impl SuffixRules {
    fn insert(&mut self, rule: String) {
        self.rules.insert(rule);
    }

    pub fn matches(&self, name: &str) -> bool {
        if self.rules.is_empty() {
            return false;
        }
        suffixes(name).any(|suffix| self.rules.contains(suffix))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[derive(Debug, Default)]
struct RuleSet {
    exact: FxHashSet<String>,
    suffix: SuffixRules,
    regex: Vec<Regex>,
}

impl RuleSet {
    /// Entry syntax: `/pattern/` compiles to a regex, `*.domain` becomes a
    /// suffix rule on `domain`, anything else is an exact name.
    fn from_entries(entries: &[String]) -> Result<Self> {
        let mut set = RuleSet::default();
        for entry in entries {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if entry.len() >= 2 && entry.starts_with('/') && entry.ends_with('/') {
                let pattern = &entry[1..entry.len() - 1];
                if pattern.len() > MAX_REGEX_LEN {
                    return Err(GjallarError::InvalidBlocklistRule(format!(
                        "regex longer than {} chars",
                        MAX_REGEX_LEN
                    )));
                }
                let compiled = Regex::new(pattern)
                    .map_err(|e| GjallarError::InvalidBlocklistRule(e.to_string()))?;
                set.regex.push(compiled);
            } else if let Some(rest) = entry.strip_prefix("*.") {
                set.suffix.insert(rest.trim_end_matches('.').to_ascii_lowercase());
            } else {
                set.exact
                    .insert(entry.trim_end_matches('.').to_ascii_lowercase());
            }
        }
        Ok(set)
    }

    fn matches(&self, name: &str) -> bool {
        self.exact.contains(name)
            || self.suffix.matches(name)
            || self.regex.iter().any(|re| re.is_match(name))
    }

    fn rule_count(&self) -> usize {
        self.exact.len() + self.suffix.len() + self.regex.len()
    }
}

#[derive(Debug)]
pub struct FamilyTime {
    window: TimeWindow,
    domains: SuffixRules,
}

impl FamilyTime {
    fn from_config(config: &FamilyTimeConfig) -> Result<Self> {
        let window = TimeWindow::parse(&config.start, &config.end, &config.days)?;
        let mut domains = SuffixRules::default();
        for service in &config.services {
            match FAMILY_SERVICES
                .iter()
                .find(|(id, _)| *id == service.to_ascii_lowercase())
            {
                Some((_, service_domains)) => {
                    for domain in *service_domains {
                        domains.insert((*domain).to_string());
                    }
                }
                None => warn!("unknown family-time service {:?}, skipping", service),
            }
        }
        Ok(Self { window, domains })
    }

    fn blocks(&self, name: &str, now: &DateTime<Local>) -> bool {
        self.window.contains(now) && self.domains.matches(name)
    }
}

pub struct BlocklistSnapshot {
    /// Exact names collected from the sources.
    domains: FxHashSet<String>,
    bloom: BloomFilter,
    allow: RuleSet,
    deny: RuleSet,
    scheduled_pause: Option<TimeWindow>,
    family_time: Option<FamilyTime>,
    source_count: usize,
}

impl BlocklistSnapshot {
    pub fn empty() -> Self {
        Self {
            domains: FxHashSet::default(),
            bloom: BloomFilter::with_rate(1, BLOOM_FP_RATE, BLOOM_SEED),
            allow: RuleSet::default(),
            deny: RuleSet::default(),
            scheduled_pause: None,
            family_time: None,
            source_count: 0,
        }
    }

    /// Build from already-fetched source bodies. `sources` lists the bodies
    /// to include (missing entries were logged by the fetch step).
    pub fn build(
        sources: &[String],
        bodies: &HashMap<String, String>,
        allowlist: &[String],
        denylist: &[String],
        scheduled_pause: &TimeWindowConfig,
        family_time: &FamilyTimeConfig,
    ) -> Result<Self> {
        let mut domains = FxHashSet::default();
        for source in sources {
            if let Some(body) = bodies.get(source) {
                domains.extend(parser::parse_source(body));
            }
        }

        let bloom = BloomFilter::with_rate(domains.len(), BLOOM_FP_RATE, BLOOM_SEED);
        for domain in &domains {
            bloom.add(domain);
        }

        let snapshot = Self {
            bloom,
            allow: RuleSet::from_entries(allowlist)?,
            deny: RuleSet::from_entries(denylist)?,
            scheduled_pause: if scheduled_pause.enabled {
                Some(TimeWindow::from_config(scheduled_pause)?)
            } else {
                None
            },
            family_time: if family_time.enabled {
                Some(FamilyTime::from_config(family_time)?)
            } else {
                None
            },
            source_count: sources.len(),
            domains,
        };

        debug!(
            domains = snapshot.domains.len(),
            allow_rules = snapshot.allow.rule_count(),
            deny_rules = snapshot.deny.rule_count(),
            bloom_bits = snapshot.bloom.num_bits(),
            "built blocklist snapshot"
        );
        Ok(snapshot)
    }

    pub fn from_config(config: &BlocklistConfig, bodies: &HashMap<String, String>) -> Result<Self> {
        Self::build(
            &config.sources,
            bodies,
            &config.allowlist,
            &config.denylist,
            &config.scheduled_pause,
            &config.family_time,
        )
    }

    /// Decision priority: pause > allow > deny/family-time > source domains.
    /// The bloom filter short-circuits the common absent case before any
    /// exact-set probing.
    pub fn decide(&self, name: &str, now: &DateTime<Local>) -> BlockDecision {
        let normalized;
        let name = if name.bytes().any(|b| b.is_ascii_uppercase()) || name.ends_with('.') {
            normalized = name.trim_end_matches('.').to_ascii_lowercase();
            normalized.as_str()
        } else {
            name
        };

        if let Some(pause) = &self.scheduled_pause {
            if pause.contains(now) {
                return BlockDecision::None;
            }
        }

        if self.allow.matches(name) {
            return BlockDecision::Allow;
        }

        if self.deny.matches(name) {
            return BlockDecision::Block;
        }
        if let Some(family) = &self.family_time {
            if family.blocks(name, now) {
                return BlockDecision::Block;
            }
        }

        if self.domains.is_empty() {
            return BlockDecision::None;
        }
        let mut any_may_contain = false;
        for suffix in suffixes(name) {
            if self.bloom.may_contain(suffix) {
                any_may_contain = true;
                break;
            }
        }
        if !any_may_contain {
            return BlockDecision::None;
        }

        if suffixes(name).any(|suffix| self.domains.contains(suffix)) {
            BlockDecision::Block
        } else {
            BlockDecision::None
        }
    }

    pub fn domain_count(&self) -> usize {
        self.domains.len()
    }

    pub fn deny_rule_count(&self) -> usize {
        self.deny.rule_count()
    }

    pub fn allow_rule_count(&self) -> usize {
        self.allow.rule_count()
    }

    pub fn source_count(&self) -> usize {
        self.source_count
    }

    pub fn bloom_fill_ratio(&self) -> f64 {
        self.bloom.fill_ratio()
    }

    pub fn estimated_fpr(&self) -> f64 {
        self.bloom.estimated_fpr()
    }
}
