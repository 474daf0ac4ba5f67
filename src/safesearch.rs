//! Safe-search enforcement: rewrites known search engine names to their
//! restricted variants via a synthesized CNAME.

use crate::config::SafeSearchConfig;
use arc_swap::ArcSwap;
use std::sync::Arc;

const GOOGLE_TARGET: &str = "forcesafesearch.google.com";
const BING_TARGET: &str = "strict.bing.com";

const GOOGLE_DOMAINS: &[&str] = &[
    "google.com",
    "google.co.uk",
    "google.ca",
    "google.com.au",
    "google.co.in",
    "google.com.br",
    "google.de",
    "google.fr",
    "google.es",
    "google.it",
    "google.nl",
    "google.pl",
    "google.se",
    "google.ch",
    "google.at",
    "google.be",
    "google.dk",
    "google.fi",
    "google.no",
    "google.pt",
    "google.ie",
    "google.co.nz",
    "google.co.jp",
    "google.co.kr",
];

const BING_DOMAINS: &[&str] = &["bing.com"];

fn matches_engine(name: &str, domains: &[&str]) -> bool {
    let name = name.strip_prefix("www.").unwrap_or(name);
    domains.contains(&name)
}

pub struct SafeSearch {
    config: ArcSwap<SafeSearchConfig>,
}

impl SafeSearch {
    pub fn new(config: SafeSearchConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
        }
    }

    pub fn apply_config(&self, config: SafeSearchConfig) {
        self.config.store(Arc::new(config));
    }

    /// The safe CNAME target for `name`, if rewriting applies. A per-group
    /// override replaces the global toggle set entirely.
    pub fn rewrite(&self, name: &str, group_override: Option<&SafeSearchConfig>) -> Option<&'static str> {
        let global = self.config.load();
        let config = group_override.unwrap_or_else(|| global.as_ref());
        if !config.enabled {
            return None;
        }

        if config.google && matches_engine(name, GOOGLE_DOMAINS) {
            return Some(GOOGLE_TARGET);
        }
        if config.bing && matches_engine(name, BING_DOMAINS) {
            return Some(BING_TARGET);
        }
        None
    }

    pub fn enabled(&self) -> bool {
        self.config.load().enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(enabled: bool, google: bool, bing: bool) -> SafeSearchConfig {
        SafeSearchConfig {
            enabled,
            google,
            bing,
        }
    }

    #[test]
    fn rewrites_known_engines_when_enabled() {
        let safe = SafeSearch::new(config(true, true, true));
        assert_eq!(safe.rewrite("www.google.com", None), Some(GOOGLE_TARGET));
        assert_eq!(safe.rewrite("google.de", None), Some(GOOGLE_TARGET));
        assert_eq!(safe.rewrite("bing.com", None), Some(BING_TARGET));
        assert_eq!(safe.rewrite("duckduckgo.com", None), None);
        assert_eq!(safe.rewrite("maps.google.com", None), None);
    }

    #[test]
    fn disabled_config_rewrites_nothing() {
        let safe = SafeSearch::new(config(false, true, true));
        assert_eq!(safe.rewrite("www.google.com", None), None);
    }

    #[test]
    fn per_engine_toggles() {
        let safe = SafeSearch::new(config(true, false, true));
        assert_eq!(safe.rewrite("www.google.com", None), None);
        assert_eq!(safe.rewrite("www.bing.com", None), Some(BING_TARGET));
    }

    #[test]
    fn group_override_replaces_global() {
        let safe = SafeSearch::new(config(false, false, false));
        let group = config(true, true, false);
        assert_eq!(safe.rewrite("google.com", Some(&group)), Some(GOOGLE_TARGET));
        assert_eq!(safe.rewrite("bing.com", Some(&group)), None);
    }
}
