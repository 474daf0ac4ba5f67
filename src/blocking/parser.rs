//! Line parser for host-style blocklist sources.
//!
//! Accepts bare domain lines and hosts-file lines whose target is a sink
//! address (0.0.0.0, 127.0.0.1, ::, ::1). Comments, localhost aliases and
//! genuine host assignments (lines pointing at routable or RFC1918
//! addresses) are skipped.

use std::net::IpAddr;

const LOCAL_NAMES: &[&str] = &[
    "localhost",
    "localhost.localdomain",
    "local",
    "broadcasthost",
    "ip6-localhost",
    "ip6-loopback",
    "ip6-localnet",
    "ip6-mcastprefix",
    "ip6-allnodes",
    "ip6-allrouters",
    "ip6-allhosts",
];

fn is_sink_addr(addr: IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_unspecified() || v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_unspecified() || v6.is_loopback(),
    }
}

fn is_valid_domain(domain: &str) -> bool {
    if domain.is_empty() || domain.len() > 253 || domain.parse::<IpAddr>().is_ok() {
        return false;
    }
    domain.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && label
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    })
}

/// Normalized (lowercase, no trailing dot) domain from one source line, or
/// `None` when the line carries no block rule.
pub fn parse_line(line: &str) -> Option<String> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('!') {
        return None;
    }
    // Strip trailing comments.
    let line = line.split('#').next().unwrap_or("").trim();

    let mut fields = line.split_whitespace();
    let first = fields.next()?;

    let candidate = match first.parse::<IpAddr>() {
        Ok(addr) => {
            if !is_sink_addr(addr) {
                return None;
            }
            fields.next()?
        }
        Err(_) => {
            if fields.next().is_some() {
                // Bare-domain sources are one domain per line.
                return None;
            }
            first
        }
    };

    let normalized = candidate.trim_end_matches('.').to_ascii_lowercase();
    if LOCAL_NAMES.contains(&normalized.as_str()) || !is_valid_domain(&normalized) {
        return None;
    }
    Some(normalized)
}

/// All block rules in a source body.
pub fn parse_source(content: &str) -> impl Iterator<Item = String> + '_ {
    content.lines().filter_map(parse_line)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_bare_domains_and_sink_hosts_lines() {
        assert_eq!(parse_line("ads.example.com"), Some("ads.example.com".into()));
        assert_eq!(
            parse_line("0.0.0.0 Tracker.Example.NET"),
            Some("tracker.example.net".into())
        );
        assert_eq!(
            parse_line("127.0.0.1 metrics.example.org."),
            Some("metrics.example.org".into())
        );
        assert_eq!(parse_line(":: v6.ads.example"), Some("v6.ads.example".into()));
    }

    #[test]
    fn skips_comments_and_host_assignments() {
        assert_eq!(parse_line("# StevenBlack hosts"), None);
        assert_eq!(parse_line("! adblock header"), None);
        assert_eq!(parse_line(""), None);
        // A real LAN host entry is not a block rule.
        assert_eq!(parse_line("192.168.1.10 nas.local"), None);
        assert_eq!(parse_line("10.0.0.1 router"), None);
        assert_eq!(parse_line("0.0.0.0 localhost"), None);
        assert_eq!(parse_line("ads.example.com extra junk"), None);
    }

    #[test]
    fn skips_invalid_names() {
        assert_eq!(parse_line("0.0.0.0 0.0.0.0"), None);
        assert_eq!(parse_line("not a domain!"), None);
        assert_eq!(parse_line("0.0.0.0 bad..name"), None);
    }

    #[test]
    fn inline_comments_are_stripped() {
        assert_eq!(
            parse_line("0.0.0.0 ads.example.com # seen 2024"),
            Some("ads.example.com".into())
        );
    }

    #[test]
    fn parse_source_filters_wholesale() {
        let content = "# header\n0.0.0.0 a.example\n\nb.example\n192.168.0.5 nas\n";
        let rules: Vec<String> = parse_source(content).collect();
        assert_eq!(rules, vec!["a.example".to_string(), "b.example".to_string()]);
    }
}
