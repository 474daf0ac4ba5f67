mod common;

use common::MapFetcher;
use gjallar::blocking::{BlockDecision, BlocklistManager};
use gjallar::config::{BlocklistConfig, ClientGroupConfig, GroupBlocklistConfig};

fn base_config(sources: &[&str], denylist: &[&str], allowlist: &[&str]) -> BlocklistConfig {
    BlocklistConfig {
        sources: sources.iter().map(|s| s.to_string()).collect(),
        denylist: denylist.iter().map(|s| s.to_string()).collect(),
        allowlist: allowlist.iter().map(|s| s.to_string()).collect(),
        ..BlocklistConfig::default()
    }
}

#[tokio::test]
async fn apply_config_is_idempotent_on_equal_content() {
    let fetcher = MapFetcher::new(&[("mem://list", "ads.example.com\n")]);
    let manager = BlocklistManager::new(fetcher);

    let config = base_config(&["mem://list"], &[], &[]);
    assert!(manager.apply_config(&config).await.unwrap());
    // Identical content: no work on the second call.
    assert!(!manager.apply_config(&config).await.unwrap());

    // A changed denylist rebuilds.
    let changed = base_config(&["mem://list"], &["tracker.example"], &[]);
    assert!(manager.apply_config(&changed).await.unwrap());
}

#[tokio::test]
async fn decide_applies_priority_order() {
    let fetcher = MapFetcher::new(&[("mem://list", "ads.example.com\nmetrics.example.net\n")]);
    let manager = BlocklistManager::new(fetcher);
    manager
        .apply_config(&base_config(
            &["mem://list"],
            &["*.tracker.example"],
            &["ok.tracker.example"],
        ))
        .await
        .unwrap();

    assert_eq!(manager.decide("ads.example.com", None), BlockDecision::Block);
    assert_eq!(manager.decide("sub.ads.example.com", None), BlockDecision::Block);
    assert_eq!(manager.decide("bad.tracker.example", None), BlockDecision::Block);
    assert_eq!(manager.decide("ok.tracker.example", None), BlockDecision::Allow);
    assert_eq!(manager.decide("example.com", None), BlockDecision::None);

    let stats = manager.stats();
    assert_eq!(stats.domains, 2);
    assert!(stats.queries_blocked >= 3);
}

#[tokio::test]
async fn group_snapshot_overrides_global() {
    let fetcher = MapFetcher::new(&[
        ("mem://global", "ads.example.com\n"),
        ("mem://kids", "games.example.com\n"),
    ]);
    let manager = BlocklistManager::new(fetcher);

    let groups = vec![ClientGroupConfig {
        id: "kids".to_string(),
        name: "Kids".to_string(),
        description: String::new(),
        blocklist: Some(GroupBlocklistConfig {
            inherit_global: false,
            sources: vec!["mem://kids".to_string()],
            ..GroupBlocklistConfig::default()
        }),
        safe_search: None,
    }];
    manager.apply_group_configs(&groups).await.unwrap();
    manager
        .apply_config(&base_config(&["mem://global"], &[], &[]))
        .await
        .unwrap();
    assert!(manager.has_group_snapshots());

    // The kids group sees only its own list.
    assert_eq!(
        manager.decide("games.example.com", Some("kids")),
        BlockDecision::Block
    );
    assert_eq!(manager.decide("ads.example.com", Some("kids")), BlockDecision::None);

    // Everyone else sees the global list.
    assert_eq!(manager.decide("ads.example.com", None), BlockDecision::Block);
    assert_eq!(manager.decide("games.example.com", None), BlockDecision::None);

    // An unknown group falls back to global.
    assert_eq!(
        manager.decide("ads.example.com", Some("ghost")),
        BlockDecision::Block
    );
}

#[tokio::test]
async fn inheriting_group_extends_global() {
    let fetcher = MapFetcher::new(&[
        ("mem://global", "ads.example.com\n"),
        ("mem://kids", "games.example.com\n"),
    ]);
    let manager = BlocklistManager::new(fetcher);

    let groups = vec![ClientGroupConfig {
        id: "kids".to_string(),
        name: "Kids".to_string(),
        description: String::new(),
        blocklist: Some(GroupBlocklistConfig {
            inherit_global: true,
            sources: vec!["mem://kids".to_string()],
            ..GroupBlocklistConfig::default()
        }),
        safe_search: None,
    }];
    manager.apply_group_configs(&groups).await.unwrap();
    manager
        .apply_config(&base_config(&["mem://global"], &[], &[]))
        .await
        .unwrap();

    assert_eq!(
        manager.decide("games.example.com", Some("kids")),
        BlockDecision::Block
    );
    assert_eq!(
        manager.decide("ads.example.com", Some("kids")),
        BlockDecision::Block
    );
}

#[tokio::test]
async fn empty_blocklist_blocks_nothing() {
    let manager = BlocklistManager::new(MapFetcher::empty());
    manager
        .apply_config(&BlocklistConfig::default())
        .await
        .unwrap();
    for name in ["example.com", "ads.example.com", "a.b.c.d.example.net"] {
        assert_eq!(manager.decide(name, None), BlockDecision::None);
    }
}
