//! End-to-end pipeline scenarios against an in-process stub upstream and an
//! L0-only cache.

mod common;

use bytes::Bytes;
use common::*;
use gjallar::cache::{CacheEntry, CacheKey, HitKind, now_unix};
use gjallar::dns::{Message, Rcode, RecordType, ResourceRecord, wire};
use gjallar::events::Outcome;
use std::time::Duration;

fn preload_entry(response: &Message, soft_expiry: u64, created_at: u64) -> (CacheEntry, Vec<u8>) {
    let bytes = response.serialize().unwrap();
    (
        CacheEntry {
            msg: Bytes::from(bytes.clone()),
            soft_expiry,
            created_at,
        },
        bytes,
    )
}

#[tokio::test]
async fn hot_path_l0_hit_is_byte_identical_except_id_and_question() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let harness = build_harness(test_config(&stub), MapFetcher::empty()).await;

    // Preload dns:example.com:1:1 with an answer for A 93.184.216.34.
    let now = now_unix();
    let cached_query = make_query("example.com", RecordType::A, 0x9999);
    let cached_response = Message::answer_for(
        &cached_query,
        vec![ResourceRecord::a(
            "example.com",
            300,
            "93.184.216.34".parse().unwrap(),
        )],
    );
    let key = CacheKey::new("example.com", 1, 1);
    let (entry, cached_bytes) = preload_entry(&cached_response, now + 300, now);
    harness.cache.set(&key, entry);

    // Query with a different ID and letter case.
    let query = make_query("EXAMPLE.com", RecordType::A, 0xBEEF);
    let query_bytes = query.serialize().unwrap();
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;

    let served = writer.last();
    assert_eq!(wire::id(&served), 0xBEEF);

    // Byte-identical to the cached entry outside the ID and question.
    let question = wire::question_section(&served).unwrap();
    assert_eq!(&served[question.end..], &cached_bytes[question.end..]);
    assert_eq!(&served[2..12], &cached_bytes[2..12]);
    assert_eq!(
        &served[question.clone()],
        &query_bytes[wire::question_section(&query_bytes).unwrap()]
    );

    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Cached));
    assert_eq!(stub.query_count(), 0, "no upstream call on a fresh hit");
}

#[tokio::test]
async fn cache_miss_populates_l0_with_clamped_ttl() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "1.2.3.4".parse().unwrap(),
        ttl: 120,
    })
    .await;
    let mut config = test_config(&stub);
    config.cache.min_ttl = Duration::from_secs(300);
    config.cache.max_ttl = Duration::from_secs(3600);
    let harness = build_harness(config, MapFetcher::empty()).await;

    let query = make_query("example.com", RecordType::A, 77);
    let query_bytes = query.serialize().unwrap();
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.header.id, 77);
    assert_eq!(served.answers.len(), 1);
    // RR TTL 120 clamped up to min_ttl.
    assert_eq!(served.answers[0].ttl, 300);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Upstream));
    assert_eq!(stub.query_count(), 1);

    // Cache write happens after the response; give the detached task a beat.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let key = CacheKey::new("example.com", 1, 1);
    let (entry, kind) = harness.cache.get(&key, now_unix());
    assert_eq!(kind, HitKind::Fresh);
    let entry = entry.unwrap();
    assert_eq!(entry.soft_expiry - entry.created_at, 300);

    // Second query is a pure L0 hit.
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Cached));
    assert_eq!(stub.query_count(), 1);
}

#[tokio::test]
async fn blocked_name_gets_nxdomain_and_no_upstream() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let mut config = test_config(&stub);
    config.blocklist.sources = vec!["mem://ads".to_string()];
    config.response.blocked = "nxdomain".to_string();
    config.response.blocked_ttl = Duration::from_secs(3600);
    let fetcher = MapFetcher::new(&[("mem://ads", "0.0.0.0 ads.example.com\n")]);
    let harness = build_harness(config, fetcher).await;

    let query = make_query("ads.example.com", RecordType::A, 5);
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query.serialize().unwrap(), client_addr(), "udp", &writer)
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NxDomain);
    assert!(served.answers.is_empty());
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Blocked));
    assert_eq!(stub.query_count(), 0);
}

#[tokio::test]
async fn blocked_sink_answers_matching_family_and_nodata_otherwise() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let mut config = test_config(&stub);
    config.blocklist.denylist = vec!["ads.example.com".to_string()];
    config.response.blocked = "0.0.0.0".to_string();
    config.response.blocked_ttl = Duration::from_secs(3600);
    let harness = build_harness(config, MapFetcher::empty()).await;

    // Matching family: A query gets the sink address with blocked_ttl.
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("ads.example.com", RecordType::A, 1)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;
    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NoError);
    assert_eq!(served.answers.len(), 1);
    assert_eq!(served.answers[0].ttl, 3600);
    assert_eq!(served.answers[0].rdata, vec![0, 0, 0, 0]);

    // Family mismatch: AAAA query gets NODATA.
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("ads.example.com", RecordType::AAAA, 2)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;
    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NoError);
    assert!(served.answers.is_empty());
    assert_eq!(stub.query_count(), 0);
}

#[tokio::test]
async fn scheduled_pause_disables_blocking() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 600,
    })
    .await;
    let mut config = test_config(&stub);
    config.blocklist.sources = vec!["mem://ads".to_string()];
    // Pause covers every minute of every day, so the test is deterministic.
    config.blocklist.scheduled_pause.enabled = true;
    config.blocklist.scheduled_pause.start = "00:00".to_string();
    config.blocklist.scheduled_pause.end = "23:59".to_string();
    let fetcher = MapFetcher::new(&[("mem://ads", "ads.example.com\n")]);
    let harness = build_harness(config, fetcher).await;

    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("ads.example.com", RecordType::A, 8)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;

    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Upstream));
    assert_eq!(stub.query_count(), 1);
}

#[tokio::test]
async fn servfail_backoff_serves_stale_without_upstream_contact() {
    let stub = spawn_stub(StubBehavior::Servfail).await;
    let mut config = test_config(&stub);
    config.refresh.serve_stale = true;
    config.cache.expired_entry_ttl = Duration::from_secs(30);
    config.refresh.stale_ttl = Duration::from_secs(30);
    let harness = build_harness(config, MapFetcher::empty()).await;

    // Stale but within grace: soft expired 10s ago, created an hour ago.
    let now = now_unix();
    let cached_query = make_query("down.example", RecordType::A, 0x1111);
    let cached_response = Message::answer_for(
        &cached_query,
        vec![ResourceRecord::a("down.example", 3600, "5.6.7.8".parse().unwrap())],
    );
    let key = CacheKey::new("down.example", 1, 1);
    let (entry, _) = preload_entry(&cached_response, now - 10, now - 3600);
    harness.cache.set(&key, entry);

    // First query: stale serve with the short TTL override; the background
    // refresh hits the stub, gets SERVFAIL, and arms the backoff.
    let query_bytes = make_query("down.example", RecordType::A, 1).serialize().unwrap();
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NoError);
    assert_eq!(served.answers[0].ttl, 30);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::CachedStale));

    tokio::time::sleep(Duration::from_millis(100)).await;
    let tracker = harness.resolver.servfail_tracker();
    assert!(tracker.is_backoff(&key.redis_key()));
    assert_eq!(tracker.fail_count(&key.redis_key()), 1);
    let upstream_calls = stub.query_count();
    assert_eq!(upstream_calls, 1, "only the refresh reached the stub");

    // Second query inside the backoff: stale again, no new upstream call,
    // no new refresh.
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NoError);
    assert_eq!(stub.query_count(), upstream_calls);
    assert_eq!(tracker.fail_count(&key.redis_key()), 1);
}

#[tokio::test]
async fn servfail_backoff_serves_cached_entry_even_without_serve_stale() {
    let stub = spawn_stub(StubBehavior::Servfail).await;
    let mut config = test_config(&stub);
    config.refresh.serve_stale = false;
    let harness = build_harness(config, MapFetcher::empty()).await;

    let now = now_unix();
    let cached_query = make_query("flaky.example", RecordType::A, 0x3333);
    let cached_response = Message::answer_for(
        &cached_query,
        vec![ResourceRecord::a("flaky.example", 3600, "5.6.7.8".parse().unwrap())],
    );
    let key = CacheKey::new("flaky.example", 1, 1);
    let (entry, _) = preload_entry(&cached_response, now - 10, now - 3600);
    harness.cache.set(&key, entry);

    // First query: stale is not served (serve_stale off), the upstream
    // answers SERVFAIL, the backoff arms.
    let query_bytes = make_query("flaky.example", RecordType::A, 1).serialize().unwrap();
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;
    assert_eq!(Message::parse(&writer.last()).unwrap().rcode(), Rcode::ServFail);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::UpstreamServfail));
    assert!(harness.resolver.servfail_tracker().is_backoff(&key.redis_key()));

    // Second query inside the backoff: the cached entry is served as stale
    // regardless of the serve_stale toggle, with no upstream contact.
    let before = stub.query_count();
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&query_bytes, client_addr(), "udp", &writer)
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::NoError);
    assert_eq!(served.answers[0].rdata, vec![5, 6, 7, 8]);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::ServfailBackoff));
    assert_eq!(stub.query_count(), before);
}

#[tokio::test]
async fn upstream_servfail_without_cache_is_forwarded() {
    let stub = spawn_stub(StubBehavior::Servfail).await;
    let harness = build_harness(test_config(&stub), MapFetcher::empty()).await;

    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("down.example", RecordType::A, 3)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::ServFail);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::UpstreamServfail));
    assert!(
        harness
            .resolver
            .servfail_tracker()
            .is_backoff(&CacheKey::new("down.example", 1, 1).redis_key())
    );
}

#[tokio::test]
async fn upstream_error_serves_stale_or_servfail() {
    let stub = spawn_stub(StubBehavior::Ignore).await;
    let mut config = test_config(&stub);
    config.upstreams.upstream_timeout = Duration::from_millis(100);
    let harness = build_harness(config, MapFetcher::empty()).await;

    // No cache: synthesized SERVFAIL.
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("gone.example", RecordType::A, 4)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;
    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::ServFail);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::UpstreamError));
}

#[tokio::test]
async fn local_records_answer_before_everything() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let mut config = test_config(&stub);
    config.local_records = vec![gjallar::config::LocalRecordConfig {
        name: "nas.home".to_string(),
        rtype: "A".to_string(),
        value: "192.168.1.10".to_string(),
    }];
    // Even a denylist entry for the same name loses to local records.
    config.blocklist.denylist = vec!["nas.home".to_string()];
    let harness = build_harness(config, MapFetcher::empty()).await;

    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("nas.home", RecordType::A, 6).serialize().unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.answers[0].rdata, vec![192, 168, 1, 10]);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Local));
    assert_eq!(stub.query_count(), 0);
}

#[tokio::test]
async fn safe_search_synthesizes_cname() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let mut config = test_config(&stub);
    config.safe_search.enabled = true;
    let harness = build_harness(config, MapFetcher::empty()).await;

    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("www.google.com", RecordType::A, 7)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.answers.len(), 1);
    assert_eq!(served.answers[0].rtype, RecordType::CNAME);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::SafeSearch));
    assert_eq!(stub.query_count(), 0);
}

#[tokio::test]
async fn no_question_gets_formerr() {
    let stub = spawn_stub(StubBehavior::Ignore).await;
    let harness = build_harness(test_config(&stub), MapFetcher::empty()).await;

    let mut empty = Message::default();
    empty.header.id = 42;
    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(&empty.serialize().unwrap(), client_addr(), "udp", &writer)
        .await;

    let served = Message::parse(&writer.last()).unwrap();
    assert_eq!(served.rcode(), Rcode::FormErr);
    assert_eq!(served.header.id, 42);
    assert_eq!(harness.sink.last_outcome(), Some(Outcome::Invalid));
}

#[tokio::test]
async fn lru_size_zero_disables_l0_without_breaking_resolution() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "4.3.2.1".parse().unwrap(),
        ttl: 300,
    })
    .await;
    let mut config = test_config(&stub);
    config.cache.redis.lru_size = 0;
    let harness = build_harness(config, MapFetcher::empty()).await;
    assert!(!harness.cache.has_l0());

    let query_bytes = make_query("example.org", RecordType::A, 9).serialize().unwrap();
    for _ in 0..2 {
        let writer = CaptureWriter::new();
        harness
            .resolver
            .serve_query(&query_bytes, client_addr(), "udp", &writer)
            .await;
        assert_eq!(harness.sink.last_outcome(), Some(Outcome::Upstream));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    // Every query went upstream; nothing cached anywhere.
    assert_eq!(stub.query_count(), 2);
}

#[tokio::test]
async fn max_inflight_zero_disables_refresh_but_stale_still_serves() {
    let stub = spawn_stub(StubBehavior::Answer {
        ip: "9.9.9.9".parse().unwrap(),
        ttl: 60,
    })
    .await;
    let mut config = test_config(&stub);
    config.refresh.max_inflight = 0;
    config.refresh.serve_stale = true;
    let harness = build_harness(config, MapFetcher::empty()).await;

    let now = now_unix();
    let cached_query = make_query("stale.example", RecordType::A, 0x2222);
    let cached_response = Message::answer_for(
        &cached_query,
        vec![ResourceRecord::a("stale.example", 3600, "8.8.4.4".parse().unwrap())],
    );
    let key = CacheKey::new("stale.example", 1, 1);
    let (entry, _) = preload_entry(&cached_response, now - 10, now - 3600);
    harness.cache.set(&key, entry);

    let writer = CaptureWriter::new();
    harness
        .resolver
        .serve_query(
            &make_query("stale.example", RecordType::A, 10)
                .serialize()
                .unwrap(),
            client_addr(),
            "udp",
            &writer,
        )
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(harness.sink.last_outcome(), Some(Outcome::CachedStale));
    assert_eq!(stub.query_count(), 0, "refresh disabled, no upstream contact");
}
