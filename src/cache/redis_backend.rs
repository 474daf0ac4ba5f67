//! Redis-backed L1 response store: wire-format responses, the expiry index,
//! cross-instance refresh locks and shared hit counters.
//!
//! Key schema (bit-exact across implementations):
//! - `dns:<name>:<type>:<class>` — hash `{msg, soft_expiry, created_at}`,
//!   Redis TTL = soft_ttl + grace
//! - `<meta>:refresh:<cache-key>` — SETNX refresh lock
//! - `<meta>:hit:<cache-key>`, `<meta>:hit:sweep:<cache-key>` — counters
//! - `<meta>:expiry:index` — sorted set scored by soft_expiry
//!
//! where `<meta>` is `dnsmeta` standalone and `{dnsmeta}` in cluster mode
//! (hash-tagged so the metadata family shares a slot).

use super::{CacheEntry, CacheKey, now_unix};
use crate::config::RedisConfig;
use crate::error::{GjallarError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use redis::aio::{ConnectionLike, ConnectionManager};
use redis::cluster::ClusterClientBuilder;
use redis::cluster_async::ClusterConnection;
use redis::{Cmd, Pipeline, RedisFuture, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const COUNT_CACHE_TTL: Duration = Duration::from_secs(30);
const SCAN_BATCH: usize = 1000;

#[derive(Clone)]
enum Conn {
    Standalone(ConnectionManager),
    Cluster(ClusterConnection),
}

impl ConnectionLike for Conn {
    fn req_packed_command<'a>(&'a mut self, cmd: &'a Cmd) -> RedisFuture<'a, Value> {
        match self {
            Conn::Standalone(c) => c.req_packed_command(cmd),
            Conn::Cluster(c) => c.req_packed_command(cmd),
        }
    }

    fn req_packed_commands<'a>(
        &'a mut self,
        cmd: &'a Pipeline,
        offset: usize,
        count: usize,
    ) -> RedisFuture<'a, Vec<Value>> {
        match self {
            Conn::Standalone(c) => c.req_packed_commands(cmd, offset, count),
            Conn::Cluster(c) => c.req_packed_commands(cmd, offset, count),
        }
    }

    fn get_db(&self) -> i64 {
        match self {
            Conn::Standalone(c) => c.get_db(),
            Conn::Cluster(_) => 0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepProbe {
    pub exists: bool,
    pub sweep_hits: u64,
    pub created_at: Option<u64>,
}

pub struct RedisStore {
    conn: Conn,
    meta_prefix: &'static str,
    op_timeout: Duration,
    count_cache: Mutex<Option<(Instant, u64)>>,
}

fn standalone_url(config: &RedisConfig) -> String {
    let mut address = config.address.clone();
    if !address.starts_with("redis://") && !address.starts_with("rediss://") {
        address = format!("redis://{}", address);
    }
    if !config.password.is_empty() {
        // redis://:password@host:port
        if let Some(rest) = address.strip_prefix("redis://") {
            address = format!("redis://:{}@{}", config.password, rest);
        }
    }
    if config.db != 0 {
        address = format!("{}/{}", address.trim_end_matches('/'), config.db);
    }
    address
}

impl RedisStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let (conn, meta_prefix) = if config.cluster_mode() {
            let mut builder = ClusterClientBuilder::new(config.cluster_addresses.clone());
            if !config.password.is_empty() {
                builder = builder.password(config.password.clone());
            }
            let client = builder.build()?;
            let conn = tokio::time::timeout(config.connect_timeout, client.get_async_connection())
                .await
                .map_err(|_| GjallarError::Timeout)??;
            info!(
                "connected to Redis cluster ({} seed nodes)",
                config.cluster_addresses.len()
            );
            (Conn::Cluster(conn), "{dnsmeta}")
        } else {
            let client = redis::Client::open(standalone_url(config))?;
            let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
                .await
                .map_err(|_| GjallarError::Timeout)??;
            info!("connected to Redis at {}", config.address);
            (Conn::Standalone(conn), "dnsmeta")
        };

        Ok(Self {
            conn,
            meta_prefix,
            op_timeout: config.op_timeout,
            count_cache: Mutex::new(None),
        })
    }

    fn conn(&self) -> Conn {
        self.conn.clone()
    }

    async fn deadline<T, F>(&self, fut: F) -> Result<T>
    where
        F: std::future::Future<Output = redis::RedisResult<T>>,
    {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(GjallarError::Timeout),
        }
    }

    fn index_key(&self) -> String {
        format!("{}:expiry:index", self.meta_prefix)
    }

    fn refresh_key(&self, key: &CacheKey) -> String {
        format!("{}:refresh:{}", self.meta_prefix, key.redis_key())
    }

    fn hit_key(&self, redis_key: &str) -> String {
        format!("{}:hit:{}", self.meta_prefix, redis_key)
    }

    fn sweep_hit_key(&self, redis_key: &str) -> String {
        format!("{}:hit:sweep:{}", self.meta_prefix, redis_key)
    }

    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.conn();
        self.deadline(async move {
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok(pong)
        })
        .await?;
        Ok(())
    }

    /// HMGET + TTL in one pipeline. Present iff the hash exists and its
    /// Redis TTL has not run out.
    pub async fn get_with_ttl(&self, key: &CacheKey) -> Result<Option<(CacheEntry, i64)>> {
        let redis_key = key.redis_key();
        let mut conn = self.conn();

        let ((msg, soft_expiry, created_at), ttl): (
            (Option<Vec<u8>>, Option<u64>, Option<u64>),
            i64,
        ) = self
            .deadline(async move {
                redis::pipe()
                    .cmd("HMGET")
                    .arg(&redis_key)
                    .arg("msg")
                    .arg("soft_expiry")
                    .arg("created_at")
                    .cmd("TTL")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        let Some(msg) = msg else {
            return Ok(None);
        };
        if ttl <= 0 {
            return Ok(None);
        }
        let soft_expiry = soft_expiry.unwrap_or(0);
        Ok(Some((
            CacheEntry {
                msg: Bytes::from(msg),
                soft_expiry,
                created_at: created_at.unwrap_or(soft_expiry),
            },
            ttl,
        )))
    }

    /// HSET + EXPIRE + ZADD in one pipeline. `created_at` is only written if
    /// absent, so refreshes keep the first-insertion timestamp.
    pub async fn set_with_index(
        &self,
        key: &CacheKey,
        msg: &[u8],
        soft_ttl: u64,
        grace: u64,
    ) -> Result<()> {
        let redis_key = key.redis_key();
        let index_key = self.index_key();
        let now = now_unix();
        let soft_expiry = now + soft_ttl;
        let msg = msg.to_vec();
        let mut conn = self.conn();

        self.deadline(async move {
            redis::pipe()
                .cmd("HSET")
                .arg(&redis_key)
                .arg("msg")
                .arg(msg)
                .arg("soft_expiry")
                .arg(soft_expiry)
                .ignore()
                .cmd("HSETNX")
                .arg(&redis_key)
                .arg("created_at")
                .arg(now)
                .ignore()
                .cmd("EXPIRE")
                .arg(&redis_key)
                .arg((soft_ttl + grace).max(1))
                .ignore()
                .cmd("ZADD")
                .arg(&index_key)
                .arg(soft_expiry)
                .arg(&redis_key)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    /// SETNX with EX; true when this caller holds the cluster-wide lock.
    pub async fn try_acquire_refresh(&self, key: &CacheKey, ttl: Duration) -> Result<bool> {
        let lock_key = self.refresh_key(key);
        let mut conn = self.conn();
        let acquired: Option<String> = self
            .deadline(async move {
                redis::cmd("SET")
                    .arg(&lock_key)
                    .arg(1)
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(acquired.is_some())
    }

    pub async fn release_refresh(&self, key: &CacheKey) -> Result<()> {
        let lock_key = self.refresh_key(key);
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("DEL")
                .arg(&lock_key)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    pub async fn increment_hit(&self, key: &CacheKey, window: Duration) -> Result<u64> {
        self.increment_counter(self.hit_key(&key.redis_key()), window)
            .await
    }

    pub async fn increment_sweep_hit(&self, key: &CacheKey, window: Duration) -> Result<u64> {
        self.increment_counter(self.sweep_hit_key(&key.redis_key()), window)
            .await
    }

    async fn increment_counter(&self, counter_key: String, window: Duration) -> Result<u64> {
        let mut conn = self.conn();
        let (count, _): (u64, i64) = self
            .deadline(async move {
                redis::pipe()
                    .cmd("INCR")
                    .arg(&counter_key)
                    .cmd("EXPIRE")
                    .arg(&counter_key)
                    .arg(window.as_secs().max(1))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count)
    }

    pub async fn get_hit_count(&self, key: &CacheKey) -> Result<u64> {
        self.read_counter(self.hit_key(&key.redis_key())).await
    }

    pub async fn get_sweep_hit_count(&self, key: &CacheKey) -> Result<u64> {
        self.read_counter(self.sweep_hit_key(&key.redis_key())).await
    }

    async fn read_counter(&self, counter_key: String) -> Result<u64> {
        let mut conn = self.conn();
        let count: Option<u64> = self
            .deadline(async move {
                redis::cmd("GET")
                    .arg(&counter_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(count.unwrap_or(0))
    }

    /// Aggregated hit-counter deltas from the flush batcher, pipelined.
    pub async fn flush_hit_deltas(
        &self,
        deltas: &HashMap<String, (u64, u64)>,
        hit_window: Duration,
        sweep_window: Duration,
    ) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        for (redis_key, (hits, sweep_hits)) in deltas {
            if *hits > 0 {
                let counter = self.hit_key(redis_key);
                pipe.cmd("INCRBY").arg(&counter).arg(*hits).ignore();
                pipe.cmd("EXPIRE")
                    .arg(&counter)
                    .arg(hit_window.as_secs().max(1))
                    .ignore();
            }
            if *sweep_hits > 0 {
                let counter = self.sweep_hit_key(redis_key);
                pipe.cmd("INCRBY").arg(&counter).arg(*sweep_hits).ignore();
                pipe.cmd("EXPIRE")
                    .arg(&counter)
                    .arg(sweep_window.as_secs().max(1))
                    .ignore();
            }
        }

        let mut conn = self.conn();
        self.deadline(async move { pipe.query_async::<()>(&mut conn).await })
            .await
    }

    /// Members of the expiry index with `soft_expiry ≤ until`, oldest first.
    pub async fn expiry_candidates(&self, until: u64, limit: usize) -> Result<Vec<String>> {
        let index_key = self.index_key();
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("ZRANGEBYSCORE")
                .arg(&index_key)
                .arg("-inf")
                .arg(until)
                .arg("LIMIT")
                .arg(0)
                .arg(limit)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    /// Number of index members with `soft_expiry ≤ until`.
    pub async fn expiry_candidate_count(&self, until: u64) -> Result<u64> {
        let index_key = self.index_key();
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("ZCOUNT")
                .arg(&index_key)
                .arg("-inf")
                .arg(until)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    pub async fn remove_from_index(&self, redis_key: &str) -> Result<()> {
        let index_key = self.index_key();
        let member = redis_key.to_string();
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("ZREM")
                .arg(&index_key)
                .arg(&member)
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    /// ZREM + DEL in one pipeline.
    pub async fn delete_cache_key(&self, key: &CacheKey) -> Result<()> {
        let redis_key = key.redis_key();
        let index_key = self.index_key();
        let mut conn = self.conn();
        self.deadline(async move {
            redis::pipe()
                .cmd("ZREM")
                .arg(&index_key)
                .arg(&redis_key)
                .ignore()
                .cmd("DEL")
                .arg(&redis_key)
                .ignore()
                .query_async::<()>(&mut conn)
                .await
        })
        .await
    }

    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        let redis_key = key.redis_key();
        let mut conn = self.conn();
        let n: i64 = self
            .deadline(async move {
                redis::cmd("EXISTS")
                    .arg(&redis_key)
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(n > 0)
    }

    /// One pipeline probing `EXISTS`, the sweep-hit counter and `created_at`
    /// for a batch of sweep candidates.
    pub async fn sweep_probe(&self, redis_keys: &[String]) -> Result<Vec<SweepProbe>> {
        if redis_keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for redis_key in redis_keys {
            pipe.cmd("EXISTS").arg(redis_key);
            pipe.cmd("GET").arg(self.sweep_hit_key(redis_key));
            pipe.cmd("HGET").arg(redis_key).arg("created_at");
        }

        let mut conn = self.conn();
        let values: Vec<Value> = self
            .deadline(async move { pipe.query_async(&mut conn).await })
            .await?;

        let mut probes = Vec::with_capacity(redis_keys.len());
        for chunk in values.chunks(3) {
            if chunk.len() < 3 {
                break;
            }
            let exists: i64 = redis::from_redis_value(&chunk[0]).unwrap_or(0);
            let sweep_hits: Option<u64> = redis::from_redis_value(&chunk[1]).unwrap_or(None);
            let created_at: Option<u64> = redis::from_redis_value(&chunk[2]).unwrap_or(None);
            probes.push(SweepProbe {
                exists: exists > 0,
                sweep_hits: sweep_hits.unwrap_or(0),
                created_at,
            });
        }
        Ok(probes)
    }

    /// Sample the head of the expiry index and drop members whose cache key
    /// no longer exists. Index and store are only briefly inconsistent
    /// between writes; this bounds the drift.
    pub async fn reconcile_expiry_index(&self, sample: usize) -> Result<usize> {
        let index_key = self.index_key();
        let mut conn = self.conn();
        let members: Vec<String> = self
            .deadline(async move {
                redis::cmd("ZRANGE")
                    .arg(&index_key)
                    .arg(0)
                    .arg(sample as i64 - 1)
                    .query_async(&mut conn)
                    .await
            })
            .await?;

        if members.is_empty() {
            return Ok(0);
        }

        let mut pipe = redis::pipe();
        for member in &members {
            pipe.cmd("EXISTS").arg(member);
        }
        let mut conn = self.conn();
        let exists: Vec<i64> = self
            .deadline(async move { pipe.query_async(&mut conn).await })
            .await?;

        let dead: Vec<&String> = members
            .iter()
            .zip(exists.iter())
            .filter(|&(_, &e)| e == 0)
            .map(|(m, _)| m)
            .collect();
        if dead.is_empty() {
            return Ok(0);
        }

        let index_key = self.index_key();
        let mut pipe = redis::pipe();
        for member in &dead {
            pipe.cmd("ZREM").arg(&index_key).arg(member.as_str()).ignore();
        }
        let mut conn = self.conn();
        self.deadline(async move { pipe.query_async::<()>(&mut conn).await })
            .await?;

        debug!("expiry index reconcile removed {} stale members", dead.len());
        Ok(dead.len())
    }

    /// SCAN-based count of `dns:*` keys, cached for 30 seconds.
    pub async fn count_keys_by_prefix(&self) -> Result<u64> {
        if let Some((at, count)) = *self.count_cache.lock() {
            if at.elapsed() < COUNT_CACHE_TTL {
                return Ok(count);
            }
        }

        let mut cursor: u64 = 0;
        let mut count: u64 = 0;
        loop {
            let mut conn = self.conn();
            let (next, keys): (u64, Vec<String>) = self
                .deadline(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg("dns:*")
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;
            count += keys.len() as u64;
            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        *self.count_cache.lock() = Some((Instant::now(), count));
        Ok(count)
    }

    /// Delete every cached response and reset the expiry index.
    pub async fn clear_cache(&self) -> Result<()> {
        let mut cursor: u64 = 0;
        let mut removed = 0usize;
        loop {
            let mut conn = self.conn();
            let (next, keys): (u64, Vec<String>) = self
                .deadline(async move {
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg("dns:*")
                        .arg("COUNT")
                        .arg(SCAN_BATCH)
                        .query_async(&mut conn)
                        .await
                })
                .await?;

            if !keys.is_empty() {
                removed += keys.len();
                let mut conn = self.conn();
                self.deadline(async move {
                    redis::cmd("DEL").arg(&keys).query_async::<()>(&mut conn).await
                })
                .await?;
            }

            cursor = next;
            if cursor == 0 {
                break;
            }
        }

        let index_key = self.index_key();
        let mut conn = self.conn();
        self.deadline(async move {
            redis::cmd("DEL")
                .arg(&index_key)
                .query_async::<()>(&mut conn)
                .await
        })
        .await?;

        if removed > 0 {
            warn!("cleared {} cached responses from L1", removed);
        }
        Ok(())
    }
}
