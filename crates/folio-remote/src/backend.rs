//! Remote cache backend with a local tier and an optional Redis tier.

use dashmap::DashMap;
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::pubsub::INVALIDATE_CHANNEL;

/// TTL applied to entries promoted from Redis into the local tier. Redis
/// keeps the authoritative expiry; the local copy only needs to survive a
/// burst of reads.
const LOCAL_PROMOTE_TTL: Duration = Duration::from_secs(60);

/// A cached entry with TTL support.
///
/// The data is wrapped in `Arc` to allow cheap cloning on cache hits.
#[derive(Clone, Debug)]
pub struct RemoteEntry {
    pub data: Arc<Vec<u8>>,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl RemoteEntry {
    pub fn new(data: Vec<u8>, ttl: Duration) -> Self {
        Self {
            data: Arc::new(data),
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Shared remote cache.
///
/// - **Local**: single-instance mode using only the in-process map
/// - **Redis**: multi-instance mode with a local tier in front of Redis
#[derive(Clone)]
pub enum RemoteCache {
    /// Single-instance: local map only.
    Local(Arc<DashMap<String, RemoteEntry>>),

    /// Multi-instance: Redis plus a local front tier.
    Redis {
        redis: Pool,
        local: Arc<DashMap<String, RemoteEntry>>,
    },
}

impl RemoteCache {
    /// Create a new local-only cache.
    pub fn new_local() -> Self {
        RemoteCache::Local(Arc::new(DashMap::new()))
    }

    /// Create a new Redis-backed cache.
    pub fn new_redis(redis_pool: Pool) -> Self {
        RemoteCache::Redis {
            redis: redis_pool,
            local: Arc::new(DashMap::new()),
        }
    }

    fn local(&self) -> &Arc<DashMap<String, RemoteEntry>> {
        match self {
            RemoteCache::Local(map) => map,
            RemoteCache::Redis { local, .. } => local,
        }
    }

    /// Get a value. Checks the local tier first, then Redis; a Redis hit
    /// is promoted into the local tier. Any Redis failure degrades to a
    /// miss.
    pub async fn get(&self, key: &str) -> Option<Arc<Vec<u8>>> {
        if let Some(entry) = self.local().get(key) {
            if !entry.is_expired() {
                tracing::debug!(key = %key, "remote cache hit (local)");
                return Some(Arc::clone(&entry.data));
            }
            drop(entry);
            self.local().remove(key);
        }

        let RemoteCache::Redis { redis, local } = self else {
            tracing::debug!(key = %key, "remote cache miss");
            return None;
        };

        match redis.get().await {
            Ok(mut conn) => match conn.get::<_, Option<Vec<u8>>>(key).await {
                Ok(Some(data)) => {
                    tracing::debug!(key = %key, "remote cache hit (redis)");
                    let entry = RemoteEntry::new(data, LOCAL_PROMOTE_TTL);
                    let data_arc = Arc::clone(&entry.data);
                    local.insert(key.to_string(), entry);
                    Some(data_arc)
                }
                Ok(None) => {
                    tracing::debug!(key = %key, "remote cache miss");
                    None
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "redis GET error");
                    None
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, "failed to get redis connection");
                None
            }
        }
    }

    /// Set a value with TTL. The local tier is written synchronously; the
    /// Redis write is fire-and-forget and never fails the caller.
    pub async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let entry = RemoteEntry::new(value, ttl);
        let data_for_redis = Arc::clone(&entry.data);
        self.local().insert(key.to_string(), entry);

        if let RemoteCache::Redis { redis, .. } = self {
            let redis = redis.clone();
            let key = key.to_string();
            let ttl_secs = ttl.as_secs().max(1);
            tokio::spawn(async move {
                if let Ok(mut conn) = redis.get().await {
                    if let Err(e) = conn
                        .set_ex::<_, _, ()>(&key, &*data_for_redis, ttl_secs)
                        .await
                    {
                        tracing::warn!(key = %key, error = %e, "redis SET error");
                    }
                }
            });
        }
    }

    /// Delete one key. Removes it from the local tier, then best-effort
    /// from Redis, and publishes the invalidation to other instances.
    pub async fn delete(&self, key: &str) {
        self.local().remove(key);

        if let RemoteCache::Redis { redis, .. } = self {
            let redis = redis.clone();
            let key = key.to_string();
            tokio::spawn(async move {
                if let Ok(mut conn) = redis.get().await {
                    if let Err(e) = conn.del::<_, ()>(&key).await {
                        tracing::warn!(key = %key, error = %e, "redis DEL error");
                    }
                    if let Err(e) = conn.publish::<_, _, ()>(INVALIDATE_CHANNEL, &key).await {
                        tracing::warn!(key = %key, error = %e, "redis PUBLISH error");
                    }
                }
            });
        }
    }

    /// Delete every key starting with `prefix` and return how many keys
    /// were removed from the tiers this instance can see.
    ///
    /// This is the only sanctioned write-path invalidation: callers pass
    /// an entity root's rendered prefix, never an enumeration of live
    /// qualifier combinations. Redis unavailability degrades to a local
    /// deletion with a warning; the caller's write path never fails.
    pub async fn delete_by_prefix(&self, prefix: &str) -> u64 {
        let local = self.local();
        let before = local.len();
        local.retain(|key, _| !key.starts_with(prefix));
        let mut removed = (before - local.len()) as u64;

        if let RemoteCache::Redis { redis, .. } = self {
            match redis.get().await {
                Ok(mut conn) => {
                    removed += scan_and_delete(&mut conn, prefix).await;
                    if let Err(e) = conn
                        .publish::<_, _, ()>(INVALIDATE_CHANNEL, prefix)
                        .await
                    {
                        tracing::warn!(prefix = %prefix, error = %e, "redis PUBLISH error");
                    }
                }
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, "redis unavailable for prefix delete");
                }
            }
        }

        tracing::debug!(prefix = %prefix, removed, "remote cache prefix delete");
        removed
    }

    /// Try to take a cross-instance advisory lock (`SET NX EX`).
    ///
    /// Local mode always succeeds: a process-local mutex is the only
    /// exclusion needed for a single instance. Redis errors also report
    /// success: with the shared tier down there is nothing to stampede,
    /// and the caller still holds its process-local lock.
    pub async fn acquire_lock(&self, lock_key: &str, ttl: Duration) -> bool {
        let RemoteCache::Redis { redis, .. } = self else {
            return true;
        };
        match redis.get().await {
            Ok(mut conn) => {
                let reply: Result<Option<String>, _> = redis::cmd("SET")
                    .arg(lock_key)
                    .arg("1")
                    .arg("NX")
                    .arg("EX")
                    .arg(ttl.as_secs().max(1))
                    .query_async(&mut conn)
                    .await;
                match reply {
                    Ok(Some(_)) => true,
                    Ok(None) => false,
                    Err(e) => {
                        tracing::warn!(lock_key = %lock_key, error = %e, "redis lock error, proceeding unlocked");
                        true
                    }
                }
            }
            Err(e) => {
                tracing::warn!(lock_key = %lock_key, error = %e, "redis unavailable for lock, proceeding unlocked");
                true
            }
        }
    }

    /// Release a lock taken with [`acquire_lock`]. Best-effort; an
    /// unreleased lock expires with its TTL.
    ///
    /// [`acquire_lock`]: RemoteCache::acquire_lock
    pub async fn release_lock(&self, lock_key: &str) {
        if let RemoteCache::Redis { redis, .. } = self {
            let redis = redis.clone();
            let lock_key = lock_key.to_string();
            tokio::spawn(async move {
                if let Ok(mut conn) = redis.get().await {
                    if let Err(e) = conn.del::<_, ()>(&lock_key).await {
                        tracing::warn!(lock_key = %lock_key, error = %e, "redis lock release error");
                    }
                }
            });
        }
    }

    /// Liveness probe. Local mode is always live; Redis mode pings the
    /// server.
    pub async fn ping(&self) -> bool {
        match self {
            RemoteCache::Local(_) => true,
            RemoteCache::Redis { redis, .. } => match redis.get().await {
                Ok(mut conn) => redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .is_ok(),
                Err(_) => false,
            },
        }
    }

    /// Cache statistics (local tier only).
    pub fn stats(&self) -> RemoteStats {
        RemoteStats {
            local_entries: self.local().len(),
            mode: match self {
                RemoteCache::Local(_) => "local",
                RemoteCache::Redis { .. } => "redis",
            },
        }
    }
}

/// SCAN+DEL cursor loop; errors degrade to a warning and a partial count.
async fn scan_and_delete(conn: &mut deadpool_redis::Connection, prefix: &str) -> u64 {
    let pattern = format!("{prefix}*");
    let mut cursor: u64 = 0;
    let mut removed = 0u64;
    loop {
        let reply: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(100)
            .query_async(conn)
            .await;
        let (next, keys) = match reply {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!(prefix = %prefix, error = %e, "redis SCAN error");
                return removed;
            }
        };
        if !keys.is_empty() {
            match conn.del::<_, u64>(&keys).await {
                Ok(deleted) => removed += deleted,
                Err(e) => {
                    tracing::warn!(prefix = %prefix, error = %e, "redis DEL error");
                    return removed;
                }
            }
        }
        cursor = next;
        if cursor == 0 {
            break;
        }
    }
    removed
}

/// Remote cache statistics.
#[derive(Debug, Clone)]
pub struct RemoteStats {
    pub local_entries: usize,
    pub mode: &'static str,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_round_trip() {
        let cache = RemoteCache::new_local();
        cache
            .set_with_ttl("folio:g:book:item:b1", b"data".to_vec(), Duration::from_secs(60))
            .await;

        let got = cache.get("folio:g:book:item:b1").await.unwrap();
        assert_eq!(&*got, b"data");
        assert!(cache.ping().await);
    }

    #[tokio::test]
    async fn test_expired_entry_is_a_miss() {
        let cache = RemoteCache::new_local();
        cache
            .set_with_ttl("folio:g:book:item:b1", b"data".to_vec(), Duration::ZERO)
            .await;
        tokio::time::sleep(Duration::from_millis(5)).await;

        assert!(cache.get("folio:g:book:item:b1").await.is_none());
    }

    #[tokio::test]
    async fn test_delete_by_prefix_scopes_to_prefix() {
        let cache = RemoteCache::new_local();
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("folio:u.alice:progress:list:page=1", b"1".to_vec(), ttl).await;
        cache.set_with_ttl("folio:u.alice:progress:list:page=2", b"2".to_vec(), ttl).await;
        cache.set_with_ttl("folio:u.alice:stats:item:total", b"3".to_vec(), ttl).await;

        let removed = cache.delete_by_prefix("folio:u.alice:progress:").await;
        assert_eq!(removed, 2);
        assert!(cache.get("folio:u.alice:stats:item:total").await.is_some());
    }

    #[tokio::test]
    async fn test_user_namespace_purge() {
        let cache = RemoteCache::new_local();
        let ttl = Duration::from_secs(60);
        cache.set_with_ttl("folio:u.alice:progress:item:b1", b"1".to_vec(), ttl).await;
        cache.set_with_ttl("folio:g:book:item:b1", b"2".to_vec(), ttl).await;

        assert_eq!(cache.delete_by_prefix("folio:u.alice:").await, 1);
        // Shared entries survive an identity purge.
        assert!(cache.get("folio:g:book:item:b1").await.is_some());
    }
}
