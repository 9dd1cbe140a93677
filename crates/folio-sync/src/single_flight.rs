//! Per-key single-flight locking for the shared remote cache.

use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use folio_core::{CacheError, CacheKey, Result};
use folio_remote::RemoteCache;

/// Expiry on the cross-instance advisory lock, so a crashed holder cannot
/// wedge a key forever.
const REMOTE_LOCK_TTL: Duration = Duration::from_secs(10);

/// Poll interval while waiting on another instance's lock.
const REMOTE_LOCK_POLL: Duration = Duration::from_millis(50);

/// Stampede guard: when a hot key expires under concurrent load, exactly
/// one caller recomputes it; the rest block on the per-key lock and read
/// the populated value.
///
/// Locks are scoped per key, so contention on one key never serializes
/// unrelated keys. Lock entries are dropped once the last holder
/// releases; the map does not grow without bound.
pub struct SingleFlight {
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_timeout: Duration,
}

impl SingleFlight {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            locks: DashMap::new(),
            lock_timeout,
        }
    }

    /// Fetch-through read with stampede protection.
    ///
    /// Check the cache; on miss, acquire the per-key lock with a bounded
    /// wait, re-check the cache (double-checked pattern), and only on a
    /// confirmed miss invoke `fetch` exactly once and populate the cache.
    ///
    /// A lock wait that exceeds the bound falls through to an uncached
    /// direct fetch instead of deadlocking; the caller is never failed on
    /// the lock alone.
    pub async fn get_or_populate<F, Fut>(
        &self,
        cache: &RemoteCache,
        key: &CacheKey,
        ttl: Duration,
        fetch: F,
    ) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let rendered = key.render();

        if let Some(hit) = cache.get(&rendered).await {
            return Ok(hit);
        }

        let lock = self
            .locks
            .entry(rendered.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let acquired = tokio::time::timeout(self.lock_timeout, lock.lock()).await;
        if acquired.is_err() {
            drop(acquired);
            let timeout = CacheError::LockTimeout { key: key.clone() };
            tracing::warn!(error = %timeout, "single-flight lock wait timed out, bypassing cache");
            self.release(&rendered, lock);
            return fetch().await.map(Arc::new);
        }
        let guard = acquired.unwrap();

        // Double-check: another caller may have populated while we waited.
        if let Some(hit) = cache.get(&rendered).await {
            drop(guard);
            self.release(&rendered, lock);
            return Ok(hit);
        }

        // Cross-instance exclusion. The local mutex covers this process;
        // in Redis mode another instance may already be computing, so
        // poll the advisory lock and re-check the cache until the wait
        // bound, then fall through to a direct fetch.
        let lock_key = format!("{rendered}:lock");
        let deadline = tokio::time::Instant::now() + self.lock_timeout;
        let mut holding_remote_lock = cache.acquire_lock(&lock_key, REMOTE_LOCK_TTL).await;
        while !holding_remote_lock {
            if tokio::time::Instant::now() >= deadline {
                let timeout = CacheError::LockTimeout { key: key.clone() };
                tracing::warn!(error = %timeout, "cross-instance lock wait timed out, bypassing cache");
                drop(guard);
                self.release(&rendered, lock);
                return fetch().await.map(Arc::new);
            }
            tokio::time::sleep(REMOTE_LOCK_POLL).await;
            if let Some(hit) = cache.get(&rendered).await {
                drop(guard);
                self.release(&rendered, lock);
                return Ok(hit);
            }
            holding_remote_lock = cache.acquire_lock(&lock_key, REMOTE_LOCK_TTL).await;
        }

        let result = fetch().await;
        let outcome = match result {
            Ok(value) => {
                cache.set_with_ttl(&rendered, value.clone(), ttl).await;
                Ok(Arc::new(value))
            }
            Err(e) => Err(e),
        };

        cache.release_lock(&lock_key).await;
        drop(guard);
        self.release(&rendered, lock);
        outcome
    }

    /// Drop the lock entry when no other caller holds or awaits it.
    fn release(&self, rendered: &str, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks
            .remove_if(rendered, |_, held| Arc::strong_count(held) == 1);
    }

    /// Number of keys currently locked or awaited.
    pub fn active_locks(&self) -> usize {
        self.locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityType, KeySchema};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(id: &str) -> CacheKey {
        KeySchema::new().detail(EntityType::Book, None, id).unwrap()
    }

    #[tokio::test]
    async fn test_concurrent_misses_fetch_once() {
        let cache = RemoteCache::new_local();
        let guard = Arc::new(SingleFlight::new(Duration::from_secs(2)));
        let calls = Arc::new(AtomicUsize::new(0));
        let k = key("b1");

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let guard = Arc::clone(&guard);
            let calls = Arc::clone(&calls);
            let k = k.clone();
            handles.push(tokio::spawn(async move {
                guard
                    .get_or_populate(&cache, &k, Duration::from_secs(60), move || {
                        let calls = Arc::clone(&calls);
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(b"value".to_vec())
                        }
                    })
                    .await
                    .unwrap()
            }));
        }

        for handle in handles {
            assert_eq!(&*handle.await.unwrap(), b"value");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(guard.active_locks(), 0);
    }

    #[tokio::test]
    async fn test_lock_timeout_falls_through_to_direct_fetch() {
        let cache = RemoteCache::new_local();
        let guard = Arc::new(SingleFlight::new(Duration::from_millis(20)));
        let k = key("b1");

        // First caller holds the lock well past the second caller's bound.
        let slow = {
            let cache = cache.clone();
            let guard = Arc::clone(&guard);
            let k = k.clone();
            tokio::spawn(async move {
                guard
                    .get_or_populate(&cache, &k, Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        Ok(b"slow".to_vec())
                    })
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let direct = guard
            .get_or_populate(&cache, &k, Duration::from_secs(60), || async {
                Ok(b"direct".to_vec())
            })
            .await
            .unwrap();

        assert_eq!(&*direct, b"direct");
        assert_eq!(&*slow.await.unwrap(), b"slow");
    }

    #[tokio::test]
    async fn test_unrelated_keys_do_not_contend() {
        let cache = RemoteCache::new_local();
        let guard = Arc::new(SingleFlight::new(Duration::from_millis(50)));

        let blocked = {
            let cache = cache.clone();
            let guard = Arc::clone(&guard);
            tokio::spawn(async move {
                guard
                    .get_or_populate(&cache, &key("b1"), Duration::from_secs(60), || async {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(b"one".to_vec())
                    })
                    .await
                    .unwrap()
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // A different key completes immediately despite the held lock.
        let other = guard
            .get_or_populate(&cache, &key("b2"), Duration::from_secs(60), || async {
                Ok(b"two".to_vec())
            })
            .await
            .unwrap();
        assert_eq!(&*other, b"two");
        assert_eq!(&*blocked.await.unwrap(), b"one");
    }
}
