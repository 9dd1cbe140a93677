//! The reactive query cache proper.

use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use folio_config::QuerySettings;
use folio_core::{CacheEntry, CacheKey, EntityType, MatchMode};

use crate::inflight::{FetchGuard, InflightRegistry};
use crate::subscription::{EventKind, Subscription, SubscriptionRegistry};

/// Fallback freshness for keys whose entity class cannot be resolved.
/// Short on purpose: an unclassifiable key should revalidate early, not
/// linger.
const FALLBACK_FRESH_FOR: Duration = Duration::from_secs(30);

/// Result of a cache read.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// Entry is within its freshness window.
    Fresh(Arc<Value>),
    /// Entry exists but is past its staleness bound. May be served under
    /// stale-while-revalidate; the caller should start a revalidation.
    Stale(Arc<Value>),
    Miss,
}

impl Lookup {
    pub fn value(&self) -> Option<&Arc<Value>> {
        match self {
            Lookup::Fresh(v) | Lookup::Stale(v) => Some(v),
            Lookup::Miss => None,
        }
    }
}

/// How an invalidation drives refetching.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchMode {
    /// Notify only keys with live subscribers; others are just marked stale.
    Active,
    /// Notify every matching key.
    All,
    /// Mark stale without notifying anyone.
    None,
}

/// A captured entry used for mutation rollback.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub key: CacheKey,
    entry: CacheEntry<Value>,
}

impl Snapshot {
    /// The value as it was at capture time.
    pub fn value(&self) -> &Arc<Value> {
        &self.entry.value
    }
}

#[derive(Debug, Default)]
struct QueryStatistics {
    hits: AtomicU64,
    stale_hits: AtomicU64,
    misses: AtomicU64,
    insertions: AtomicU64,
    rejected_writes: AtomicU64,
    invalidations: AtomicU64,
    evictions: AtomicU64,
}

/// A point-in-time snapshot of query cache statistics.
#[derive(Debug, Clone)]
pub struct QueryStatsSnapshot {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub insertions: u64,
    pub rejected_writes: u64,
    pub invalidations: u64,
    pub evictions: u64,
    pub size: usize,
}

/// In-memory, subscription-driven query cache.
pub struct QueryCache {
    entries: DashMap<CacheKey, CacheEntry<Value>>,
    subscriptions: SubscriptionRegistry,
    inflight: InflightRegistry,
    settings: QuerySettings,
    stats: QueryStatistics,
}

impl QueryCache {
    pub fn new(settings: QuerySettings) -> Self {
        Self {
            entries: DashMap::new(),
            subscriptions: SubscriptionRegistry::new(),
            inflight: InflightRegistry::new(),
            settings,
            stats: QueryStatistics::default(),
        }
    }

    fn fresh_for(&self, entity: Option<EntityType>) -> Duration {
        entity
            .map(|e| self.settings.staleness_secs.for_entity(e))
            .unwrap_or(FALLBACK_FRESH_FOR)
    }

    /// Read a key. Stale entries are returned as [`Lookup::Stale`]; the
    /// caller decides whether to serve them while revalidating.
    pub fn get(&self, key: &CacheKey) -> Lookup {
        match self.entries.get(key) {
            Some(entry) if entry.is_fresh() => {
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Fresh(Arc::clone(&entry.value))
            }
            Some(entry) => {
                self.stats.stale_hits.fetch_add(1, Ordering::Relaxed);
                Lookup::Stale(Arc::clone(&entry.value))
            }
            None => {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                Lookup::Miss
            }
        }
    }

    /// Write an authoritative value.
    ///
    /// Version-gated: a write older than the cached version is discarded,
    /// so concurrent responses reconcile by source version, never by
    /// whichever network call completed last. Returns whether the write
    /// was accepted.
    pub fn set(&self, key: &CacheKey, value: Value, version: u64) -> bool {
        if let Some(existing) = self.entries.get(key) {
            if existing.version > version {
                tracing::debug!(
                    key = %key,
                    cached = existing.version,
                    incoming = version,
                    "rejected write older than cached version"
                );
                self.stats.rejected_writes.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        let fresh_for = self.fresh_for(key.entity_type());
        self.entries
            .insert(key.clone(), CacheEntry::new(key.clone(), value, fresh_for, version));
        self.stats.insertions.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.notify(key, EventKind::Updated);
        self.evict_if_over_capacity();
        true
    }

    /// Replace the value of an existing entry in place, keeping its
    /// version and freshness window. This is the optimistic-mutation
    /// patch: the authoritative version arrives later via invalidation
    /// and refetch.
    pub fn patch(&self, key: &CacheKey, value: Value) -> bool {
        let Some(mut entry) = self.entries.get_mut(key) else {
            return false;
        };
        entry.value = Arc::new(value);
        drop(entry);
        self.subscriptions.notify(key, EventKind::Updated);
        true
    }

    /// Capture every cached entry under `root` (prefix match), for
    /// rollback. The same predicate must be reused for the optimistic
    /// apply, the invalidate and the restore.
    pub fn snapshot_prefix(&self, root: &CacheKey) -> Vec<Snapshot> {
        self.entries
            .iter()
            .filter(|entry| root.is_prefix_of(entry.key()))
            .map(|entry| Snapshot {
                key: entry.key().clone(),
                entry: entry.value().clone(),
            })
            .collect()
    }

    /// Restore snapshots captured by [`snapshot_prefix`].
    ///
    /// A snapshot whose key was evicted in the meantime is dropped
    /// silently and marked for refetch instead of failing the whole
    /// rollback. Returns the keys that were dropped.
    ///
    /// [`snapshot_prefix`]: QueryCache::snapshot_prefix
    pub fn restore(&self, snapshots: Vec<Snapshot>) -> Vec<CacheKey> {
        let mut dropped = Vec::new();
        for snapshot in snapshots {
            match self.entries.get_mut(&snapshot.key) {
                Some(mut current) => {
                    *current = snapshot.entry;
                    drop(current);
                    self.subscriptions.notify(&snapshot.key, EventKind::Updated);
                }
                None => {
                    tracing::debug!(key = %snapshot.key, "rollback target evicted, marking for refetch");
                    self.subscriptions.notify(&snapshot.key, EventKind::Invalidated);
                    dropped.push(snapshot.key);
                }
            }
        }
        dropped
    }

    /// Invalidate matching entries: mark them stale, abandon their
    /// in-flight fetches, and notify subscribers per `refetch`. Returns
    /// the affected keys.
    pub fn invalidate(
        &self,
        target: &CacheKey,
        mode: MatchMode,
        refetch: RefetchMode,
    ) -> Vec<CacheKey> {
        let keys = self.matching_keys(target, mode);
        for key in &keys {
            if let Some(mut entry) = self.entries.get_mut(key) {
                entry.mark_stale();
            }
            self.inflight.abandon(key);
            match refetch {
                RefetchMode::All => {
                    self.subscriptions.notify(key, EventKind::Invalidated);
                }
                RefetchMode::Active => {
                    if self.subscriptions.has_subscriber_for(key) {
                        self.subscriptions.notify(key, EventKind::Invalidated);
                    }
                }
                RefetchMode::None => {}
            }
        }
        self.stats
            .invalidations
            .fetch_add(keys.len() as u64, Ordering::Relaxed);
        tracing::debug!(target = %target, count = keys.len(), "invalidated query cache keys");
        keys
    }

    /// Abandon in-flight fetches for matching keys without touching the
    /// cached values.
    pub fn cancel_inflight(&self, target: &CacheKey, mode: MatchMode) {
        for key in self.matching_keys(target, mode) {
            self.inflight.abandon(&key);
        }
        // Also cover keys that are being fetched but not yet cached.
        if matches!(mode, MatchMode::Prefix) {
            self.inflight.abandon(target);
        }
    }

    /// Abandon every in-flight fetch across the cache. Results of fetches
    /// started before this call are discarded on completion.
    pub fn cancel_all_inflight(&self) {
        self.inflight.clear();
    }

    /// Remove everything. Used by the identity boundary; cheap and safe
    /// to fully clear. Every removed key notifies its subscribers.
    pub fn clear(&self) {
        let keys: Vec<CacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        self.entries.clear();
        self.inflight.clear();
        for key in keys {
            self.subscriptions.notify(&key, EventKind::Removed);
        }
        tracing::debug!("query cache cleared");
    }

    /// Subscribe to changes of one key or a whole subtree.
    pub fn subscribe(&self, target: CacheKey, mode: MatchMode) -> Subscription {
        self.subscriptions.subscribe(target, mode)
    }

    pub fn unsubscribe(&self, subscription: &Subscription) {
        self.subscriptions.unsubscribe(&subscription.id);
    }

    /// Begin a fetch for `key`. `None` means one is already in flight:
    /// exactly one background revalidation per key.
    pub fn begin_fetch(&self, key: &CacheKey) -> Option<FetchGuard> {
        self.inflight.begin(key)
    }

    /// Complete a fetch. If the key's generation moved while the fetch
    /// was in flight (invalidated, cancelled, purged), the result is
    /// discarded. Returns whether the value was written.
    pub fn complete_fetch(&self, guard: FetchGuard, value: Value, version: u64) -> bool {
        self.inflight.finish(&guard);
        if !self.inflight.is_current(&guard) {
            tracing::debug!(key = %guard.key, "discarding fetch result superseded by invalidation");
            return false;
        }
        self.set(&guard.key, value, version)
    }

    /// Abort a fetch that failed; the in-flight marker is released.
    pub fn abort_fetch(&self, guard: FetchGuard) {
        self.inflight.finish(&guard);
    }

    pub fn is_inflight(&self, key: &CacheKey) -> bool {
        self.inflight.is_inflight(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> QueryStatsSnapshot {
        QueryStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            stale_hits: self.stats.stale_hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            insertions: self.stats.insertions.load(Ordering::Relaxed),
            rejected_writes: self.stats.rejected_writes.load(Ordering::Relaxed),
            invalidations: self.stats.invalidations.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }

    fn matching_keys(&self, target: &CacheKey, mode: MatchMode) -> Vec<CacheKey> {
        self.entries
            .iter()
            .filter(|entry| target.matches(entry.key(), mode))
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Over capacity: drop stale entries first, then oldest by creation.
    fn evict_if_over_capacity(&self) {
        if self.entries.len() <= self.settings.max_entries {
            return;
        }

        let mut stale: Vec<CacheKey> = Vec::new();
        let mut by_age: Vec<(std::time::Instant, CacheKey)> = Vec::new();
        for entry in self.entries.iter() {
            if entry.is_stale() {
                stale.push(entry.key().clone());
            } else {
                by_age.push((entry.created_at, entry.key().clone()));
            }
        }

        for key in stale {
            if self.entries.len() <= self.settings.max_entries {
                return;
            }
            self.remove_for_eviction(&key);
        }

        by_age.sort_by_key(|(created_at, _)| *created_at);
        for (_, key) in by_age {
            if self.entries.len() <= self.settings.max_entries {
                return;
            }
            self.remove_for_eviction(&key);
        }
    }

    fn remove_for_eviction(&self, key: &CacheKey) {
        if self.entries.remove(key).is_some() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            self.subscriptions.notify(key, EventKind::Removed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{KeySchema, UserId};
    use serde_json::json;

    fn cache() -> QueryCache {
        QueryCache::new(QuerySettings::default())
    }

    fn schema() -> KeySchema {
        KeySchema::new()
    }

    #[test]
    fn test_get_set_round_trip() {
        let cache = cache();
        let key = schema().detail(EntityType::Book, None, "b1").unwrap();
        assert!(matches!(cache.get(&key), Lookup::Miss));

        cache.set(&key, json!({"id": "b1"}), 1);
        match cache.get(&key) {
            Lookup::Fresh(v) => assert_eq!(v["id"], "b1"),
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn test_older_version_rejected() {
        let cache = cache();
        let key = schema().detail(EntityType::Book, None, "b1").unwrap();
        assert!(cache.set(&key, json!({"rev": 2}), 20));
        assert!(!cache.set(&key, json!({"rev": 1}), 10));

        match cache.get(&key) {
            Lookup::Fresh(v) => assert_eq!(v["rev"], 2),
            other => panic!("expected fresh hit, got {other:?}"),
        }
    }

    #[test]
    fn test_invalidate_prefix_marks_all_variants_stale() {
        let cache = cache();
        let user = UserId::from("alice");
        let root = schema().entity_root(EntityType::Progress, Some(&user)).unwrap();
        let page1 = schema()
            .collection(EntityType::Progress, Some(&user), &[("page", "1")])
            .unwrap();
        let page2 = schema()
            .collection(EntityType::Progress, Some(&user), &[("page", "2")])
            .unwrap();
        cache.set(&page1, json!([1]), 1);
        cache.set(&page2, json!([2]), 1);

        let affected = cache.invalidate(&root, MatchMode::Prefix, RefetchMode::None);
        assert_eq!(affected.len(), 2);
        assert!(matches!(cache.get(&page1), Lookup::Stale(_)));
        assert!(matches!(cache.get(&page2), Lookup::Stale(_)));
    }

    #[test]
    fn test_invalidate_exact_leaves_siblings_fresh() {
        let cache = cache();
        let b1 = schema().detail(EntityType::Book, None, "b1").unwrap();
        let b2 = schema().detail(EntityType::Book, None, "b2").unwrap();
        cache.set(&b1, json!(1), 1);
        cache.set(&b2, json!(2), 1);

        cache.invalidate(&b1, MatchMode::Exact, RefetchMode::None);
        assert!(matches!(cache.get(&b1), Lookup::Stale(_)));
        assert!(matches!(cache.get(&b2), Lookup::Fresh(_)));
    }

    #[tokio::test]
    async fn test_superseded_fetch_result_is_discarded() {
        let cache = cache();
        let key = schema().detail(EntityType::Book, None, "b1").unwrap();
        cache.set(&key, json!({"state": "old"}), 1);

        let guard = cache.begin_fetch(&key).unwrap();
        // An invalidation lands while the fetch is in flight.
        cache.invalidate(&key, MatchMode::Exact, RefetchMode::None);

        assert!(!cache.complete_fetch(guard, json!({"state": "slow-stale"}), 2));
        match cache.get(&key) {
            Lookup::Stale(v) => assert_eq!(v["state"], "old"),
            other => panic!("expected stale old value, got {other:?}"),
        }
    }

    #[test]
    fn test_single_background_revalidation_per_key() {
        let cache = cache();
        let key = schema().detail(EntityType::Book, None, "b1").unwrap();
        let guard = cache.begin_fetch(&key).unwrap();
        assert!(cache.begin_fetch(&key).is_none());
        cache.abort_fetch(guard);
        assert!(cache.begin_fetch(&key).is_some());
    }

    #[test]
    fn test_snapshot_and_restore_round_trip() {
        let cache = cache();
        let user = UserId::from("alice");
        let root = schema().entity_root(EntityType::Progress, Some(&user)).unwrap();
        let page1 = schema()
            .collection(EntityType::Progress, Some(&user), &[("page", "1")])
            .unwrap();
        cache.set(&page1, json!(["b1", "b2"]), 5);

        let snapshots = cache.snapshot_prefix(&root);
        assert_eq!(snapshots.len(), 1);

        cache.patch(&page1, json!(["b2"]));
        match cache.get(&page1) {
            Lookup::Fresh(v) => assert_eq!(*v, json!(["b2"])),
            other => panic!("unexpected {other:?}"),
        }

        let dropped = cache.restore(snapshots);
        assert!(dropped.is_empty());
        match cache.get(&page1) {
            Lookup::Fresh(v) => assert_eq!(*v, json!(["b1", "b2"])),
            other => panic!("unexpected {other:?}"),
        }
        // The restored entry keeps its pre-mutation version.
        assert!(!cache.set(&page1, json!("older"), 4));
    }

    #[test]
    fn test_restore_drops_evicted_keys() {
        let cache = cache();
        let key = schema().detail(EntityType::Book, None, "b1").unwrap();
        cache.set(&key, json!(1), 1);

        let snapshots = cache.snapshot_prefix(&key);
        cache.clear();

        let dropped = cache.restore(snapshots);
        assert_eq!(dropped, vec![key]);
    }

    #[test]
    fn test_capacity_eviction_prefers_stale_entries() {
        let mut settings = QuerySettings::default();
        settings.max_entries = 2;
        let cache = QueryCache::new(settings);

        let b1 = schema().detail(EntityType::Book, None, "b1").unwrap();
        let b2 = schema().detail(EntityType::Book, None, "b2").unwrap();
        let b3 = schema().detail(EntityType::Book, None, "b3").unwrap();
        cache.set(&b1, json!(1), 1);
        cache.invalidate(&b1, MatchMode::Exact, RefetchMode::None);
        cache.set(&b2, json!(2), 1);
        cache.set(&b3, json!(3), 1);

        assert!(cache.len() <= 2);
        assert!(matches!(cache.get(&b1), Lookup::Miss));
        assert!(matches!(cache.get(&b3), Lookup::Fresh(_)));
    }
}
