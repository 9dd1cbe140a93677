//! In-flight fetch tracking with per-key generations.
//!
//! Each key carries a generation counter. A fetch records the generation
//! it started under; invalidation and cancellation bump the counter, so a
//! completion against a superseded generation is detectably stale and its
//! result is discarded instead of written into the cache.

use dashmap::DashMap;

use folio_core::CacheKey;

/// Token handed out for one in-flight fetch.
///
/// Consumed by `QueryCache::complete_fetch` / `abort_fetch`.
#[derive(Debug)]
pub struct FetchGuard {
    pub(crate) key: CacheKey,
    pub(crate) generation: u64,
}

impl FetchGuard {
    pub fn key(&self) -> &CacheKey {
        &self.key
    }
}

#[derive(Default)]
pub(crate) struct InflightRegistry {
    generations: DashMap<CacheKey, u64>,
    inflight: DashMap<CacheKey, u64>,
}

impl InflightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generation(&self, key: &CacheKey) -> u64 {
        self.generations.get(key).map(|g| *g).unwrap_or(0)
    }

    /// Begin a fetch. Returns `None` if one is already in flight for this
    /// key: the single-flight rule for background revalidation.
    pub fn begin(&self, key: &CacheKey) -> Option<FetchGuard> {
        use dashmap::mapref::entry::Entry;

        let generation = self.generation(key);
        match self.inflight.entry(key.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(generation);
                Some(FetchGuard {
                    key: key.clone(),
                    generation,
                })
            }
        }
    }

    /// Whether the guard's fetch is still current.
    pub fn is_current(&self, guard: &FetchGuard) -> bool {
        self.generation(&guard.key) == guard.generation
    }

    /// Drop the in-flight marker for a finished fetch.
    pub fn finish(&self, guard: &FetchGuard) {
        self.inflight.remove(&guard.key);
    }

    /// Whether a fetch is currently in flight for `key`.
    pub fn is_inflight(&self, key: &CacheKey) -> bool {
        self.inflight.contains_key(key)
    }

    /// Abandon any in-flight fetch for `key`: the generation moves, so a
    /// late completion is discarded.
    pub fn abandon(&self, key: &CacheKey) {
        *self.generations.entry(key.clone()).or_insert(0) += 1;
        self.inflight.remove(key);
    }

    /// Forget per-key state entirely (used by full purges).
    pub fn clear(&self) {
        // Generations must survive a purge: bump instead of dropping, so
        // fetches started before the purge still fail the currency check.
        for mut entry in self.generations.iter_mut() {
            *entry += 1;
        }
        for entry in self.inflight.iter() {
            self.generations
                .entry(entry.key().clone())
                .and_modify(|g| *g += 1)
                .or_insert(1);
        }
        self.inflight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityType, KeySchema};

    fn key(id: &str) -> CacheKey {
        KeySchema::new().detail(EntityType::Book, None, id).unwrap()
    }

    #[test]
    fn test_second_begin_is_refused() {
        let registry = InflightRegistry::new();
        let k = key("b1");
        let guard = registry.begin(&k).unwrap();
        assert!(registry.begin(&k).is_none());

        registry.finish(&guard);
        assert!(registry.begin(&k).is_some());
    }

    #[test]
    fn test_abandon_supersedes_inflight_fetch() {
        let registry = InflightRegistry::new();
        let k = key("b1");
        let guard = registry.begin(&k).unwrap();

        registry.abandon(&k);
        assert!(!registry.is_current(&guard));
        // A new fetch may start and is current.
        let guard2 = registry.begin(&k).unwrap();
        assert!(registry.is_current(&guard2));
    }

    #[test]
    fn test_clear_supersedes_all_inflight() {
        let registry = InflightRegistry::new();
        let g1 = registry.begin(&key("b1")).unwrap();
        let g2 = registry.begin(&key("b2")).unwrap();

        registry.clear();
        assert!(!registry.is_current(&g1));
        assert!(!registry.is_current(&g2));
    }
}
