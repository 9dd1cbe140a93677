//! Cache entry model shared by the in-memory tiers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::key::CacheKey;

/// A cached value with freshness bounds and a version gate.
///
/// The value is wrapped in `Arc` to allow cheap cloning on cache hits,
/// avoiding copies of potentially large payloads.
///
/// `stale_at >= created_at` holds by construction. An entry past
/// `stale_at` may still be served under an explicit
/// stale-while-revalidate policy, but never as fresh.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub key: CacheKey,
    pub value: Arc<T>,
    pub created_at: Instant,
    pub stale_at: Instant,
    /// Monotonic version from the authoritative source. Writes carrying an
    /// older version than the cached one are rejected, so a slow response
    /// can never overwrite a newer cached state.
    pub version: u64,
}

impl<T> CacheEntry<T> {
    /// Create an entry that stays fresh for `fresh_for`.
    pub fn new(key: CacheKey, value: T, fresh_for: Duration, version: u64) -> Self {
        let created_at = Instant::now();
        Self {
            key,
            value: Arc::new(value),
            created_at,
            stale_at: created_at + fresh_for,
            version,
        }
    }

    pub fn is_fresh(&self) -> bool {
        Instant::now() < self.stale_at
    }

    pub fn is_stale(&self) -> bool {
        !self.is_fresh()
    }

    /// Force the entry stale so the next read revalidates.
    pub fn mark_stale(&mut self) {
        self.stale_at = self.created_at;
    }
}

/// Convert an authoritative `updated_at` timestamp into a version number.
///
/// Unix milliseconds: monotonic per entity as long as the source clock is,
/// and directly comparable across tiers.
pub fn version_from_timestamp(updated_at: time::OffsetDateTime) -> u64 {
    let millis = updated_at.unix_timestamp_nanos() / 1_000_000;
    u64::try_from(millis).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityType;
    use crate::key::KeySchema;

    #[test]
    fn test_freshness_window() {
        let key = KeySchema::new().detail(EntityType::Book, None, "b1").unwrap();
        let entry = CacheEntry::new(key.clone(), 42u32, Duration::from_secs(60), 1);
        assert!(entry.is_fresh());
        assert!(entry.stale_at >= entry.created_at);

        let mut expired = CacheEntry::new(key, 42u32, Duration::ZERO, 1);
        expired.mark_stale();
        assert!(expired.is_stale());
    }

    #[test]
    fn test_version_from_timestamp() {
        let ts = time::OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        assert_eq!(version_from_timestamp(ts), 1_700_000_000_000);
    }
}
