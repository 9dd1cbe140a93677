//! Schema-versioned entity store on top of a [`StoreBackend`].
//!
//! ## Key layout
//!
//! ```text
//! v{schema}/{user_id}/{entity_id}/{sub_key}
//! ```
//!
//! The user id leads the data key, so `delete_all_for_user` and
//! `delete_entity` are single ordered range deletions; the secondary
//! indexes on `{user}` and `{user, entity}` are the key order itself.
//! Components are escaped, so ids containing `/` cannot break out of
//! their namespace.
//!
//! Blobs are MessagePack-encoded with their write time and optional
//! expiry. A blob that fails to decode is deleted and reported as a miss
//! rather than surfacing a corrupt payload.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use folio_config::StoreSettings;
use folio_core::UserId;

use crate::error::StoreError;
use crate::traits::DynStoreBackend;

const META_SCHEMA_KEY: &[u8] = b"meta/schema";

/// A stored payload with write time and optional expiry, both unix millis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredBlob {
    pub payload: Vec<u8>,
    pub written_at: i64,
    pub expires_at: Option<i64>,
}

impl StoredBlob {
    fn is_expired(&self, now: i64) -> bool {
        self.expires_at.is_some_and(|at| now >= at)
    }
}

fn now_millis() -> i64 {
    let nanos = time::OffsetDateTime::now_utc().unix_timestamp_nanos();
    (nanos / 1_000_000) as i64
}

fn escape(component: &str) -> String {
    let mut out = String::with_capacity(component.len());
    for c in component.chars() {
        match c {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2f"),
            _ => out.push(c),
        }
    }
    out
}

/// Durable cache for large per-entity payloads, partitioned by user.
pub struct EntityStore {
    backend: DynStoreBackend,
    settings: StoreSettings,
}

impl EntityStore {
    /// Open the store, verifying the key schema version.
    ///
    /// On mismatch the store is rebuilt (full wipe, then the current
    /// version is stamped); old and new key formats are never mixed.
    pub async fn open(backend: DynStoreBackend, settings: StoreSettings) -> Result<Self, StoreError> {
        let current = settings.schema_version.to_string().into_bytes();
        let stamped = backend.get(META_SCHEMA_KEY).await?;
        if stamped.as_deref() != Some(current.as_slice()) {
            if let Some(old) = &stamped {
                tracing::warn!(
                    backend = backend.backend_name(),
                    old = %String::from_utf8_lossy(old),
                    new = settings.schema_version,
                    "entity store schema version mismatch, rebuilding"
                );
            }
            backend.delete_range(b"").await?;
            backend.put(META_SCHEMA_KEY, current).await?;
        }
        Ok(Self { backend, settings })
    }

    fn data_prefix(&self) -> String {
        format!("v{}/", self.settings.schema_version)
    }

    fn user_prefix(&self, user: &UserId) -> String {
        format!("{}{}/", self.data_prefix(), escape(user.as_str()))
    }

    fn entity_prefix(&self, user: &UserId, entity_id: &str) -> String {
        format!("{}{}/", self.user_prefix(user), escape(entity_id))
    }

    fn blob_key(&self, user: &UserId, entity_id: &str, sub_key: &str) -> String {
        format!("{}{}", self.entity_prefix(user, entity_id), escape(sub_key))
    }

    /// Write a payload. `ttl = None` stores without expiry.
    pub async fn put(
        &self,
        user: &UserId,
        entity_id: &str,
        sub_key: &str,
        payload: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        let key = self.blob_key(user, entity_id, sub_key);
        let written_at = now_millis();
        let blob = StoredBlob {
            payload,
            written_at,
            expires_at: ttl.map(|t| written_at + t.as_millis() as i64),
        };
        let encoded = rmp_serde::to_vec(&blob)
            .map_err(|e| StoreError::corrupt(&key, format!("encode: {e}")))?;
        self.backend.put(key.as_bytes(), encoded).await
    }

    /// Read a payload. Expired and undecodable blobs are deleted on read
    /// and reported as misses.
    pub async fn get(
        &self,
        user: &UserId,
        entity_id: &str,
        sub_key: &str,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        let key = self.blob_key(user, entity_id, sub_key);
        let Some(raw) = self.backend.get(key.as_bytes()).await? else {
            return Ok(None);
        };
        let blob: StoredBlob = match rmp_serde::from_slice(&raw) {
            Ok(blob) => blob,
            Err(e) => {
                tracing::warn!(key = %key, error = %e, "failed to decode stored blob, dropping");
                self.backend.delete(key.as_bytes()).await?;
                return Ok(None);
            }
        };
        if blob.is_expired(now_millis()) {
            self.backend.delete(key.as_bytes()).await?;
            return Ok(None);
        }
        Ok(Some(blob.payload))
    }

    /// Delete every blob of one entity for one user. Returns the count.
    pub async fn delete_entity(&self, user: &UserId, entity_id: &str) -> Result<u64, StoreError> {
        let prefix = self.entity_prefix(user, entity_id);
        self.backend.delete_range(prefix.as_bytes()).await
    }

    /// Delete every blob belonging to one user and return the count.
    ///
    /// Idempotent and safe to re-run after a partial failure: whatever
    /// remains in the range is deleted on the next call. Callers that
    /// depend on isolation must await this to completion and verify the
    /// result.
    pub async fn delete_all_for_user(&self, user: &UserId) -> Result<u64, StoreError> {
        let prefix = self.user_prefix(user);
        let count = self.backend.delete_range(prefix.as_bytes()).await?;
        tracing::debug!(user = %user, count, "purged entity store namespace");
        Ok(count)
    }

    /// Total payload bytes currently stored.
    pub async fn usage_bytes(&self) -> Result<u64, StoreError> {
        Ok(self.scan_blobs().await?.iter().map(|(_, _, size)| size).sum())
    }

    /// Evict oldest blobs (by write time, across all users) until total
    /// usage is at or below `max_bytes`. Returns the bytes freed.
    pub async fn evict_oldest(&self, max_bytes: u64) -> Result<u64, StoreError> {
        let mut blobs = self.scan_blobs().await?;
        let mut total: u64 = blobs.iter().map(|(_, _, size)| size).sum();
        if total <= max_bytes {
            return Ok(0);
        }

        blobs.sort_by_key(|(_, written_at, _)| *written_at);
        let mut freed = 0u64;
        for (key, _, size) in blobs {
            if total <= max_bytes {
                break;
            }
            self.backend.delete(&key).await?;
            total -= size;
            freed += size;
        }
        tracing::debug!(freed, "evicted oldest entity store blobs");
        Ok(freed)
    }

    /// Configured eviction threshold.
    pub fn max_bytes(&self) -> u64 {
        self.settings.max_bytes
    }

    async fn scan_blobs(&self) -> Result<Vec<(Vec<u8>, i64, u64)>, StoreError> {
        let prefix = self.data_prefix();
        let keys = self.backend.list_keys_with_prefix(prefix.as_bytes()).await?;
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            let Some(raw) = self.backend.get(&key).await? else {
                continue;
            };
            let size = raw.len() as u64;
            let written_at = rmp_serde::from_slice::<StoredBlob>(&raw)
                .map(|b| b.written_at)
                .unwrap_or(0);
            out.push((key, written_at, size));
        }
        Ok(out)
    }
}
