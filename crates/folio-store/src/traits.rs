//! Backend trait for the persistent entity store.
//!
//! Any embedded ordered key-value store supporting prefix range scans and
//! prefix-scoped bulk deletes can back the store. Implementations must be
//! thread-safe (`Send + Sync`), and each primitive must be atomic on its
//! own; the store never requires cross-key locking from the backend.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::StoreError;

/// Ordered key-value backend for the entity store.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Writes a value, replacing any existing value at `key`.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::Backend` for infrastructure failures.
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError>;

    /// Reads a value. Returns `None` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure issues, not for missing keys.
    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    /// Deletes one key. Returns whether a value was present.
    async fn delete(&self, key: &[u8]) -> Result<bool, StoreError>;

    /// Deletes every key starting with `prefix` and returns the number of
    /// keys removed. An empty prefix clears the whole store.
    ///
    /// Must be idempotent: re-running after a partial failure deletes
    /// whatever remains and never errors on already-deleted keys.
    async fn delete_range(&self, prefix: &[u8]) -> Result<u64, StoreError>;

    /// Lists every key starting with `prefix`, in key order.
    async fn list_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Name of this backend for logging/debugging.
    fn backend_name(&self) -> &'static str;
}

/// Type alias for a shareable backend instance.
pub type DynStoreBackend = Arc<dyn StoreBackend>;
