//! In-memory ordered backend.
//!
//! A `BTreeMap` behind `tokio::sync::RwLock`: ordered iteration gives the
//! prefix range scans the backend contract requires, and writes to the
//! same key are serialized by the lock. This is both the single-process
//! deployment backend and the test backend.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::traits::StoreBackend;

/// In-memory implementation of [`StoreBackend`].
#[derive(Debug, Default)]
pub struct MemoryBackend {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of resident keys.
    pub async fn len(&self) -> usize {
        self.data.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.data.read().await.is_empty()
    }
}

fn range_start(prefix: &[u8]) -> Bound<Vec<u8>> {
    Bound::Included(prefix.to_vec())
}

#[async_trait]
impl StoreBackend for MemoryBackend {
    async fn put(&self, key: &[u8], value: Vec<u8>) -> Result<(), StoreError> {
        self.data.write().await.insert(key.to_vec(), value);
        Ok(())
    }

    async fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.data.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &[u8]) -> Result<bool, StoreError> {
        Ok(self.data.write().await.remove(key).is_some())
    }

    async fn delete_range(&self, prefix: &[u8]) -> Result<u64, StoreError> {
        let mut guard = self.data.write().await;
        let doomed: Vec<Vec<u8>> = guard
            .range::<Vec<u8>, _>((range_start(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &doomed {
            guard.remove(key);
        }
        Ok(doomed.len() as u64)
    }

    async fn list_keys_with_prefix(&self, prefix: &[u8]) -> Result<Vec<Vec<u8>>, StoreError> {
        let guard = self.data.read().await;
        Ok(guard
            .range::<Vec<u8>, _>((range_start(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_scan_is_ordered_and_scoped() {
        let backend = MemoryBackend::new();
        backend.put(b"a/1", vec![1]).await.unwrap();
        backend.put(b"a/2", vec![2]).await.unwrap();
        backend.put(b"b/1", vec![3]).await.unwrap();

        let keys = backend.list_keys_with_prefix(b"a/").await.unwrap();
        assert_eq!(keys, vec![b"a/1".to_vec(), b"a/2".to_vec()]);
    }

    #[tokio::test]
    async fn test_delete_range_counts_and_is_idempotent() {
        let backend = MemoryBackend::new();
        backend.put(b"u1/x", vec![1]).await.unwrap();
        backend.put(b"u1/y", vec![2]).await.unwrap();
        backend.put(b"u2/x", vec![3]).await.unwrap();

        assert_eq!(backend.delete_range(b"u1/").await.unwrap(), 2);
        assert_eq!(backend.delete_range(b"u1/").await.unwrap(), 0);
        assert_eq!(backend.len().await, 1);
    }

    #[tokio::test]
    async fn test_empty_prefix_clears_everything() {
        let backend = MemoryBackend::new();
        backend.put(b"u1/x", vec![1]).await.unwrap();
        backend.put(b"u2/x", vec![2]).await.unwrap();

        assert_eq!(backend.delete_range(b"").await.unwrap(), 2);
        assert!(backend.is_empty().await);
    }
}
