//! Client-local offline mutation queue, scoped per identity.
//!
//! Mutations issued while the upstream source is unreachable are parked
//! here for replay. The queue is partitioned by identity so the session
//! boundary can drop the outgoing user's entries wholesale during a
//! purge: queued writes must never replay under a different identity.

use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use uuid::Uuid;

use folio_core::{CacheKey, UserId};

/// A mutation awaiting replay.
#[derive(Debug, Clone)]
pub struct QueuedMutation {
    pub id: Uuid,
    pub root: CacheKey,
    pub payload: Value,
    pub enqueued_at: time::OffsetDateTime,
}

/// Per-identity FIFO of pending mutations. The anonymous identity has its
/// own partition.
#[derive(Debug, Default)]
pub struct OfflineQueue {
    partitions: Mutex<HashMap<Option<UserId>, VecDeque<QueuedMutation>>>,
}

impl OfflineQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, identity: Option<&UserId>, root: CacheKey, payload: Value) -> Uuid {
        let mutation = QueuedMutation {
            id: Uuid::new_v4(),
            root,
            payload,
            enqueued_at: time::OffsetDateTime::now_utc(),
        };
        let id = mutation.id;
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .entry(identity.cloned())
            .or_default()
            .push_back(mutation);
        id
    }

    /// Take every pending mutation for `identity`, oldest first.
    pub fn drain(&self, identity: Option<&UserId>) -> Vec<QueuedMutation> {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .remove(&identity.cloned())
            .map(|queue| queue.into_iter().collect())
            .unwrap_or_default()
    }

    /// Drop every pending mutation for `identity`. Returns the count.
    pub fn drop_for(&self, identity: Option<&UserId>) -> usize {
        let mut partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .remove(&identity.cloned())
            .map(|queue| queue.len())
            .unwrap_or(0)
    }

    pub fn len(&self, identity: Option<&UserId>) -> usize {
        let partitions = self.partitions.lock().unwrap_or_else(|e| e.into_inner());
        partitions
            .get(&identity.cloned())
            .map(|queue| queue.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityType, KeySchema};
    use serde_json::json;

    #[test]
    fn test_partitions_are_isolated() {
        let queue = OfflineQueue::new();
        let schema = KeySchema::new();
        let alice = UserId::from("alice");
        let bob = UserId::from("bob");
        let root = schema.entity_root(EntityType::Progress, Some(&alice)).unwrap();

        queue.enqueue(Some(&alice), root.clone(), json!({"pct": 1}));
        queue.enqueue(Some(&alice), root.clone(), json!({"pct": 2}));
        queue.enqueue(Some(&bob), root, json!({"pct": 3}));

        assert_eq!(queue.drop_for(Some(&alice)), 2);
        assert_eq!(queue.len(Some(&alice)), 0);
        assert_eq!(queue.len(Some(&bob)), 1);
    }

    #[test]
    fn test_drain_preserves_order() {
        let queue = OfflineQueue::new();
        let schema = KeySchema::new();
        let alice = UserId::from("alice");
        let root = schema.entity_root(EntityType::Progress, Some(&alice)).unwrap();

        queue.enqueue(Some(&alice), root.clone(), json!(1));
        queue.enqueue(Some(&alice), root, json!(2));

        let drained = queue.drain(Some(&alice));
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, json!(1));
        assert_eq!(drained[1].payload, json!(2));
        assert!(queue.drain(Some(&alice)).is_empty());
    }
}
