//! Subscriber registry for cache change notifications.

use dashmap::DashMap;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use uuid::Uuid;

use folio_core::{CacheKey, MatchMode};

/// What happened to a cached key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The value changed (authoritative write or optimistic patch).
    Updated,
    /// The entry was marked stale; subscribers should refetch.
    Invalidated,
    /// The entry was removed (eviction or purge).
    Removed,
}

/// A change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct QueryEvent {
    pub key: CacheKey,
    pub kind: EventKind,
}

/// A live subscription. Events arrive on `events`; dropping the receiver
/// ends the subscription (the registry reaps it on the next notify).
pub struct Subscription {
    pub id: Uuid,
    pub events: UnboundedReceiver<QueryEvent>,
}

struct Subscriber {
    target: CacheKey,
    mode: MatchMode,
    sender: UnboundedSender<QueryEvent>,
}

/// Registry of key/prefix subscribers.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    subscribers: DashMap<Uuid, Subscriber>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, target: CacheKey, mode: MatchMode) -> Subscription {
        let (sender, events) = unbounded_channel();
        let id = Uuid::new_v4();
        self.subscribers.insert(
            id,
            Subscriber {
                target,
                mode,
                sender,
            },
        );
        Subscription { id, events }
    }

    pub fn unsubscribe(&self, id: &Uuid) {
        self.subscribers.remove(id);
    }

    /// Fan an event out to every subscriber whose target matches `key`.
    /// Returns the number of deliveries; dead receivers are reaped.
    pub fn notify(&self, key: &CacheKey, kind: EventKind) -> usize {
        let mut delivered = 0;
        let mut dead = Vec::new();
        for entry in self.subscribers.iter() {
            if !entry.target.matches(key, entry.mode) {
                continue;
            }
            let event = QueryEvent {
                key: key.clone(),
                kind,
            };
            if entry.sender.send(event).is_ok() {
                delivered += 1;
            } else {
                dead.push(*entry.key());
            }
        }
        for id in dead {
            self.subscribers.remove(&id);
        }
        delivered
    }

    /// Whether any live subscriber is watching `key`.
    pub fn has_subscriber_for(&self, key: &CacheKey) -> bool {
        self.subscribers
            .iter()
            .any(|entry| !entry.sender.is_closed() && entry.target.matches(key, entry.mode))
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_core::{EntityType, KeySchema, UserId};

    #[tokio::test]
    async fn test_prefix_subscriber_sees_deeper_keys() {
        let schema = KeySchema::new();
        let user = UserId::from("alice");
        let registry = SubscriptionRegistry::new();

        let root = schema.entity_root(EntityType::Progress, Some(&user)).unwrap();
        let mut sub = registry.subscribe(root, MatchMode::Prefix);

        let key = schema.detail(EntityType::Progress, Some(&user), "b1").unwrap();
        assert_eq!(registry.notify(&key, EventKind::Updated), 1);

        let event = sub.events.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Updated);
        assert_eq!(event.key, key);
    }

    #[tokio::test]
    async fn test_exact_subscriber_ignores_other_keys() {
        let schema = KeySchema::new();
        let registry = SubscriptionRegistry::new();

        let b1 = schema.detail(EntityType::Book, None, "b1").unwrap();
        let b2 = schema.detail(EntityType::Book, None, "b2").unwrap();
        let _sub = registry.subscribe(b1.clone(), MatchMode::Exact);

        assert_eq!(registry.notify(&b2, EventKind::Updated), 0);
        assert_eq!(registry.notify(&b1, EventKind::Updated), 1);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_reaped() {
        let schema = KeySchema::new();
        let registry = SubscriptionRegistry::new();
        let key = schema.detail(EntityType::Book, None, "b1").unwrap();

        let sub = registry.subscribe(key.clone(), MatchMode::Exact);
        drop(sub);

        assert_eq!(registry.notify(&key, EventKind::Updated), 0);
        assert_eq!(registry.len(), 0);
    }
}
