//! Optimistic mutation protocol.
//!
//! Given a mutation against an entity root:
//!
//! 1. cancel in-flight fetches for every key under the root
//! 2. snapshot every cached key under the root, not one representative
//! 3. apply the optimistic transform to every snapshotted entry
//! 4. perform the remote write
//! 5. on success: invalidate (never hand-patch) the root and every
//!    statically declared dependent aggregate root, and prefix-delete the
//!    remote tier
//! 6. on failure: restore every snapshot to its step-2 value and surface
//!    the error
//!
//! Steps 2–6 operate on one prefix predicate computed at the start;
//! narrowing it between the optimistic apply and the invalidate/rollback
//! is the defect class that writes optimistic updates to keys nobody is
//! subscribed to.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use folio_core::{CacheKey, KeySchema, MatchMode, Result, UserId};
use folio_query::{QueryCache, RefetchMode};
use folio_remote::RemoteCache;

/// Acknowledgement of a successful remote write.
#[derive(Debug, Clone, Copy)]
pub struct WriteAck {
    /// Authoritative version (server timestamp) of the written state.
    pub version: u64,
}

/// What a successful mutation touched.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// Keys that received the optimistic patch.
    pub patched: Vec<CacheKey>,
    /// Keys invalidated after the remote write, dependent roots included.
    pub invalidated: Vec<CacheKey>,
    pub ack: WriteAck,
}

/// Orchestrates optimistic writes across the query and remote tiers.
pub struct MutationCoordinator {
    query: Arc<QueryCache>,
    remote: Arc<RemoteCache>,
    schema: KeySchema,
}

impl MutationCoordinator {
    pub fn new(query: Arc<QueryCache>, remote: Arc<RemoteCache>, schema: KeySchema) -> Self {
        Self {
            query,
            remote,
            schema,
        }
    }

    /// Run one optimistic mutation against `root`.
    ///
    /// `transform` is called once per snapshotted key with the current
    /// value; returning `None` leaves that entry untouched, so list and
    /// detail entries of different shapes each transform correctly.
    ///
    /// `fallback_identity` scopes dependent aggregate roots when the
    /// mutated root itself is not user-scoped (a shared-entity write
    /// still invalidates the active user's aggregates).
    pub async fn mutate<F, Fut>(
        &self,
        root: &CacheKey,
        transform: &(dyn Fn(&CacheKey, &Value) -> Option<Value> + Send + Sync),
        fallback_identity: Option<&UserId>,
        remote_write: F,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WriteAck>>,
    {
        self.query.cancel_inflight(root, MatchMode::Prefix);

        let snapshots = self.query.snapshot_prefix(root);
        let mut patched = Vec::new();
        for snapshot in &snapshots {
            if let Some(next) = transform(&snapshot.key, snapshot.value()) {
                if self.query.patch(&snapshot.key, next) {
                    patched.push(snapshot.key.clone());
                }
            }
        }
        tracing::debug!(root = %root, snapshots = snapshots.len(), patched = patched.len(), "applied optimistic mutation");

        match remote_write().await {
            Ok(ack) => {
                let invalidated = self.invalidate_after_write(root, fallback_identity).await;
                Ok(MutationOutcome {
                    patched,
                    invalidated,
                    ack,
                })
            }
            Err(e) => {
                let dropped = self.query.restore(snapshots);
                if !dropped.is_empty() {
                    tracing::warn!(
                        root = %root,
                        dropped = dropped.len(),
                        "rollback targets were evicted mid-mutation, marked for refetch"
                    );
                }
                tracing::warn!(root = %root, error = %e, "remote write failed, optimistic mutation rolled back");
                Err(e)
            }
        }
    }

    /// Step 5: invalidate the mutated root and its dependent aggregate
    /// roots across the query and remote tiers. The remote deletion is
    /// best-effort by contract and never fails the write path.
    async fn invalidate_after_write(
        &self,
        root: &CacheKey,
        fallback_identity: Option<&UserId>,
    ) -> Vec<CacheKey> {
        let mut invalidated =
            self.query
                .invalidate(root, MatchMode::Prefix, RefetchMode::Active);
        self.remote.delete_by_prefix(&root.render_prefix()).await;

        let Some(entity) = root.entity_type() else {
            return invalidated;
        };
        for dep in entity.dependent_roots() {
            let user = if dep.user_scoped() {
                match root.user().or(fallback_identity) {
                    Some(u) => Some(u.clone()),
                    None => {
                        tracing::debug!(
                            dependent = %dep,
                            "skipping user-scoped dependent root, no identity in scope"
                        );
                        continue;
                    }
                }
            } else {
                None
            };
            let dep_root = match self.schema.entity_root(*dep, user.as_ref()) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(dependent = %dep, error = %e, "failed to build dependent root");
                    continue;
                }
            };
            invalidated.extend(self.query.invalidate(
                &dep_root,
                MatchMode::Prefix,
                RefetchMode::Active,
            ));
            self.remote.delete_by_prefix(&dep_root.render_prefix()).await;
        }
        invalidated
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use folio_config::QuerySettings;
    use folio_core::{CacheError, EntityType};
    use folio_query::Lookup;
    use serde_json::json;

    fn setup() -> (Arc<QueryCache>, MutationCoordinator, KeySchema) {
        let query = Arc::new(QueryCache::new(QuerySettings::default()));
        let remote = Arc::new(RemoteCache::new_local());
        let schema = KeySchema::new();
        let coordinator = MutationCoordinator::new(Arc::clone(&query), remote, schema);
        (query, coordinator, schema)
    }

    #[tokio::test]
    async fn test_transform_applies_to_every_matching_key() {
        let (query, coordinator, schema) = setup();
        let user = UserId::from("alice");
        let root = schema.entity_root(EntityType::Progress, Some(&user)).unwrap();
        let page1 = schema
            .collection(EntityType::Progress, Some(&user), &[("page", "1")])
            .unwrap();
        let page2 = schema
            .collection(EntityType::Progress, Some(&user), &[("page", "2")])
            .unwrap();
        query.set(&page1, json!({"pct": 10}), 1);
        query.set(&page2, json!({"pct": 10}), 1);

        let outcome = coordinator
            .mutate(
                &root,
                &|_, value| {
                    let mut next = value.clone();
                    next["pct"] = json!(42);
                    Some(next)
                },
                Some(&user),
                || async { Ok(WriteAck { version: 2 }) },
            )
            .await
            .unwrap();

        assert_eq!(outcome.patched.len(), 2);
        // Both entries were invalidated after the write succeeded.
        assert!(matches!(query.get(&page1), Lookup::Stale(_)));
        assert!(matches!(query.get(&page2), Lookup::Stale(_)));
    }

    #[tokio::test]
    async fn test_failed_write_restores_snapshots() {
        let (query, coordinator, schema) = setup();
        let user = UserId::from("alice");
        let root = schema.entity_root(EntityType::Progress, Some(&user)).unwrap();
        let key = schema.detail(EntityType::Progress, Some(&user), "b1").unwrap();
        query.set(&key, json!({"pct": 10}), 1);

        let result = coordinator
            .mutate(
                &root,
                &|_, value| {
                    let mut next = value.clone();
                    next["pct"] = json!(42);
                    Some(next)
                },
                Some(&user),
                || async { Err(CacheError::source("server error")) },
            )
            .await;

        assert!(result.is_err());
        match query.get(&key) {
            Lookup::Fresh(v) => assert_eq!(v["pct"], 10),
            other => panic!("expected restored fresh entry, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dependent_roots_invalidated() {
        let (query, coordinator, schema) = setup();
        let user = UserId::from("alice");
        let progress_root = schema.entity_root(EntityType::Progress, Some(&user)).unwrap();
        let progress = schema.detail(EntityType::Progress, Some(&user), "b1").unwrap();
        let stats = schema.detail(EntityType::Stats, Some(&user), "totals").unwrap();
        query.set(&progress, json!({"pct": 10}), 1);
        query.set(&stats, json!({"minutes": 100}), 1);

        let outcome = coordinator
            .mutate(
                &progress_root,
                &|_, _| None,
                Some(&user),
                || async { Ok(WriteAck { version: 2 }) },
            )
            .await
            .unwrap();

        assert!(outcome.invalidated.contains(&stats));
        assert!(matches!(query.get(&stats), Lookup::Stale(_)));
    }
}
