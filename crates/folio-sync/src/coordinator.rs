//! Consumer-facing cache coordinator.
//!
//! The one entry point the rest of the application talks to. Explicitly
//! constructed with injected tiers, never a global singleton, so tests build
//! isolated instances. Raw keys never cross this boundary: consumers go
//! through [`CacheCoordinator::schema`] for every key they need.

use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use folio_config::CacheSettings;
use folio_core::{CacheError, CacheKey, EntityType, KeySchema, MatchMode, Result, Tier, UserId};
use folio_query::{Lookup, QueryCache, RefetchMode, Subscription};
use folio_remote::RemoteCache;
use folio_store::EntityStore;

use crate::mutation::{MutationCoordinator, MutationOutcome, WriteAck};
use crate::queue::{OfflineQueue, QueuedMutation};
use crate::session::{PurgeReport, SessionBoundary};
use crate::single_flight::SingleFlight;

/// Fallback TTL for shared reads on keys without a resolvable entity
/// class.
const FALLBACK_SHARED_TTL: Duration = Duration::from_secs(30);

/// One record from the authoritative source: the value plus its
/// monotonic version (derived from the source's `updated_at`).
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub value: Value,
    pub version: u64,
}

/// Facade over the query, store and remote tiers.
pub struct CacheCoordinator {
    settings: CacheSettings,
    schema: KeySchema,
    query: Arc<QueryCache>,
    store: Arc<EntityStore>,
    guard: SingleFlight,
    remote: Arc<RemoteCache>,
    mutations: MutationCoordinator,
    session: SessionBoundary,
    queue: Arc<OfflineQueue>,
}

impl CacheCoordinator {
    /// Build a coordinator over injected tiers.
    pub fn new(
        settings: CacheSettings,
        query: Arc<QueryCache>,
        store: Arc<EntityStore>,
        remote: Arc<RemoteCache>,
    ) -> Self {
        let schema = KeySchema::new();
        let queue = Arc::new(OfflineQueue::new());
        let guard = SingleFlight::new(settings.lock_timeout());
        let mutations =
            MutationCoordinator::new(Arc::clone(&query), Arc::clone(&remote), schema);
        let session = SessionBoundary::new(
            Arc::clone(&query),
            Arc::clone(&store),
            Arc::clone(&remote),
            Arc::clone(&queue),
            schema,
            settings.session.purge_retries,
            settings.purge_backoff(),
        );
        Self {
            settings,
            schema,
            query,
            store,
            guard,
            remote,
            mutations,
            session,
            queue,
        }
    }

    /// The key factory. The only sanctioned way to build keys.
    pub fn schema(&self) -> KeySchema {
        self.schema
    }

    /// Read through the query tier with stale-while-revalidate.
    ///
    /// Fresh entries are served directly. A stale entry is served
    /// immediately while one background revalidation runs, and only one:
    /// if a fetch is already in flight for the key, none is started. A
    /// miss fetches in the foreground.
    pub async fn fetch_or_cache<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Arc<Value>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SourceRecord>> + Send + 'static,
    {
        match self.query.get(key) {
            Lookup::Fresh(value) => Ok(value),
            Lookup::Stale(value) => {
                if let Some(guard) = self.query.begin_fetch(key) {
                    let query = Arc::clone(&self.query);
                    let future = fetch();
                    tokio::spawn(async move {
                        match future.await {
                            Ok(record) => {
                                query.complete_fetch(guard, record.value, record.version);
                            }
                            Err(e) => {
                                tracing::warn!(key = %guard.key(), error = %e, "background revalidation failed");
                                query.abort_fetch(guard);
                            }
                        }
                    });
                }
                Ok(value)
            }
            Lookup::Miss => {
                let Some(guard) = self.query.begin_fetch(key) else {
                    // Another fetch is in flight; this caller goes direct.
                    let record = fetch().await?;
                    return Ok(Arc::new(record.value));
                };
                match fetch().await {
                    Ok(record) => {
                        let written =
                            self.query
                                .complete_fetch(guard, record.value.clone(), record.version);
                        if written {
                            let lookup = self.query.get(key);
                            if let Some(value) = lookup.value() {
                                return Ok(Arc::clone(value));
                            }
                        }
                        // Superseded while in flight: hand the caller the
                        // fetched value without caching it.
                        Ok(Arc::new(record.value))
                    }
                    Err(e) => {
                        self.query.abort_fetch(guard);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Read through the shared remote tier with stampede protection.
    pub async fn fetch_shared<F, Fut>(&self, key: &CacheKey, fetch: F) -> Result<Arc<Vec<u8>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        let ttl = key
            .entity_type()
            .map(|e| self.settings.remote.ttl_secs.for_entity(e))
            .unwrap_or(FALLBACK_SHARED_TTL);
        self.guard.get_or_populate(&self.remote, key, ttl, fetch).await
    }

    /// Store a durable payload for `user`, with the TTL of its entity
    /// class.
    pub async fn put_payload(
        &self,
        user: &UserId,
        class: EntityType,
        entity_id: &str,
        sub_key: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let ttl = self.settings.store.ttl_secs.for_entity(class);
        self.store
            .put(user, entity_id, sub_key, payload, Some(ttl))
            .await?;
        Ok(())
    }

    /// Read a durable payload.
    ///
    /// Blocked while a failed identity purge is pending, and for any
    /// identity other than the active one: both degrade to a miss, never
    /// to another user's data.
    pub async fn get_payload(
        &self,
        user: &UserId,
        entity_id: &str,
        sub_key: &str,
    ) -> Result<Option<Vec<u8>>> {
        if !self.session.store_reads_allowed() {
            tracing::debug!(user = %user, "entity store reads blocked pending purge, returning miss");
            return Ok(None);
        }
        if self.session.active_identity().as_ref() != Some(user) {
            tracing::warn!(user = %user, "entity store read for non-active identity refused");
            return Ok(None);
        }
        Ok(self.store.get(user, entity_id, sub_key).await?)
    }

    /// Drop every durable payload of one entity for `user`.
    pub async fn delete_entity_payloads(&self, user: &UserId, entity_id: &str) -> Result<u64> {
        Ok(self.store.delete_entity(user, entity_id).await?)
    }

    /// Evict oldest durable payloads down to the configured budget.
    pub async fn enforce_store_budget(&self) -> Result<u64> {
        Ok(self.store.evict_oldest(self.store.max_bytes()).await?)
    }

    /// Run an optimistic mutation against `root`. See
    /// [`MutationCoordinator::mutate`].
    pub async fn mutate<F, Fut>(
        &self,
        root: &CacheKey,
        transform: &(dyn Fn(&CacheKey, &Value) -> Option<Value> + Send + Sync),
        remote_write: F,
    ) -> Result<MutationOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<WriteAck>>,
    {
        let identity = self.session.active_identity();
        self.mutations
            .mutate(root, transform, identity.as_ref(), remote_write)
            .await
    }

    /// Subscribe to changes of one key or subtree.
    pub fn subscribe(&self, target: CacheKey, mode: MatchMode) -> Subscription {
        self.query.subscribe(target, mode)
    }

    /// Invalidate outside the mutation path (e.g. push notification from
    /// the server).
    pub fn invalidate(&self, target: &CacheKey, mode: MatchMode, refetch: RefetchMode) -> Vec<CacheKey> {
        self.query.invalidate(target, mode, refetch)
    }

    /// Switch identities. Purges every tier for the outgoing identity and
    /// reports per-tier results; see [`SessionBoundary`].
    pub async fn on_identity_change(&self, new_identity: Option<UserId>) -> PurgeReport {
        self.session.on_identity_change(new_identity).await
    }

    /// Retry a failed identity purge. Store reads stay blocked until this
    /// succeeds.
    pub async fn retry_pending_purge(&self) -> Result<u64> {
        self.session.retry_pending_purge().await
    }

    pub fn active_identity(&self) -> Option<UserId> {
        self.session.active_identity()
    }

    /// Park a mutation for replay while the source is unreachable.
    pub fn enqueue_offline(&self, root: CacheKey, payload: Value) -> Uuid {
        let identity = self.session.active_identity();
        self.queue.enqueue(identity.as_ref(), root, payload)
    }

    /// Take the active identity's parked mutations, oldest first.
    pub fn drain_offline(&self) -> Vec<QueuedMutation> {
        let identity = self.session.active_identity();
        self.queue.drain(identity.as_ref())
    }

    /// Liveness of the remote tier. `false` means shared reads are
    /// currently degrading to direct fetches.
    pub async fn remote_healthy(&self) -> bool {
        let healthy = self.remote.ping().await;
        if !healthy {
            let err = CacheError::unavailable(Tier::Remote, "ping failed");
            tracing::warn!(error = %err, "remote cache unhealthy, serving via direct reads");
        }
        healthy
    }
}
