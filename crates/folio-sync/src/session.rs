//! Session/identity boundary: no tier may leak data across an identity
//! change.
//!
//! On every transition (login, logout, account switch) the boundary
//! cancels in-flight fetches, clears the query cache, awaits a retried
//! purge of the outgoing user's entity store namespace, prefix-deletes
//! the outgoing user's remote namespace, and drops their offline queue.
//!
//! Collect-all-errors semantics: one tier failing never prevents the
//! rest from being attempted, but the aggregate failure is surfaced in
//! the report, never silently swallowed. If the entity store purge
//! cannot complete, reads from that tier are blocked (treated as misses)
//! until [`SessionBoundary::retry_pending_purge`] succeeds.

use arc_swap::ArcSwapOption;
use dashmap::DashSet;
use std::sync::Arc;
use std::time::Duration;

use folio_core::{CacheError, KeySchema, Tier, UserId};
use folio_query::QueryCache;
use folio_remote::RemoteCache;
use folio_store::EntityStore;

use crate::queue::OfflineQueue;

/// Outcome of one identity transition.
#[derive(Debug, Default)]
pub struct PurgeReport {
    /// Entity store rows removed for the outgoing identity.
    pub store_entries_purged: u64,
    /// Remote tier keys removed for the outgoing identity.
    pub remote_entries_purged: u64,
    /// Offline mutations dropped with the outgoing identity.
    pub queued_mutations_dropped: usize,
    /// Per-tier failures. Empty means the purge completed everywhere.
    pub errors: Vec<CacheError>,
}

impl PurgeReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Cross-tier purge/isolation control.
pub struct SessionBoundary {
    query: Arc<QueryCache>,
    store: Arc<EntityStore>,
    remote: Arc<RemoteCache>,
    queue: Arc<OfflineQueue>,
    schema: KeySchema,
    active: ArcSwapOption<UserId>,
    /// Identities whose store purge failed. Store reads stay blocked
    /// until every one has been purged by a retry; a second transition
    /// must not forget the first failure.
    pending_purges: DashSet<UserId>,
    purge_retries: u32,
    purge_backoff: Duration,
}

impl SessionBoundary {
    pub fn new(
        query: Arc<QueryCache>,
        store: Arc<EntityStore>,
        remote: Arc<RemoteCache>,
        queue: Arc<OfflineQueue>,
        schema: KeySchema,
        purge_retries: u32,
        purge_backoff: Duration,
    ) -> Self {
        Self {
            query,
            store,
            remote,
            queue,
            schema,
            active: ArcSwapOption::empty(),
            pending_purges: DashSet::new(),
            purge_retries,
            purge_backoff,
        }
    }

    /// The identity whose data the caches currently hold.
    pub fn active_identity(&self) -> Option<UserId> {
        self.active.load_full().map(|u| (*u).clone())
    }

    /// Whether entity store reads are currently permitted. False while
    /// any failed purge is pending: a miss is acceptable, a leak is not.
    pub fn store_reads_allowed(&self) -> bool {
        self.pending_purges.is_empty()
    }

    /// Switch identities, purging every tier for the outgoing one.
    ///
    /// Idempotent: repeating a transition purges nothing further and
    /// yields the same end state.
    pub async fn on_identity_change(&self, new_identity: Option<UserId>) -> PurgeReport {
        let outgoing = self.active.swap(new_identity.map(Arc::new)).map(|u| (*u).clone());
        tracing::info!(
            outgoing = outgoing.as_ref().map(|u| u.as_str()).unwrap_or("<anonymous>"),
            "identity transition, purging cache tiers"
        );

        let mut report = PurgeReport::default();

        // 1+2. Abandon every in-flight fetch, then drop the whole query
        // tier. Full clearing is cheap and cannot leak.
        self.query.cancel_all_inflight();
        self.query.clear();

        // 3. Durable tier: awaited, retried, counted.
        if let Some(user) = &outgoing {
            match self.purge_store(user).await {
                Ok(count) => {
                    report.store_entries_purged = count;
                    self.pending_purges.remove(user);
                }
                Err(e) => {
                    self.pending_purges.insert(user.clone());
                    report.errors.push(e);
                }
            }

            // 4. Remote tier: the rendered namespace leads with the user,
            // so one prefix deletion covers every qualifier combination.
            report.remote_entries_purged = self
                .remote
                .delete_by_prefix(&self.schema.user_namespace_prefix(user))
                .await;
        }

        // 5. Offline queue for the outgoing identity (anonymous included).
        report.queued_mutations_dropped = self.queue.drop_for(outgoing.as_ref());

        if !report.is_clean() {
            tracing::error!(
                errors = report.errors.len(),
                "identity purge incomplete, store reads blocked until retried"
            );
        }
        report
    }

    /// Re-run every purge that failed during a transition. Store reads
    /// stay blocked until all of them succeed. Identities that purge
    /// cleanly are unblocked even if a later one fails again.
    pub async fn retry_pending_purge(&self) -> Result<u64, CacheError> {
        let users: Vec<UserId> = self.pending_purges.iter().map(|u| u.clone()).collect();
        let mut total = 0;
        let mut first_error = None;
        for user in users {
            match self.purge_store(&user).await {
                Ok(count) => {
                    total += count;
                    self.pending_purges.remove(&user);
                    tracing::info!(user = %user, count, "pending identity purge completed");
                }
                Err(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }
        match first_error {
            None => Ok(total),
            Some(e) => Err(e),
        }
    }

    async fn purge_store(&self, user: &UserId) -> Result<u64, CacheError> {
        let mut backoff = self.purge_backoff;
        let mut last_error = String::new();
        for attempt in 1..=self.purge_retries {
            match self.store.delete_all_for_user(user).await {
                Ok(count) => return Ok(count),
                Err(e) => {
                    last_error = e.to_string();
                    tracing::warn!(
                        user = %user,
                        attempt,
                        error = %last_error,
                        "entity store purge attempt failed"
                    );
                    if attempt < self.purge_retries {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        Err(CacheError::purge_failed(
            Tier::Store,
            self.purge_retries,
            last_error,
        ))
    }
}
