//! Reactive query cache.
//!
//! In-memory `CacheKey -> entry` store with per-key and per-prefix
//! subscriptions; it drives UI recomputation. Every bulk operation takes
//! an explicit [`MatchMode`](folio_core::MatchMode); there is no implicit
//! default, because silently exact-matching a caller who intended
//! prefix-matching is the single most common correctness bug this design
//! prevents.
//!
//! Staleness policy is declared per entity class in `folio-config`, not
//! decided ad hoc at call sites. An entry past its staleness bound may be
//! served, but only explicitly as [`Lookup::Stale`], never as fresh.
//!
//! In-flight fetches are tracked with per-key generations: an
//! invalidation bumps the generation, and a fetch completing against a
//! superseded generation is discarded, so a slow, stale response can never
//! resurrect data an invalidation already superseded.

pub mod cache;
pub mod inflight;
pub mod subscription;

pub use cache::{Lookup, QueryCache, QueryStatsSnapshot, RefetchMode, Snapshot};
pub use inflight::FetchGuard;
pub use subscription::{EventKind, QueryEvent, Subscription};
