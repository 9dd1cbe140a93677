//! Shared remote cache tier.
//!
//! ## Architecture
//!
//! - **Local tier (DashMap)**: in-memory, microsecond latency, per-instance
//! - **Redis tier**: network, millisecond latency, shared across instances
//! - **Pub/Sub**: cross-instance invalidation by key prefix
//!
//! ## Graceful degradation
//!
//! Redis being unavailable never fails a caller: reads degrade to misses
//! (the caller falls through to the authoritative source), writes and
//! deletes are best-effort and logged. The only hard signal exposed is
//! [`RemoteCache::ping`] for health checks.
//!
//! Key strings are produced by the key schema registry
//! (`CacheKey::render` / `render_prefix`); this crate never assembles key
//! strings itself.

pub mod backend;
pub mod pubsub;

pub use backend::{RemoteCache, RemoteEntry, RemoteStats};
pub use pubsub::{InvalidationListener, publish_invalidation};
