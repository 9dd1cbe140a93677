//! Coordination layer of the Folio cache.
//!
//! Ties the three tiers together:
//!
//! - [`SingleFlight`]: per-key single-flight locking so an expired hot key
//!   is recomputed by exactly one caller
//! - [`MutationCoordinator`]: optimistic local mutation with guaranteed
//!   rollback, prefix-wide snapshot discipline and dependent-root
//!   invalidation
//! - [`SessionBoundary`]: purge/isolation control across every tier on
//!   identity transitions
//! - [`CacheCoordinator`]: the consumer-facing facade. Explicitly
//!   constructed with injected tiers; there is no global singleton, so
//!   tests instantiate isolated instances
//!
//! Consumers never construct raw keys: every key comes from
//! [`folio_core::KeySchema`] via the facade.

pub mod coordinator;
pub mod mutation;
pub mod queue;
pub mod session;
pub mod single_flight;

pub use coordinator::{CacheCoordinator, SourceRecord};
pub use mutation::{MutationCoordinator, MutationOutcome, WriteAck};
pub use queue::{OfflineQueue, QueuedMutation};
pub use session::{PurgeReport, SessionBoundary};
pub use single_flight::SingleFlight;
