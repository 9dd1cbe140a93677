//! Core types for the Folio multi-tier cache.
//!
//! This crate is the single authority for cache key construction and
//! comparison. Every other tier (reactive query cache, persistent entity
//! store, shared remote cache) builds its keys through [`KeySchema`] and
//! speaks the error taxonomy defined in [`error`]. No tier is permitted to
//! assemble keys ad hoc; the prefix-vs-exact mismatch bugs that ad hoc
//! string keys produce are exactly what this crate exists to prevent.

pub mod entity;
pub mod entry;
pub mod error;
pub mod identity;
pub mod key;

pub use entity::EntityType;
pub use entry::{CacheEntry, version_from_timestamp};
pub use error::{CacheError, Result, Tier};
pub use identity::UserId;
pub use key::{CacheKey, KeySchema, MatchMode, QueryKind, Segment};
