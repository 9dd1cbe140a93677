//! Durable per-user entity store for the Folio cache.
//!
//! This crate caches large per-entity payloads (parsed chapter segments,
//! generated media) that must survive process restarts but remain fully
//! and verifiably erasable per identity. Keys are partitioned by user
//! first, so every bulk isolation operation is an ordered prefix range
//! over one namespace.
//!
//! The backing engine is abstracted behind [`StoreBackend`]: any embedded
//! ordered key-value store with prefix range scans can serve. The crate
//! ships [`MemoryBackend`] as the in-process implementation and the test
//! backend.

pub mod error;
pub mod memory;
pub mod store;
pub mod traits;

pub use error::StoreError;
pub use memory::MemoryBackend;
pub use store::{EntityStore, StoredBlob};
pub use traits::{DynStoreBackend, StoreBackend};
