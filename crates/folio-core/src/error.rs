//! Consumer-visible error taxonomy for the cache subsystem.
//!
//! Each tier catches its own backing-store-specific errors at its boundary
//! and translates them into one of these kinds; no consumer ever observes a
//! backing-store-specific exception type.

use thiserror::Error;

use crate::key::CacheKey;

/// Result alias used across the cache crates.
pub type Result<T> = std::result::Result<T, CacheError>;

/// The tier an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Query,
    Store,
    Remote,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Query => "query",
            Tier::Store => "store",
            Tier::Remote => "remote",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced by the cache coordination layer.
#[derive(Debug, Error)]
pub enum CacheError {
    /// A backing tier is down. Callers degrade to a direct read that
    /// bypasses the tier; they never fail the request on this alone.
    #[error("cache tier {tier} unavailable: {message}")]
    TransientUnavailable { tier: Tier, message: String },

    /// A rollback target key no longer exists (evicted mid-mutation). The
    /// key is dropped from the rollback and marked for refetch instead of
    /// failing the whole rollback.
    #[error("stale snapshot for key {key}")]
    StaleSnapshot { key: CacheKey },

    /// A per-identity purge could not complete. Reads from the affected
    /// tier stay blocked for the new identity until a forced resolution.
    #[error("identity purge failed on tier {tier} after {attempts} attempts: {message}")]
    IdentityPurge {
        tier: Tier,
        attempts: u32,
        message: String,
    },

    /// The stampede-guard lock could not be acquired in time. The single
    /// call bypasses caching; the caller is never failed.
    #[error("lock timeout for key {key}")]
    LockTimeout { key: CacheKey },

    /// Misuse of the key schema registry, e.g. building a user-scoped key
    /// without an identity.
    #[error("key schema violation: {message}")]
    KeySchema { message: String },

    /// The authoritative data source failed. Propagated unchanged to the
    /// caller; the cache never invents data on a source failure.
    #[error("source error: {0}")]
    Source(String),

    /// Value (de)serialization failed inside a tier.
    #[error("codec error: {0}")]
    Codec(String),
}

impl CacheError {
    /// Create a new `TransientUnavailable` error.
    #[must_use]
    pub fn unavailable(tier: Tier, message: impl Into<String>) -> Self {
        Self::TransientUnavailable {
            tier,
            message: message.into(),
        }
    }

    /// Create a new `IdentityPurge` error.
    #[must_use]
    pub fn purge_failed(tier: Tier, attempts: u32, message: impl Into<String>) -> Self {
        Self::IdentityPurge {
            tier,
            attempts,
            message: message.into(),
        }
    }

    /// Create a new `KeySchema` error.
    #[must_use]
    pub fn key_schema(message: impl Into<String>) -> Self {
        Self::KeySchema {
            message: message.into(),
        }
    }

    /// Create a new `Source` error.
    #[must_use]
    pub fn source(message: impl Into<String>) -> Self {
        Self::Source(message.into())
    }

    /// Whether the caller may keep serving by bypassing the failed tier.
    pub fn is_degradable(&self) -> bool {
        matches!(
            self,
            Self::TransientUnavailable { .. } | Self::LockTimeout { .. } | Self::StaleSnapshot { .. }
        )
    }

    /// Whether this error must gate reads until resolved. Only purge
    /// failures are hard: serving one identity's data to another is worse
    /// than serving nothing.
    pub fn is_hard(&self) -> bool {
        matches!(self, Self::IdentityPurge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let e = CacheError::unavailable(Tier::Remote, "connection refused");
        assert!(e.is_degradable());
        assert!(!e.is_hard());

        let e = CacheError::purge_failed(Tier::Store, 3, "disk full");
        assert!(e.is_hard());
        assert!(!e.is_degradable());
    }
}
