//! Settings structs for every cache tier.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use folio_core::EntityType;

use crate::ConfigError;

/// Seconds per entity class. Reused for query staleness, remote TTL and
/// store TTL, each with its own defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassSeconds {
    pub book: u64,
    pub chapter: u64,
    pub progress: u64,
    pub stats: u64,
    pub media: u64,
    pub account: u64,
}

impl ClassSeconds {
    pub fn for_entity(&self, entity: EntityType) -> Duration {
        let secs = match entity {
            EntityType::Book => self.book,
            EntityType::Chapter => self.chapter,
            EntityType::Progress => self.progress,
            EntityType::Stats => self.stats,
            EntityType::Media => self.media,
            EntityType::Account => self.account,
        };
        Duration::from_secs(secs)
    }

    fn validate(&self, scope: &str) -> Result<(), ConfigError> {
        for entity in EntityType::ALL {
            if self.for_entity(entity).is_zero() {
                return Err(ConfigError::validation(format!(
                    "{scope}: zero duration for entity class '{entity}'"
                )));
            }
        }
        Ok(())
    }
}

/// Reactive query cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerySettings {
    /// How long a cached query result is served as fresh, per class.
    pub staleness_secs: ClassSeconds,
    /// Soft cap on resident entries; stale entries are evicted first.
    pub max_entries: usize,
}

impl Default for QuerySettings {
    fn default() -> Self {
        Self {
            staleness_secs: ClassSeconds {
                book: 600,
                chapter: 600,
                progress: 5,
                stats: 30,
                media: 3600,
                account: 60,
            },
            max_entries: 10_000,
        }
    }
}

/// Persistent entity store settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// Bumped whenever the blob key composition changes; a mismatch at
    /// startup rebuilds the store instead of mixing key formats.
    pub schema_version: u32,
    /// Size-based eviction threshold for `evict_oldest`.
    pub max_bytes: u64,
    /// Blob TTL per class.
    pub ttl_secs: ClassSeconds,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            schema_version: 2,
            max_bytes: 512 * 1024 * 1024,
            ttl_secs: ClassSeconds {
                book: 30 * 86_400,
                chapter: 30 * 86_400,
                progress: 86_400,
                stats: 86_400,
                media: 30 * 86_400,
                account: 7 * 86_400,
            },
        }
    }
}

/// Shared remote cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Redis connection URL. `None` runs the remote tier in local-only
    /// mode (single instance, no network).
    pub url: Option<String>,
    /// Remote entry TTL per class.
    pub ttl_secs: ClassSeconds,
    /// Bound on waiting for the stampede-guard lock before falling through
    /// to an uncached direct fetch.
    pub lock_timeout_ms: u64,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            url: None,
            ttl_secs: ClassSeconds {
                book: 600,
                chapter: 600,
                progress: 5,
                stats: 30,
                media: 3600,
                account: 60,
            },
            lock_timeout_ms: 2_000,
        }
    }
}

/// Identity boundary settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    /// Attempts for the persistent-store purge before the tier is blocked.
    pub purge_retries: u32,
    /// Initial backoff between purge attempts; doubles per attempt.
    pub purge_backoff_ms: u64,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            purge_retries: 3,
            purge_backoff_ms: 100,
        }
    }
}

/// Top-level cache settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub query: QuerySettings,
    pub store: StoreSettings,
    pub remote: RemoteSettings,
    pub session: SessionSettings,
}

impl CacheSettings {
    /// Parse settings from a TOML document. Missing fields fall back to
    /// defaults; the result is validated.
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        let settings: CacheSettings = toml::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Apply `FOLIO_CACHE_*` environment overrides on top of `self`.
    ///
    /// Recognized: `FOLIO_CACHE_REMOTE_URL`, `FOLIO_CACHE_SCHEMA_VERSION`,
    /// `FOLIO_CACHE_STORE_MAX_BYTES`, `FOLIO_CACHE_PURGE_RETRIES`.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = std::env::var("FOLIO_CACHE_REMOTE_URL") {
            self.remote.url = if url.is_empty() { None } else { Some(url) };
        }
        if let Ok(raw) = std::env::var("FOLIO_CACHE_SCHEMA_VERSION") {
            self.store.schema_version = raw
                .parse()
                .map_err(|_| ConfigError::env("FOLIO_CACHE_SCHEMA_VERSION", "not a u32"))?;
        }
        if let Ok(raw) = std::env::var("FOLIO_CACHE_STORE_MAX_BYTES") {
            self.store.max_bytes = raw
                .parse()
                .map_err(|_| ConfigError::env("FOLIO_CACHE_STORE_MAX_BYTES", "not a u64"))?;
        }
        if let Ok(raw) = std::env::var("FOLIO_CACHE_PURGE_RETRIES") {
            self.session.purge_retries = raw
                .parse()
                .map_err(|_| ConfigError::env("FOLIO_CACHE_PURGE_RETRIES", "not a u32"))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.query.staleness_secs.validate("query.staleness_secs")?;
        self.store.ttl_secs.validate("store.ttl_secs")?;
        self.remote.ttl_secs.validate("remote.ttl_secs")?;
        if self.query.max_entries == 0 {
            return Err(ConfigError::validation("query.max_entries must be positive"));
        }
        if self.store.max_bytes == 0 {
            return Err(ConfigError::validation("store.max_bytes must be positive"));
        }
        if self.remote.lock_timeout_ms == 0 {
            return Err(ConfigError::validation(
                "remote.lock_timeout_ms must be positive",
            ));
        }
        if self.session.purge_retries == 0 {
            return Err(ConfigError::validation(
                "session.purge_retries must be at least 1",
            ));
        }
        Ok(())
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.remote.lock_timeout_ms)
    }

    pub fn purge_backoff(&self) -> Duration {
        Duration::from_millis(self.session.purge_backoff_ms)
    }
}
