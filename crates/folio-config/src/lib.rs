//! Configuration for the Folio cache subsystem.
//!
//! Staleness and TTL policy is declared here per entity class, not decided
//! ad hoc at call sites. A deployment picks one policy per class; the
//! defaults below are the documented baseline:
//!
//! | class    | query staleness | remote TTL | store TTL |
//! |----------|-----------------|------------|-----------|
//! | progress | 5 s             | 5 s        | 1 day     |
//! | stats    | 30 s            | 30 s       | 1 day     |
//! | account  | 60 s            | 60 s       | 7 days    |
//! | book     | 10 min          | 10 min     | 30 days   |
//! | chapter  | 10 min          | 10 min     | 30 days   |
//! | media    | 1 h             | 1 h        | 30 days   |
//!
//! Collections that already have write-path invalidation sit at the short
//! end as defense-in-depth against missed invalidations; read-mostly
//! static content gets the long end.

pub mod settings;

pub use settings::{
    CacheSettings, ClassSeconds, QuerySettings, RemoteSettings, SessionSettings, StoreSettings,
};

/// Error types for configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Environment error: {variable}: {message}")]
    Env { variable: String, message: String },
}

impl ConfigError {
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    #[must_use]
    pub fn env(variable: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Env {
            variable: variable.into(),
            message: message.into(),
        }
    }
}
