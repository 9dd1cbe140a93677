//! Error types for the persistent entity store.

use folio_core::{CacheError, Tier};

/// Errors that can occur during store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing engine failed.
    #[error("store backend error: {message}")]
    Backend {
        /// Description of the backend failure.
        message: String,
    },

    /// A stored blob could not be decoded.
    #[error("corrupt blob at {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    /// Creates a new `Backend` error.
    #[must_use]
    pub fn backend(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
        }
    }

    /// Creates a new `Corrupt` error.
    #[must_use]
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Translation at the tier boundary: consumers of the cache subsystem
/// never observe a store-specific error type.
impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Backend { message } => CacheError::unavailable(Tier::Store, message),
            StoreError::Corrupt { key, message } => {
                CacheError::Codec(format!("{key}: {message}"))
            }
        }
    }
}
