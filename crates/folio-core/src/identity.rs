//! User identity handling for cache namespacing.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of an authenticated user.
///
/// Every cache namespace for per-user data is partitioned by this value.
/// Anonymous/global data is represented as `Option<UserId>::None` at the
/// call sites, never as a sentinel string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a user id. Empty ids are not valid identities.
    pub fn new(id: impl Into<String>) -> Option<Self> {
        let id = id.into();
        if id.is_empty() { None } else { Some(Self(id)) }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UserId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_id_rejected() {
        assert!(UserId::new("").is_none());
        assert!(UserId::new("alice").is_some());
    }
}
