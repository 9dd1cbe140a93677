//! Entity classes cached by the Folio application.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical entity classes known to the cache.
///
/// The class decides two things the rest of the system is not allowed to
/// improvise: whether keys embed the user namespace, and which aggregate
/// roots must be invalidated alongside a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Catalog metadata for a book. Shared across users.
    Book,
    /// Parsed chapter content. Shared across users.
    Chapter,
    /// Per-user reading progress. Live data, very short staleness.
    Progress,
    /// Per-user reading statistics aggregate.
    Stats,
    /// Per-user generated media (cover renders, audio segments).
    Media,
    /// Account profile and preferences.
    Account,
}

impl EntityType {
    /// Stable name used in rendered keys and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Book => "book",
            EntityType::Chapter => "chapter",
            EntityType::Progress => "progress",
            EntityType::Stats => "stats",
            EntityType::Media => "media",
            EntityType::Account => "account",
        }
    }

    /// Whether keys for this entity embed the user namespace.
    ///
    /// Per-user entities MUST carry the user segment; shared entities MUST
    /// NOT, so that identical computation can legitimately be shared.
    pub fn user_scoped(&self) -> bool {
        match self {
            EntityType::Book | EntityType::Chapter => false,
            EntityType::Progress | EntityType::Stats | EntityType::Media | EntityType::Account => {
                true
            }
        }
    }

    /// Aggregate roots that must be invalidated whenever this entity is
    /// written. Declared statically here so the mutation path cannot forget
    /// one.
    pub fn dependent_roots(&self) -> &'static [EntityType] {
        match self {
            EntityType::Progress => &[EntityType::Stats],
            EntityType::Book => &[EntityType::Stats],
            _ => &[],
        }
    }

    pub const ALL: [EntityType; 6] = [
        EntityType::Book,
        EntityType::Chapter,
        EntityType::Progress,
        EntityType::Stats,
        EntityType::Media,
        EntityType::Account,
    ];
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_invalidates_stats() {
        assert!(
            EntityType::Progress
                .dependent_roots()
                .contains(&EntityType::Stats)
        );
        assert!(EntityType::Chapter.dependent_roots().is_empty());
    }

    #[test]
    fn test_user_scoping() {
        assert!(!EntityType::Book.user_scoped());
        assert!(EntityType::Progress.user_scoped());
    }
}
