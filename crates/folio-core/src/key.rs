//! Structural cache keys and the key schema registry.
//!
//! Keys are ordered, immutable segment sequences compared structurally,
//! never by string concatenation. A collection query over an entity with
//! arbitrary filter/pagination parameters always extends the entity root,
//! so invalidation can target the root without knowing which parameter
//! combinations are live.
//!
//! ## Key shapes
//!
//! ```text
//! entity root   [Entity, User?]
//! collection    [Entity, User?, Kind::List, Param...]
//! detail        [Entity, User?, Kind::Item, Id]
//! ```
//!
//! The remote tier renders keys as `folio:{namespace}:{entity}:{...}` with
//! the namespace first, so both per-user purges and entity-root purges are
//! plain string-prefix deletions. Rendering escapes segment values, which
//! keeps string-prefix matching in agreement with structural prefix
//! matching.

use std::fmt;
use std::sync::Arc;

use crate::entity::EntityType;
use crate::error::{CacheError, Result};
use crate::identity::UserId;

/// Whether a bulk operation targets one key or a whole subtree.
///
/// Every bulk operation takes this explicitly. There is no default:
/// silently exact-matching a caller who meant prefix-matching is the
/// defect class this type exists to eliminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    Prefix,
}

/// Distinguishes collection keys from detail keys under one entity root.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum QueryKind {
    List,
    Item,
}

impl QueryKind {
    fn as_str(&self) -> &'static str {
        match self {
            QueryKind::List => "list",
            QueryKind::Item => "item",
        }
    }
}

/// One segment of a cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Segment {
    Entity(EntityType),
    User(UserId),
    Kind(QueryKind),
    Id(String),
    Param(String, String),
}

impl Segment {
    fn render(&self) -> String {
        match self {
            Segment::Entity(e) => e.as_str().to_string(),
            Segment::User(u) => format!("u.{}", escape(u.as_str())),
            Segment::Kind(k) => k.as_str().to_string(),
            Segment::Id(id) => escape(id),
            Segment::Param(name, value) => format!("{}={}", escape(name), escape(value)),
        }
    }
}

/// Escape a dynamic segment value so rendered keys stay injective.
fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '%' => out.push_str("%25"),
            ':' => out.push_str("%3a"),
            '=' => out.push_str("%3d"),
            _ => out.push(c),
        }
    }
    out
}

/// An ordered, immutable cache key with structural equality.
///
/// Cloning is cheap: the segment list is shared behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    segments: Arc<[Segment]>,
}

impl CacheKey {
    fn new(segments: Vec<Segment>) -> Self {
        Self {
            segments: segments.into(),
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The entity class this key belongs to.
    pub fn entity_type(&self) -> Option<EntityType> {
        match self.segments.first() {
            Some(Segment::Entity(e)) => Some(*e),
            _ => None,
        }
    }

    /// The user namespace embedded in this key, if any.
    pub fn user(&self) -> Option<&UserId> {
        self.segments.iter().find_map(|s| match s {
            Segment::User(u) => Some(u),
            _ => None,
        })
    }

    /// Structural prefix comparison: every segment of `self` equals the
    /// corresponding segment of `other`, and `self` is no longer.
    pub fn is_prefix_of(&self, other: &CacheKey) -> bool {
        self.segments.len() <= other.segments.len()
            && self
                .segments
                .iter()
                .zip(other.segments.iter())
                .all(|(a, b)| a == b)
    }

    /// Whether `key` is targeted by a bulk operation aimed at `self`.
    pub fn matches(&self, key: &CacheKey, mode: MatchMode) -> bool {
        match mode {
            MatchMode::Exact => self == key,
            MatchMode::Prefix => self.is_prefix_of(key),
        }
    }

    /// Render for the shared remote tier: `folio:{namespace}:{entity}:{...}`.
    ///
    /// The namespace leads so a whole identity can be purged with one
    /// string-prefix deletion.
    pub fn render(&self) -> String {
        let ns = match self.user() {
            Some(u) => format!("u.{}", escape(u.as_str())),
            None => "g".to_string(),
        };
        let mut out = format!("folio:{ns}");
        for segment in self.segments.iter() {
            if matches!(segment, Segment::User(_)) {
                continue;
            }
            out.push(':');
            out.push_str(&segment.render());
        }
        out
    }

    /// Rendered form anchored at a segment boundary, for prefix deletion.
    pub fn render_prefix(&self) -> String {
        let mut out = self.render();
        out.push(':');
        out
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(&segment.render())?;
        }
        Ok(())
    }
}

/// The single authority for constructing cache keys.
///
/// Constructors validate user scoping: per-user entities must embed an
/// identity, shared entities must not. Violations are schema errors, not
/// silently-wrong keys.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeySchema;

impl KeySchema {
    pub fn new() -> Self {
        Self
    }

    fn scope(&self, entity: EntityType, user: Option<&UserId>) -> Result<Vec<Segment>> {
        match (entity.user_scoped(), user) {
            (true, Some(u)) => Ok(vec![Segment::Entity(entity), Segment::User(u.clone())]),
            (false, None) => Ok(vec![Segment::Entity(entity)]),
            (true, None) => Err(CacheError::key_schema(format!(
                "entity {entity} is user-scoped but no identity was given"
            ))),
            (false, Some(_)) => Err(CacheError::key_schema(format!(
                "entity {entity} is shared and must not embed a user namespace"
            ))),
        }
    }

    /// The shortest key every query variant over this entity extends.
    /// This is the universal invalidation target.
    pub fn entity_root(&self, entity: EntityType, user: Option<&UserId>) -> Result<CacheKey> {
        Ok(CacheKey::new(self.scope(entity, user)?))
    }

    /// Key for a collection query. Parameters are sorted by name so equal
    /// parameter sets produce equal keys regardless of call-site order.
    pub fn collection(
        &self,
        entity: EntityType,
        user: Option<&UserId>,
        params: &[(&str, &str)],
    ) -> Result<CacheKey> {
        let mut segments = self.scope(entity, user)?;
        segments.push(Segment::Kind(QueryKind::List));
        let mut sorted: Vec<_> = params.to_vec();
        sorted.sort_by(|a, b| a.0.cmp(b.0).then(a.1.cmp(b.1)));
        for (name, value) in sorted {
            segments.push(Segment::Param(name.to_string(), value.to_string()));
        }
        Ok(CacheKey::new(segments))
    }

    /// Key for a single-entity detail query.
    pub fn detail(&self, entity: EntityType, user: Option<&UserId>, id: &str) -> Result<CacheKey> {
        let mut segments = self.scope(entity, user)?;
        segments.push(Segment::Kind(QueryKind::Item));
        segments.push(Segment::Id(id.to_string()));
        Ok(CacheKey::new(segments))
    }

    /// Rendered prefix covering every remote entry of one identity.
    pub fn user_namespace_prefix(&self, user: &UserId) -> String {
        format!("folio:u.{}:", escape(user.as_str()))
    }
}
