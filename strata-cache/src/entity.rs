//! Entities that participate in caching.
//!
//! An entity's cache group is a version key that every value derived from
//! the entity is cached under. Mutating the entity invalidates the group
//! (see `CacheEngine::invalidate_entity`), which orphans all of them at once.

use crate::result::GroupRef;

/// Prefix of the default entity cache group.
pub const ENTITY_GROUP_PREFIX: &str = "mcg-";

/// Implemented by domain objects whose derived values are cached.
///
/// # Implementation Requirements
///
/// - `unique_key()` must be stable for the life of the entity and unique
///   across entity types (e.g. `"item.42"`)
/// - `clear_for_cache()` must drop every request-local value (stashes,
///   loaded relations) before the entity itself is written to a shared cache
pub trait CachedEntity {
    /// Unique, stable identifier for this entity.
    fn unique_key(&self) -> String;

    /// Version key of the entity's cache group.
    fn cache_group(&self) -> String {
        format!("{ENTITY_GROUP_PREFIX}{}", self.unique_key())
    }

    /// The cache group as a result cache group.
    fn group_ref(&self) -> GroupRef {
        GroupRef::Named(self.cache_group())
    }

    /// Strip request-local state before the entity is cached.
    fn clear_for_cache(&mut self) {}
}
