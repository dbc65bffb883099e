//! Named logical caches.
//!
//! Every value lives in one of a few logical caches, each with its own key
//! prefix and default TTL. Spaces may share one physical store; the prefixes
//! keep them apart. Version tokens get their own space so an operator can
//! wipe cached values without losing group versions, and vice versa.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strata_core::{bound_key, CacheSettings, StoreResult};

use crate::store::{KvStore, StoredEntry};

/// Identifies a logical cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheName {
    /// Version tokens for groups and time windows.
    Version,
    /// General purpose values; keys include the code version.
    Default,
    /// Rendered fragments; keys include the code version.
    Template,
    /// Long-lived values that survive deploys.
    Persist,
    /// Per-user session data.
    Session,
}

impl CacheName {
    /// Every logical cache.
    pub const ALL: [CacheName; 5] = [
        CacheName::Version,
        CacheName::Default,
        CacheName::Template,
        CacheName::Persist,
        CacheName::Session,
    ];

    /// Get the name as a string slice.
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheName::Version => "version",
            CacheName::Default => "default",
            CacheName::Template => "template",
            CacheName::Persist => "persist",
            CacheName::Session => "session",
        }
    }

    fn short_code(&self) -> &'static str {
        match self {
            CacheName::Version => "ver",
            CacheName::Default => "def",
            CacheName::Template => "tpl",
            CacheName::Persist => "per",
            CacheName::Session => "ses",
        }
    }

    /// Key prefix for this cache under `settings`.
    pub fn key_prefix(&self, settings: &CacheSettings) -> String {
        match self {
            CacheName::Default | CacheName::Template => format!(
                "{}:{}.{}",
                self.short_code(),
                settings.key_prefix,
                settings.code_version
            ),
            _ => format!("{}:{}", self.short_code(), settings.key_prefix),
        }
    }

    /// Default TTL for this cache under `settings`.
    pub fn default_ttl(&self, settings: &CacheSettings) -> Option<Duration> {
        match self {
            CacheName::Version => settings.version_ttl,
            CacheName::Default => settings.default_ttl,
            CacheName::Template => settings.template_ttl,
            CacheName::Persist => settings.persist_ttl,
            CacheName::Session => settings.session_ttl,
        }
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifetime of a stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// Use the default TTL of the cache being written.
    #[default]
    Default,
    /// Never expire.
    Never,
    /// Expire after the given duration.
    After(Duration),
}

impl Expiry {
    /// Resolve against a cache's default TTL.
    pub fn resolve(self, default: Option<Duration>) -> Option<Duration> {
        match self {
            Expiry::Default => default,
            Expiry::Never => None,
            Expiry::After(ttl) => Some(ttl),
        }
    }
}

impl From<Duration> for Expiry {
    fn from(ttl: Duration) -> Self {
        Expiry::After(ttl)
    }
}

/// One logical cache: a store plus the key prefix and default TTL applied
/// to every key written through it.
#[derive(Clone)]
pub struct CacheSpace {
    name: CacheName,
    store: Arc<dyn KvStore>,
    key_prefix: String,
    default_ttl: Option<Duration>,
    max_key_len: usize,
}

impl CacheSpace {
    /// Create the space `name` over `store`, configured from `settings`.
    pub fn new(name: CacheName, store: Arc<dyn KvStore>, settings: &CacheSettings) -> Self {
        Self {
            name,
            store,
            key_prefix: name.key_prefix(settings),
            default_ttl: name.default_ttl(settings),
            max_key_len: settings.max_key_len,
        }
    }

    /// Which logical cache this is.
    pub fn name(&self) -> CacheName {
        self.name
    }

    /// The backing store.
    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Prefix applied to every key.
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// TTL used for [`Expiry::Default`].
    pub fn default_ttl(&self) -> Option<Duration> {
        self.default_ttl
    }

    /// Physical key for `key`, bounded to the configured maximum length.
    pub fn full_key(&self, key: &str) -> String {
        bound_key(&self.key_prefix, key, self.max_key_len)
    }

    /// Read `key` from the store.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.store.get(&self.full_key(key)).await
    }

    /// Read `key` from the store together with its expiry.
    pub async fn get_entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        self.store.get_entry(&self.full_key(key)).await
    }

    /// Write `key` to the store.
    pub async fn set(&self, key: &str, value: &[u8], expiry: Expiry) -> StoreResult<()> {
        self.store
            .set(&self.full_key(key), value, expiry.resolve(self.default_ttl))
            .await
    }

    /// Delete `key` from the store.
    pub async fn delete(&self, key: &str) -> StoreResult<()> {
        self.store.delete(&self.full_key(key)).await
    }
}

impl fmt::Debug for CacheSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheSpace")
            .field("name", &self.name)
            .field("backend", &self.store.backend_name())
            .field("key_prefix", &self.key_prefix)
            .field("default_ttl", &self.default_ttl)
            .finish()
    }
}

/// The full set of logical caches.
#[derive(Debug, Clone)]
pub struct CacheSpaces {
    version: CacheSpace,
    default: CacheSpace,
    template: CacheSpace,
    persist: CacheSpace,
    session: CacheSpace,
}

impl CacheSpaces {
    /// Create every space over one shared `store`.
    pub fn shared(store: Arc<dyn KvStore>, settings: &CacheSettings) -> Self {
        Self {
            version: CacheSpace::new(CacheName::Version, store.clone(), settings),
            default: CacheSpace::new(CacheName::Default, store.clone(), settings),
            template: CacheSpace::new(CacheName::Template, store.clone(), settings),
            persist: CacheSpace::new(CacheName::Persist, store.clone(), settings),
            session: CacheSpace::new(CacheName::Session, store, settings),
        }
    }

    /// Move one space onto a different store.
    pub fn with_store(
        mut self,
        name: CacheName,
        store: Arc<dyn KvStore>,
        settings: &CacheSettings,
    ) -> Self {
        *self.get_mut(name) = CacheSpace::new(name, store, settings);
        self
    }

    /// Get the space for `name`.
    pub fn get(&self, name: CacheName) -> &CacheSpace {
        match name {
            CacheName::Version => &self.version,
            CacheName::Default => &self.default,
            CacheName::Template => &self.template,
            CacheName::Persist => &self.persist,
            CacheName::Session => &self.session,
        }
    }

    fn get_mut(&mut self, name: CacheName) -> &mut CacheSpace {
        match name {
            CacheName::Version => &mut self.version,
            CacheName::Default => &mut self.default,
            CacheName::Template => &mut self.template,
            CacheName::Persist => &mut self.persist,
            CacheName::Session => &mut self.session,
        }
    }
}
