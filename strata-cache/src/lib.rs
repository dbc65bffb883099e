//! STRATA Cache - tenant-scoped cache versioning engine
//!
//! Cached values are keyed by version tokens of the scopes they depend on.
//! Invalidating a scope deletes one version key; every value cached under
//! the old token becomes unreachable in O(1), with no walk over dependents.
//!
//! Layers, leaf first:
//!
//! - [`store`]: key-value backends (`InMemoryStore`, `LmdbStore`)
//! - [`version`]: get-or-create and invalidate version tokens, locally buffered
//! - [`groups`]: system, provider and sandbox tiers chained through tokens
//! - [`timewin`]: time windows for snapshot-plus-delta caching
//! - [`result`]: distributed memoization of function results
//! - [`stash`]: per-instance memoization, never distributed
//! - [`engine`]: the service object wiring it all together

pub mod buffer;
pub mod engine;
pub mod entity;
pub mod events;
pub mod groups;
pub mod policy;
pub mod result;
pub mod spaces;
pub mod stash;
pub mod store;
pub mod timewin;
pub mod version;

pub use buffer::LocalBuffer;
pub use engine::{CacheEngine, CacheEngineBuilder};
pub use entity::{CachedEntity, ENTITY_GROUP_PREFIX};
pub use events::{InvalidationBus, InvalidationEvent, InvalidationListener};
pub use groups::{CacheGroup, CacheGroups, TierBuffering, DEFAULT_NAMESPACE};
pub use policy::ErrorPolicy;
pub use result::{CachedFn, CallKey, CallOptions, GroupRef, KeyFn, ResultCache, WindowScope};
pub use spaces::{CacheName, CacheSpace, CacheSpaces, Expiry};
pub use stash::{Stash, Stashed};
pub use store::{
    CacheStats, InMemoryStore, KvStore, LmdbStore, LmdbStoreError, StoredEntry, SWEEP_INTERVAL,
};
pub use timewin::{window_key, TimeWindows, WINDOW_HASH_LEN};
pub use version::{VersionKeyStore, VersionRequest};
