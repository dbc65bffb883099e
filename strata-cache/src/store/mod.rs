//! Key-value backends holding version tokens and cached values.
//!
//! The engine only needs single-key `get`/`set`/`delete` with an optional
//! TTL. [`InMemoryStore`] covers single-node deployments and tests;
//! [`LmdbStore`] persists across restarts and is shared by every process on
//! one machine. A distributed backend plugs in by implementing [`KvStore`].

pub mod lmdb;
pub mod memory;
pub mod traits;

pub use lmdb::{LmdbStore, LmdbStoreError};
pub use memory::InMemoryStore;
pub use traits::{CacheStats, KvStore, StoredEntry, SWEEP_INTERVAL};
