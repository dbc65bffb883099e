//! Key-value backend trait and usage statistics.
//!
//! This module defines the trait that distributed or local backends must
//! implement to hold version tokens and cached values.

use std::time::Duration;

use async_trait::async_trait;
use strata_core::{StoreResult, Timestamp};

/// Writes between sweeps of expired entries in the bundled stores.
///
/// Orphaned entries are never read again, so lazy expiry on read alone
/// would never reclaim them.
pub const SWEEP_INTERVAL: u64 = 256;

/// A stored value together with its expiry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEntry {
    pub bytes: Vec<u8>,
    /// `None` when the entry never expires or the backend cannot tell.
    pub expires_at: Option<Timestamp>,
}

/// Key-value backend for pluggable store implementations.
///
/// This trait abstracts over different backends (e.g., Redis, LMDB,
/// in-memory). Implementations must be thread-safe and support concurrent
/// access from many tasks.
///
/// # Guarantees
///
/// None beyond single-key get/set/delete: no ordering across keys, no
/// batching, no transactions. A TTL is advisory; a backend may evict early
/// under memory pressure but must never return a value after its TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Get the raw bytes stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Like [`KvStore::get`], also reporting when the entry expires.
    ///
    /// Backends that do not track expiry keep this default, which reports
    /// none.
    async fn get_entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        Ok(self.get(key).await?.map(|bytes| StoredEntry {
            bytes,
            expires_at: None,
        }))
    }

    /// Store `value` under `key`, replacing any previous value.
    ///
    /// `ttl` of `None` means the entry never expires.
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()>;

    /// Delete `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Remove every entry in this backend.
    ///
    /// This is an operations tool, never part of cache invalidation.
    /// Returns the number of entries removed when the backend knows it.
    async fn clear(&self) -> StoreResult<u64>;

    /// Short backend name for logs.
    fn backend_name(&self) -> &'static str;
}

/// Statistics about cache usage.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of cache hits.
    pub hits: u64,
    /// Number of cache misses.
    pub misses: u64,
    /// Number of values written.
    pub sets: u64,
    /// Number of backend errors absorbed.
    pub errors: u64,
    /// Number of entries currently held, when known.
    pub entry_count: u64,
}

impl CacheStats {
    /// Calculate the hit rate (0.0 to 1.0).
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_stats_hit_rate() {
        let stats = CacheStats {
            hits: 80,
            misses: 20,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 0.8).abs() < 0.001);

        let empty_stats = CacheStats::default();
        assert!((empty_stats.hit_rate() - 0.0).abs() < 0.001);
    }
}
