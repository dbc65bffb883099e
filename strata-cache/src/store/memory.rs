//! In-process key-value store for single-node deployments and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use strata_core::{expires_at, Clock, StoreError, StoreResult, SystemClock, Timestamp};

use super::traits::{KvStore, StoredEntry, SWEEP_INTERVAL};

#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Timestamp>,
}

impl StoredValue {
    fn is_live(&self, now: Timestamp) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// A `HashMap` behind a lock, with TTLs checked lazily against a [`Clock`].
///
/// Expired entries are dropped when read, and swept from the whole map every
/// `sweep_interval` writes; nothing runs in the background.
#[derive(Debug)]
pub struct InMemoryStore {
    entries: RwLock<HashMap<String, StoredValue>>,
    clock: Arc<dyn Clock>,
    writes: AtomicU64,
    sweep_interval: u64,
}

impl InMemoryStore {
    /// Create an empty store on the wall clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty store reading time from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            writes: AtomicU64::new(0),
            sweep_interval: SWEEP_INTERVAL,
        }
    }

    /// Sweep expired entries every `writes` writes instead of
    /// [`SWEEP_INTERVAL`]. Zero is treated as one.
    pub fn with_sweep_interval(mut self, writes: u64) -> Self {
        self.sweep_interval = writes.max(1);
        self
    }

    /// Entries physically held, including expired ones not yet swept.
    pub fn held(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| entries.values().filter(|v| v.is_live(now)).count())
            .unwrap_or(0)
    }

    /// True if no live entries are held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// True if `key` holds a live entry.
    pub fn contains_key(&self, key: &str) -> bool {
        let now = self.clock.now();
        self.entries
            .read()
            .map(|entries| entries.get(key).is_some_and(|v| v.is_live(now)))
            .unwrap_or(false)
    }

    /// Live keys, sorted. Intended for debugging and tests.
    pub fn keys(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut keys: Vec<String> = self
            .entries
            .read()
            .map(|entries| {
                entries
                    .iter()
                    .filter(|(_, v)| v.is_live(now))
                    .map(|(k, _)| k.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Drop every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        match self.entries.write() {
            Ok(mut entries) => {
                let before = entries.len();
                entries.retain(|_, v| v.is_live(now));
                let purged = before - entries.len();
                if purged > 0 {
                    tracing::debug!(purged, held = entries.len(), "Expired entries swept");
                }
                purged
            }
            Err(_) => 0,
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.bytes))
    }

    async fn get_entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        let now = self.clock.now();
        {
            let entries = self.entries.read().map_err(|_| StoreError::LockPoisoned)?;
            match entries.get(key) {
                None => return Ok(None),
                Some(value) if value.is_live(now) => {
                    return Ok(Some(StoredEntry {
                        bytes: value.bytes.clone(),
                        expires_at: value.expires_at,
                    }))
                }
                Some(_) => {}
            }
        }

        // Expired: drop it, unless a writer replaced it in between.
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        if entries.get(key).is_some_and(|v| !v.is_live(now)) {
            entries.remove(key);
        }
        Ok(None)
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let stored = StoredValue {
            bytes: value.to_vec(),
            expires_at: ttl.map(|ttl| expires_at(self.clock.now(), ttl)),
        };
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .insert(key.to_string(), stored);

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_interval == 0 {
            self.purge_expired();
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.entries
            .write()
            .map_err(|_| StoreError::LockPoisoned)?
            .remove(key);
        Ok(())
    }

    async fn clear(&self) -> StoreResult<u64> {
        let mut entries = self.entries.write().map_err(|_| StoreError::LockPoisoned)?;
        let removed = entries.len() as u64;
        entries.clear();
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
