//! Short-lived process-local buffer in front of a backend.
//!
//! Version lookups are read far more often than they are written, so each
//! process keeps the tokens it saw for a few seconds. An invalidation issued
//! by another process becomes visible here once the buffered entry ages out;
//! the buffer age is therefore the staleness bound of a buffered read.
//!
//! The buffer never performs I/O. When it reaches its entry limit it is
//! culled wholesale rather than tracking recency per entry.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use strata_core::{expires_at, Clock, Timestamp};

#[derive(Debug, Clone)]
struct Buffered<V> {
    value: V,
    expires_at: Timestamp,
}

/// A concurrent map of values that expire after a per-entry age.
#[derive(Debug)]
pub struct LocalBuffer<V> {
    entries: DashMap<String, Buffered<V>>,
    clock: Arc<dyn Clock>,
    max_entries: usize,
}

impl<V: Clone> LocalBuffer<V> {
    /// Create an empty buffer holding at most `max_entries` values.
    pub fn new(clock: Arc<dyn Clock>, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            max_entries: max_entries.max(1),
        }
    }

    /// Get the buffered value for `key` if it has not aged out.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = self.clock.now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                tracing::trace!(key, "Local buffer hit");
                return Some(entry.value.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Buffer `value` under `key` for `age`. A zero age buffers nothing.
    pub fn insert(&self, key: &str, value: V, age: Duration) {
        if age.is_zero() {
            return;
        }
        if self.entries.len() >= self.max_entries && !self.entries.contains_key(key) {
            tracing::debug!(
                max_entries = self.max_entries,
                "Local buffer full, culling"
            );
            self.entries.clear();
        }
        self.entries.insert(
            key.to_string(),
            Buffered {
                value,
                expires_at: expires_at(self.clock.now(), age),
            },
        );
    }

    /// Drop the buffered value for `key`.
    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    /// Drop every buffered value, returning how many were held.
    pub fn clear(&self) -> usize {
        let held = self.entries.len();
        self.entries.clear();
        held
    }

    /// Number of entries held, including ones that aged out but were not yet read.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
