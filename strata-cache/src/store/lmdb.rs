//! LMDB-backed key-value store for single-node deployments.
//!
//! Uses the heed crate (Rust bindings for LMDB) to provide a persistent,
//! memory-mapped store that survives process restarts, so version tokens
//! and cached values are shared by every worker process on one machine.
//!
//! # Record Format
//!
//! Each value is stored as:
//! - Bytes 0-7: expiry as Unix milliseconds (i64 little-endian, 0 = never)
//! - Bytes 8..: payload
//!
//! Expired records are dropped lazily on read, swept in batches every
//! `sweep_interval` writes, and purged before a write that hit
//! `MDB_MAP_FULL` is retried once.
//!
//! # Thread Safety
//!
//! LMDB provides ACID transactions. The store uses:
//! - Read transactions for `get`
//! - Write transactions for `set`, `delete`, `clear`, lazy expiry and sweeps
//! - Statistics are tracked behind a lock

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};
use strata_core::{expires_at, Clock, StoreError, StoreResult, SystemClock, Timestamp};

use super::traits::{CacheStats, KvStore, StoredEntry, SWEEP_INTERVAL};

/// Size of the expiry header in front of every payload.
const HEADER_LEN: usize = 8;

/// Expired records deleted per write transaction during a sweep.
const PURGE_BATCH: usize = 64;

/// Error type for LMDB store operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbStoreError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open the database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convert LmdbStoreError to StoreError.
impl From<LmdbStoreError> for StoreError {
    fn from(e: LmdbStoreError) -> Self {
        StoreError::Unavailable {
            reason: e.to_string(),
        }
    }
}

fn txn_error(key: &str, e: heed::Error) -> StoreError {
    StoreError::Transaction {
        key: key.to_string(),
        reason: e.to_string(),
    }
}

/// LMDB-backed key-value store.
///
/// # Example
///
/// ```ignore
/// use strata_cache::store::{KvStore, LmdbStore};
///
/// let store = LmdbStore::new("/var/cache/strata", 256)?;
/// store.set("ver:prod:cgsys:tg", b"token", None).await?;
/// let token = store.get("ver:prod:cgsys:tg").await?;
/// ```
pub struct LmdbStore {
    /// The LMDB environment.
    env: Env,
    /// The main database (single unnamed database).
    db: Database<Bytes, Bytes>,
    /// Time source for TTLs.
    clock: Arc<dyn Clock>,
    /// Global statistics.
    stats: Arc<RwLock<CacheStats>>,
    /// Successful writes, for scheduling sweeps.
    writes: AtomicU64,
    sweep_interval: u64,
}

impl LmdbStore {
    /// Create a new LMDB store on the wall clock.
    ///
    /// # Arguments
    ///
    /// * `path` - Directory where LMDB files will be stored
    /// * `max_size_mb` - Maximum size of the database in megabytes
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory cannot be created
    /// - LMDB environment cannot be opened
    /// - Database cannot be created
    pub fn new<P: AsRef<Path>>(path: P, max_size_mb: usize) -> Result<Self, LmdbStoreError> {
        Self::with_clock(path, max_size_mb, Arc::new(SystemClock))
    }

    /// Create a new LMDB store reading time from `clock`.
    pub fn with_clock<P: AsRef<Path>>(
        path: P,
        max_size_mb: usize,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, LmdbStoreError> {
        // Ensure directory exists
        std::fs::create_dir_all(&path)?;

        // Open LMDB environment
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(max_size_mb * 1024 * 1024)
                .max_dbs(1)
                .open(path.as_ref())
        }
        .map_err(|e| LmdbStoreError::EnvOpen(e.to_string()))?;

        // Open the default database
        let mut wtxn = env
            .write_txn()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        let db: Database<Bytes, Bytes> = env
            .create_database(&mut wtxn, None)
            .map_err(|e| LmdbStoreError::DbOpen(e.to_string()))?;

        wtxn.commit()
            .map_err(|e| LmdbStoreError::Transaction(e.to_string()))?;

        Ok(Self {
            env,
            db,
            clock,
            stats: Arc::new(RwLock::new(CacheStats::default())),
            writes: AtomicU64::new(0),
            sweep_interval: SWEEP_INTERVAL,
        })
    }

    /// Sweep expired records every `writes` writes instead of
    /// [`SWEEP_INTERVAL`]. Zero is treated as one.
    pub fn with_sweep_interval(mut self, writes: u64) -> Self {
        self.sweep_interval = writes.max(1);
        self
    }

    /// Get a snapshot of the store statistics.
    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().map(|s| s.clone()).unwrap_or_default();
        if let Ok(rtxn) = self.env.read_txn() {
            stats.entry_count = self.db.len(&rtxn).unwrap_or(0);
        }
        stats
    }

    fn record_hit(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.hits += 1;
        }
    }

    fn record_miss(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.misses += 1;
        }
    }

    fn record_set(&self) {
        if let Ok(mut stats) = self.stats.write() {
            stats.sets += 1;
        }
    }

    fn encode(value: &[u8], expires: Option<Timestamp>) -> Vec<u8> {
        let millis = expires.map(|at| at.timestamp_millis().max(1)).unwrap_or(0);
        let mut bytes = Vec::with_capacity(HEADER_LEN + value.len());
        bytes.extend_from_slice(&millis.to_le_bytes());
        bytes.extend_from_slice(value);
        bytes
    }

    /// Split a record into its expiry millis and payload.
    fn split<'a>(key: &str, bytes: &'a [u8]) -> StoreResult<(i64, &'a [u8])> {
        if bytes.len() < HEADER_LEN {
            return Err(StoreError::Deserialization {
                key: key.to_string(),
                reason: "record shorter than expiry header".to_string(),
            });
        }
        let header: [u8; HEADER_LEN] =
            bytes[0..HEADER_LEN]
                .try_into()
                .map_err(|_| StoreError::Deserialization {
                    key: key.to_string(),
                    reason: "invalid expiry header".to_string(),
                })?;
        Ok((i64::from_le_bytes(header), &bytes[HEADER_LEN..]))
    }

    fn is_expired(millis: i64, now: Timestamp) -> bool {
        millis != 0 && millis <= now.timestamp_millis()
    }

    /// The live entry held in `bytes`, or `None` if it has expired.
    fn decode(key: &str, bytes: &[u8], now: Timestamp) -> StoreResult<Option<StoredEntry>> {
        let (millis, payload) = Self::split(key, bytes)?;
        if Self::is_expired(millis, now) {
            return Ok(None);
        }
        let expires_at = match millis {
            0 => None,
            millis => chrono::DateTime::from_timestamp_millis(millis),
        };
        Ok(Some(StoredEntry {
            bytes: payload.to_vec(),
            expires_at,
        }))
    }

    fn put(&self, key: &str, record: &[u8]) -> heed::Result<()> {
        let mut wtxn = self.env.write_txn()?;
        self.db.put(&mut wtxn, key.as_bytes(), record)?;
        wtxn.commit()
    }

    /// Delete every expired record, returning how many were removed.
    ///
    /// Keys are collected under a read transaction, then deleted in batches
    /// so each commit frees pages the next batch can reuse, even when the
    /// map is full.
    pub fn purge_expired(&self) -> StoreResult<usize> {
        let now = self.clock.now();
        let expired: Vec<Vec<u8>> = {
            let rtxn = self.env.read_txn().map_err(|e| txn_error("*", e))?;
            let mut keys = Vec::new();
            for item in self.db.iter(&rtxn).map_err(|e| txn_error("*", e))? {
                let (key, bytes) = item.map_err(|e| txn_error("*", e))?;
                if let Ok((millis, _)) = Self::split("*", bytes) {
                    if Self::is_expired(millis, now) {
                        keys.push(key.to_vec());
                    }
                }
            }
            keys
        };

        let mut purged = 0;
        for batch in expired.chunks(PURGE_BATCH) {
            let mut wtxn = self.env.write_txn().map_err(|e| txn_error("*", e))?;
            for key in batch {
                // Skip keys rewritten since they were collected
                let still_expired = match self.db.get(&wtxn, key) {
                    Ok(Some(bytes)) => Self::split("*", bytes)
                        .map(|(millis, _)| Self::is_expired(millis, now))
                        .unwrap_or(false),
                    _ => false,
                };
                if still_expired
                    && self.db.delete(&mut wtxn, key).map_err(|e| txn_error("*", e))?
                {
                    purged += 1;
                }
            }
            wtxn.commit().map_err(|e| txn_error("*", e))?;
        }

        if purged > 0 {
            tracing::debug!(purged, "Expired LMDB records swept");
        }
        Ok(purged)
    }

    /// Delete `key` only if it still holds an expired record.
    fn drop_if_expired(&self, key: &str, now: Timestamp) -> StoreResult<()> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(key, e))?;
        let expired = match self.db.get(&wtxn, key.as_bytes()) {
            Ok(Some(bytes)) => matches!(Self::decode(key, bytes, now), Ok(None)),
            _ => false,
        };
        if expired {
            self.db
                .delete(&mut wtxn, key.as_bytes())
                .map_err(|e| txn_error(key, e))?;
        }
        wtxn.commit().map_err(|e| txn_error(key, e))
    }
}

#[async_trait]
impl KvStore for LmdbStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.get_entry(key).await?.map(|entry| entry.bytes))
    }

    async fn get_entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        let now = self.clock.now();
        let decoded = {
            let rtxn = self.env.read_txn().map_err(|e| txn_error(key, e))?;
            match self.db.get(&rtxn, key.as_bytes()) {
                Ok(Some(bytes)) => Some(Self::decode(key, bytes, now)?),
                Ok(None) => None,
                Err(e) => {
                    self.record_miss();
                    return Err(txn_error(key, e));
                }
            }
        };

        match decoded {
            Some(Some(entry)) => {
                self.record_hit();
                Ok(Some(entry))
            }
            Some(None) => {
                self.record_miss();
                self.drop_if_expired(key, now)?;
                Ok(None)
            }
            None => {
                self.record_miss();
                Ok(None)
            }
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        let expires = ttl.map(|ttl| expires_at(self.clock.now(), ttl));
        let record = Self::encode(value, expires);

        match self.put(key, &record) {
            Ok(()) => {}
            Err(heed::Error::Mdb(heed::MdbError::MapFull)) => {
                let purged = self.purge_expired()?;
                tracing::warn!(key, purged, "LMDB map full, retrying write after purge");
                self.put(key, &record).map_err(|e| txn_error(key, e))?;
            }
            Err(e) => return Err(txn_error(key, e)),
        }
        self.record_set();

        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % self.sweep_interval == 0 {
            if let Err(e) = self.purge_expired() {
                tracing::warn!(error = %e, "LMDB sweep failed");
            }
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error(key, e))?;
        self.db
            .delete(&mut wtxn, key.as_bytes())
            .map_err(|e| txn_error(key, e))?;
        wtxn.commit().map_err(|e| txn_error(key, e))
    }

    async fn clear(&self) -> StoreResult<u64> {
        let mut wtxn = self.env.write_txn().map_err(|e| txn_error("*", e))?;
        let removed = self.db.len(&wtxn).map_err(|e| txn_error("*", e))?;
        self.db.clear(&mut wtxn).map_err(|e| txn_error("*", e))?;
        wtxn.commit().map_err(|e| txn_error("*", e))?;
        Ok(removed)
    }

    fn backend_name(&self) -> &'static str {
        "lmdb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use strata_core::ManualClock;
    use tempfile::TempDir;

    fn create_test_store() -> (LmdbStore, ManualClock, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let store = LmdbStore::with_clock(temp_dir.path(), 10, Arc::new(clock.clone()))
            .expect("store creation should succeed");
        (store, clock, temp_dir)
    }

    #[tokio::test]
    async fn test_set_and_get() {
        let (store, _clock, _temp_dir) = create_test_store();

        store
            .set("ver:dev:cgsys:tg", b"cgsys:tg(abc)", None)
            .await
            .expect("set should succeed");

        let value = store
            .get("ver:dev:cgsys:tg")
            .await
            .expect("get should succeed");
        assert_eq!(value, Some(b"cgsys:tg(abc)".to_vec()));
    }

    #[tokio::test]
    async fn test_get_nonexistent() {
        let (store, _clock, _temp_dir) = create_test_store();
        let value = store.get("missing").await.expect("get should succeed");
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_delete() {
        let (store, _clock, _temp_dir) = create_test_store();

        store.set("k", b"v", None).await.expect("set should succeed");
        store.delete("k").await.expect("delete should succeed");
        assert!(store.get("k").await.expect("get should succeed").is_none());

        // Deleting again is fine
        store.delete("k").await.expect("delete should succeed");
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let (store, clock, _temp_dir) = create_test_store();

        store
            .set("window", b"start", Some(Duration::from_secs(300)))
            .await
            .expect("set should succeed");

        clock.advance(Duration::from_secs(299));
        assert!(store.get("window").await.expect("get").is_some());

        clock.advance(Duration::from_secs(1));
        assert!(store.get("window").await.expect("get").is_none());

        // Lazily removed
        assert_eq!(store.stats().entry_count, 0);
    }

    /// A 1 MB store.
    fn create_small_store() -> (LmdbStore, ManualClock, TempDir) {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let store = LmdbStore::with_clock(temp_dir.path(), 1, Arc::new(clock.clone()))
            .expect("store creation should succeed");
        (store, clock, temp_dir)
    }

    /// Writes `count` distinct keys that are never read back, each outliving
    /// its TTL before the next write.
    async fn write_orphans(store: &LmdbStore, clock: &ManualClock, count: usize) {
        let payload = [7u8; 200];
        for i in 0..count {
            store
                .set(&format!("res:orphan:{i}"), &payload, Some(Duration::from_secs(1)))
                .await
                .unwrap_or_else(|e| panic!("set #{i} should succeed: {e}"));
            clock.advance(Duration::from_secs(2));
        }
    }

    #[tokio::test]
    async fn test_orphaned_records_are_swept_on_write() {
        let (store, clock, _temp_dir) = create_small_store();

        write_orphans(&store, &clock, 3000).await;

        assert!(store.stats().entry_count <= SWEEP_INTERVAL);
        assert_eq!(store.stats().sets, 3000);
    }

    #[tokio::test]
    async fn test_map_full_purges_and_retries() {
        let (store, clock, _temp_dir) = create_small_store();
        let store = store.with_sweep_interval(u64::MAX);

        // More than a 1 MB map holds without reclaiming expired records
        write_orphans(&store, &clock, 3000).await;

        store.set("live", b"v", None).await.expect("set should succeed");
        assert_eq!(store.get("live").await.expect("get"), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_live_records() {
        let (store, clock, _temp_dir) = create_test_store();

        store.set("short", b"1", Some(Duration::from_secs(1))).await.expect("set");
        store.set("long", b"2", Some(Duration::from_secs(60))).await.expect("set");
        store.set("forever", b"3", None).await.expect("set");
        clock.advance(Duration::from_secs(5));

        assert_eq!(store.purge_expired().expect("purge should succeed"), 1);
        assert_eq!(store.stats().entry_count, 2);
        assert!(store.get("long").await.expect("get").is_some());
    }

    #[tokio::test]
    async fn test_get_entry_reports_expiry() {
        let (store, clock, _temp_dir) = create_test_store();

        store.set("k", b"v", Some(Duration::from_secs(30))).await.expect("set");
        store.set("forever", b"v", None).await.expect("set");

        let entry = store.get_entry("k").await.expect("get").expect("present");
        assert_eq!(entry.bytes, b"v".to_vec());
        assert_eq!(
            entry.expires_at,
            Some(clock.now() + chrono::Duration::seconds(30))
        );
        let forever = store.get_entry("forever").await.expect("get").expect("present");
        assert_eq!(forever.expires_at, None);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let (store, _clock, _temp_dir) = create_test_store();

        store.set("k", b"first", None).await.expect("set");
        store.set("k", b"second", None).await.expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some(b"second".to_vec()));
    }

    #[tokio::test]
    async fn test_empty_payload_round_trips() {
        let (store, _clock, _temp_dir) = create_test_store();

        store.set("empty", b"", None).await.expect("set");
        assert_eq!(store.get("empty").await.expect("get"), Some(Vec::new()));
    }

    #[tokio::test]
    async fn test_clear() {
        let (store, _clock, _temp_dir) = create_test_store();

        for i in 0..4 {
            store
                .set(&format!("k{i}"), b"v", None)
                .await
                .expect("set should succeed");
        }
        assert_eq!(store.clear().await.expect("clear should succeed"), 4);
        assert!(store.get("k0").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_stats() {
        let (store, _clock, _temp_dir) = create_test_store();

        // Miss
        let _ = store.get("k").await;

        // Set
        store.set("k", b"v", None).await.expect("set should succeed");

        // Hits
        let _ = store.get("k").await;
        let _ = store.get("k").await;

        let stats = store.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.sets, 1);
        assert_eq!(stats.entry_count, 1);
    }

    #[tokio::test]
    async fn test_survives_reopen() {
        let temp_dir = TempDir::new().expect("TempDir creation should succeed");
        {
            let store = LmdbStore::new(temp_dir.path(), 10).expect("open");
            store.set("persisted", b"yes", None).await.expect("set");
        }
        let store = LmdbStore::new(temp_dir.path(), 10).expect("reopen");
        assert_eq!(
            store.get("persisted").await.expect("get"),
            Some(b"yes".to_vec())
        );
    }
}
