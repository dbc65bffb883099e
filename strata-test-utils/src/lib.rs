//! STRATA Test Utilities
//!
//! Centralized test infrastructure for the STRATA workspace:
//! - Store doubles that count calls or fail on demand
//! - Proptest generators for groups, ids and settings
//! - Engine fixtures on a manual clock
//! - Custom assertions for version tokens

// Re-export core and cache types for convenience
pub use strata_cache::{
    CacheEngine, CacheGroup, CacheName, CallKey, CallOptions, GroupRef, InMemoryStore, KvStore,
    StoredEntry,
};
pub use strata_core::{
    CacheSettings, Clock, ManualClock, ProviderId, SandboxId, StoreError, StoreResult, Timestamp,
};

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};

// ============================================================================
// STORE DOUBLES
// ============================================================================

/// Snapshot of calls made against a [`CountingStore`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub gets: u64,
    pub sets: u64,
    pub deletes: u64,
}

/// In-memory store that counts every call, for asserting round trips.
#[derive(Debug)]
pub struct CountingStore {
    inner: InMemoryStore,
    gets: AtomicU64,
    sets: AtomicU64,
    deletes: AtomicU64,
}

impl CountingStore {
    /// Create an empty counting store on `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: InMemoryStore::with_clock(clock),
            gets: AtomicU64::new(0),
            sets: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    /// Calls made so far.
    pub fn counts(&self) -> CallCounts {
        CallCounts {
            gets: self.gets.load(Ordering::SeqCst),
            sets: self.sets.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
        }
    }

    /// Reset every counter to zero.
    pub fn reset_counts(&self) {
        self.gets.store(0, Ordering::SeqCst);
        self.sets.store(0, Ordering::SeqCst);
        self.deletes.store(0, Ordering::SeqCst);
    }

    /// The wrapped store, for inspecting keys.
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }
}

#[async_trait]
impl KvStore for CountingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn get_entry(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get_entry(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.sets.fetch_add(1, Ordering::SeqCst);
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(key).await
    }

    async fn clear(&self) -> StoreResult<u64> {
        self.inner.clear().await
    }

    fn backend_name(&self) -> &'static str {
        "counting"
    }
}

/// Store that fails every call while failing is switched on.
///
/// Starts failing. While healthy it behaves like an [`InMemoryStore`].
#[derive(Debug)]
pub struct FailingStore {
    inner: InMemoryStore,
    failing: AtomicBool,
}

impl FailingStore {
    /// Create a store that fails until [`FailingStore::set_failing`] turns it off.
    pub fn new() -> Self {
        Self {
            inner: InMemoryStore::new(),
            failing: AtomicBool::new(true),
        }
    }

    /// Switch failures on or off.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::unavailable("connection refused"))
        } else {
            Ok(())
        }
    }
}

impl Default for FailingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KvStore for FailingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        self.check()?;
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> StoreResult<()> {
        self.check()?;
        self.inner.set(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check()?;
        self.inner.delete(key).await
    }

    async fn clear(&self) -> StoreResult<u64> {
        self.check()?;
        self.inner.clear().await
    }

    fn backend_name(&self) -> &'static str {
        "failing"
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for generating STRATA types.

    use super::*;
    use proptest::prelude::*;

    /// Generate a group namespace.
    pub fn arb_namespace() -> impl Strategy<Value = String> {
        prop_oneof![
            Just("tg".to_string()),
            Just("cnt".to_string()),
            Just("twcnt".to_string()),
            "[a-z]{1,8}",
        ]
    }

    /// Generate a ProviderId.
    pub fn arb_provider_id() -> impl Strategy<Value = ProviderId> {
        (1u64..10_000).prop_map(ProviderId)
    }

    /// Generate a SandboxId.
    pub fn arb_sandbox_id() -> impl Strategy<Value = SandboxId> {
        (1u64..100_000).prop_map(SandboxId)
    }

    /// Generate any tier group.
    pub fn arb_cache_group() -> impl Strategy<Value = CacheGroup> {
        prop_oneof![
            arb_namespace().prop_map(|ns| CacheGroup::system(ns)),
            (arb_provider_id(), arb_namespace(), any::<bool>())
                .prop_map(|(p, ns, chain)| CacheGroup::provider(p, ns, chain)),
            (
                arb_sandbox_id(),
                proptest::option::of(arb_provider_id()),
                arb_namespace(),
                any::<bool>()
            )
                .prop_map(|(s, p, ns, chain)| CacheGroup::sandbox(s, p, ns, chain)),
        ]
    }

    /// Generate a logical cache name.
    pub fn arb_cache_name() -> impl Strategy<Value = CacheName> {
        prop::sample::select(CacheName::ALL.to_vec())
    }

    /// Generate a key fragment, including characters unsafe in backend keys.
    pub fn arb_fragment() -> impl Strategy<Value = String> {
        prop_oneof![
            "[a-z0-9.]{0,16}",
            ".{0,300}",
        ]
    }

    /// Generate a Timestamp (2020-2030).
    pub fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
        (1577836800i64..1893456000i64)
            .prop_map(|secs| chrono::DateTime::from_timestamp(secs, 0).unwrap_or_else(Utc::now))
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built engines and clocks for common testing scenarios.

    use super::*;

    /// A manual clock fixed at 2024-03-01 12:00:00 UTC.
    pub fn test_clock() -> ManualClock {
        let start = Utc
            .with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
            .single()
            .unwrap_or_else(Utc::now);
        ManualClock::new(start)
    }

    /// Settings for tests: a `test` key prefix and production defaults.
    pub fn test_settings() -> CacheSettings {
        CacheSettings::default()
            .with_key_prefix("test")
            .with_code_version("1")
    }

    /// An engine over a counting store on a manual clock.
    pub struct EngineFixture {
        pub engine: Arc<CacheEngine>,
        pub clock: ManualClock,
        pub store: Arc<CountingStore>,
    }

    impl EngineFixture {
        /// Move time forward.
        pub fn advance(&self, by: Duration) {
            self.clock.advance(by);
        }
    }

    /// Build an [`EngineFixture`] with [`test_settings`].
    pub fn engine_fixture() -> EngineFixture {
        engine_fixture_with(test_settings())
    }

    /// Build an [`EngineFixture`] with custom settings.
    ///
    /// # Panics
    ///
    /// Panics if `settings` fail validation.
    pub fn engine_fixture_with(settings: CacheSettings) -> EngineFixture {
        let clock = test_clock();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(CountingStore::new(shared.clone()));
        let engine = CacheEngine::builder(settings)
            .with_clock(shared)
            .with_store(store.clone())
            .build()
            .expect("test settings should be valid");
        EngineFixture {
            engine: Arc::new(engine),
            clock,
            store,
        }
    }

    /// Build an engine whose every backend call fails.
    ///
    /// # Panics
    ///
    /// Panics if `settings` fail validation.
    pub fn failing_engine(settings: CacheSettings) -> (CacheEngine, Arc<FailingStore>) {
        let store = Arc::new(FailingStore::new());
        let engine = CacheEngine::builder(settings)
            .with_clock(Arc::new(test_clock()))
            .with_store(store.clone())
            .build()
            .expect("test settings should be valid");
        (engine, store)
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions for version tokens.

    /// Assert `token` has the form `"{prefix}({random})"` with a random part
    /// of `random_len` alphanumeric characters.
    pub fn assert_prefixed_token(token: &str, prefix: &str, random_len: usize) {
        let rest = token
            .strip_prefix(prefix)
            .unwrap_or_else(|| panic!("token {token:?} should start with {prefix:?}"));
        let random = rest
            .strip_prefix('(')
            .and_then(|r| r.strip_suffix(')'))
            .unwrap_or_else(|| panic!("token {token:?} should end with (random)"));
        assert_eq!(
            random.len(),
            random_len,
            "random part of {token:?} has wrong length"
        );
        assert!(
            random.chars().all(|c| c.is_ascii_alphanumeric()),
            "random part of {token:?} should be alphanumeric"
        );
    }

    /// Assert every token in `tokens` is distinct.
    pub fn assert_all_distinct(tokens: &[String]) {
        let mut seen = std::collections::HashSet::new();
        for token in tokens {
            assert!(seen.insert(token), "duplicate token {token:?}");
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
