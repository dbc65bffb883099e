//! The cache engine service object.
//!
//! Constructed once at process start and shared (usually behind an `Arc`)
//! with request handlers and model code. Owns the stores, version keys,
//! tier groups, time windows, result cache and the invalidation bus, and is
//! the place invalidations are issued so listeners always hear about them.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_core::{CacheSettings, Clock, ProviderId, SandboxId, StrataResult, SystemClock, Timestamp};

use crate::entity::{CachedEntity, ENTITY_GROUP_PREFIX};
use crate::events::{InvalidationBus, InvalidationEvent, InvalidationListener};
use crate::groups::{CacheGroup, CacheGroups, TierBuffering};
use crate::result::{CallKey, CallOptions, GroupRef, ResultCache};
use crate::spaces::{CacheName, CacheSpaces};
use crate::store::{CacheStats, InMemoryStore, KvStore};
use crate::timewin::TimeWindows;
use crate::version::{VersionKeyStore, VersionRequest};

/// Builder for [`CacheEngine`].
pub struct CacheEngineBuilder {
    settings: CacheSettings,
    clock: Option<Arc<dyn Clock>>,
    store: Option<Arc<dyn KvStore>>,
    overrides: Vec<(CacheName, Arc<dyn KvStore>)>,
}

impl CacheEngineBuilder {
    /// Start from `settings`.
    pub fn new(settings: CacheSettings) -> Self {
        Self {
            settings,
            clock: None,
            store: None,
            overrides: Vec::new(),
        }
    }

    /// Read time from `clock` instead of the wall clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Back every cache with `store` unless overridden.
    pub fn with_store(mut self, store: Arc<dyn KvStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Back the cache `name` with its own `store`.
    pub fn with_store_for(mut self, name: CacheName, store: Arc<dyn KvStore>) -> Self {
        self.overrides.push((name, store));
        self
    }

    /// Validate the settings and wire the engine.
    ///
    /// Without a store, an [`InMemoryStore`] on the engine's clock is used.
    pub fn build(self) -> StrataResult<CacheEngine> {
        self.settings.validate()?;

        let settings = self.settings;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryStore::with_clock(clock.clone())));

        let mut spaces = CacheSpaces::shared(store, &settings);
        for (name, store) in self.overrides {
            spaces = spaces.with_store(name, store, &settings);
        }

        let versions = Arc::new(VersionKeyStore::new(
            spaces.get(CacheName::Version).clone(),
            clock.clone(),
            &settings,
        ));
        let groups = CacheGroups::new(versions.clone(), TierBuffering::from_settings(&settings));
        let windows = TimeWindows::new(versions.clone(), clock.clone(), settings.buffer_version);
        let results = Arc::new(ResultCache::new(
            spaces.clone(),
            versions.clone(),
            groups.clone(),
            windows.clone(),
            clock.clone(),
            &settings,
        ));

        tracing::info!(
            key_prefix = %settings.key_prefix,
            code_version = %settings.code_version,
            backend = spaces.get(CacheName::Default).store().backend_name(),
            "Cache engine ready"
        );

        Ok(CacheEngine {
            settings,
            clock,
            spaces,
            versions,
            groups,
            windows,
            results,
            bus: InvalidationBus::new(),
        })
    }
}

/// Tenant-scoped cache versioning, time windows and result memoization.
#[derive(Debug)]
pub struct CacheEngine {
    settings: CacheSettings,
    clock: Arc<dyn Clock>,
    spaces: CacheSpaces,
    versions: Arc<VersionKeyStore>,
    groups: CacheGroups,
    windows: TimeWindows,
    results: Arc<ResultCache>,
    bus: InvalidationBus,
}

impl CacheEngine {
    /// Engine over an in-memory store on the wall clock.
    pub fn new(settings: CacheSettings) -> StrataResult<Self> {
        Self::builder(settings).build()
    }

    /// Start building an engine.
    pub fn builder(settings: CacheSettings) -> CacheEngineBuilder {
        CacheEngineBuilder::new(settings)
    }

    /// Settings the engine was built with.
    pub fn settings(&self) -> &CacheSettings {
        &self.settings
    }

    /// The engine's time source.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Logical caches and their stores.
    pub fn spaces(&self) -> &CacheSpaces {
        &self.spaces
    }

    /// Version key store.
    pub fn versions(&self) -> &Arc<VersionKeyStore> {
        &self.versions
    }

    /// Tier group resolver.
    pub fn groups(&self) -> &CacheGroups {
        &self.groups
    }

    /// Time windows.
    pub fn windows(&self) -> &TimeWindows {
        &self.windows
    }

    /// Result cache, for wrapping functions with `CachedFn`.
    pub fn results(&self) -> &Arc<ResultCache> {
        &self.results
    }

    /// Register an invalidation listener.
    pub fn subscribe(&self, listener: Arc<dyn InvalidationListener>) {
        self.bus.subscribe(listener);
    }

    /// The invalidation bus.
    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    // ------------------------------------------------------------------
    // Version keys and groups

    /// Current token of a version key, buffered for `buffer_version`.
    pub async fn version(&self, version_key: &str) -> StrataResult<String> {
        self.versions
            .get_or_create(VersionRequest::new(version_key).buffered(self.settings.buffer_version))
            .await
    }

    /// Invalidate a plain version key.
    pub async fn invalidate_group(&self, version_key: &str) -> StrataResult<()> {
        self.versions.invalidate(version_key).await?;
        self.bus.emit(&InvalidationEvent::Group {
            version_key: version_key.to_string(),
        });
        Ok(())
    }

    /// Token of the system group for `namespace`.
    pub async fn system_group(&self, namespace: &str) -> StrataResult<String> {
        self.groups.system_group(namespace).await
    }

    /// Token of a provider group.
    pub async fn provider_group(
        &self,
        provider: ProviderId,
        namespace: &str,
        chain_to_system: bool,
    ) -> StrataResult<String> {
        self.groups
            .provider_group(provider, namespace, chain_to_system)
            .await
    }

    /// Token of a sandbox group.
    pub async fn sandbox_group(
        &self,
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: &str,
        chain_to_system: bool,
    ) -> StrataResult<String> {
        self.groups
            .sandbox_group(sandbox, provider, namespace, chain_to_system)
            .await
    }

    /// Invalidate a system group and everything chained below it.
    pub async fn invalidate_system(&self, namespace: &str) -> StrataResult<()> {
        self.groups.invalidate_system(namespace).await?;
        self.bus.emit(&InvalidationEvent::System {
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    /// Invalidate a provider group and everything chained below it.
    pub async fn invalidate_provider(
        &self,
        provider: ProviderId,
        namespace: &str,
    ) -> StrataResult<()> {
        self.groups.invalidate_provider(provider, namespace).await?;
        self.bus.emit(&InvalidationEvent::Provider {
            provider,
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    /// Invalidate a sandbox group.
    pub async fn invalidate_sandbox(
        &self,
        sandbox: SandboxId,
        provider: Option<ProviderId>,
        namespace: &str,
    ) -> StrataResult<()> {
        self.groups
            .invalidate_sandbox(sandbox, provider, namespace)
            .await?;
        self.bus.emit(&InvalidationEvent::Sandbox {
            sandbox,
            provider,
            namespace: namespace.to_string(),
        });
        Ok(())
    }

    /// Invalidate any tier group.
    pub async fn invalidate_tier(&self, group: &CacheGroup) -> StrataResult<()> {
        match group {
            CacheGroup::System { namespace } => self.invalidate_system(namespace).await,
            CacheGroup::Provider {
                provider,
                namespace,
                ..
            } => self.invalidate_provider(*provider, namespace).await,
            CacheGroup::Sandbox {
                sandbox,
                provider,
                namespace,
                ..
            } => {
                self.invalidate_sandbox(*sandbox, *provider, namespace)
                    .await
            }
        }
    }

    // ------------------------------------------------------------------
    // Time windows

    /// Start of the window for `key`, starting one if none is active.
    pub async fn timewin_start(&self, key: &str, length: Duration) -> StrataResult<Timestamp> {
        self.windows.start(key, length).await
    }

    /// Start of the active window for `key`, if any.
    pub async fn timewin_peek(&self, key: &str) -> StrataResult<Option<Timestamp>> {
        self.windows.peek(key).await
    }

    /// Cache-busting hash of the window for `key`.
    pub async fn timewin_hash(&self, key: &str) -> StrataResult<String> {
        self.windows.hash(key).await
    }

    /// End the window for `key` early.
    pub async fn invalidate_window(&self, key: &str) -> StrataResult<()> {
        self.windows.invalidate(key).await?;
        self.bus.emit(&InvalidationEvent::Window {
            key: key.to_string(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Results

    /// Cached result of `name` under `key`; see [`ResultCache::call`].
    pub async fn cached<T, F, Fut>(
        &self,
        name: &str,
        key: &CallKey,
        options: &CallOptions,
        compute: F,
    ) -> StrataResult<Option<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<T>>,
    {
        self.results.call(name, key, options, compute).await
    }

    /// Remove one cached result.
    pub async fn invalidate_key(
        &self,
        name: &str,
        key: &CallKey,
        cache: CacheName,
    ) -> StrataResult<()> {
        self.results.invalidate_key(name, key, cache).await?;
        self.bus.emit(&InvalidationEvent::Key {
            cache,
            name: name.to_string(),
            fragment: key.fragment.clone(),
        });
        Ok(())
    }

    // ------------------------------------------------------------------
    // Entities

    /// Invalidate everything cached under the entity's group.
    pub async fn invalidate_entity<E: CachedEntity + ?Sized>(&self, entity: &E) -> StrataResult<()> {
        self.invalidate_group(&entity.cache_group()).await
    }

    /// Current version token of the entity's group.
    pub async fn entity_group_version<E: CachedEntity + ?Sized>(
        &self,
        entity: &E,
    ) -> StrataResult<String> {
        self.version(&entity.cache_group()).await
    }

    /// Load an entity through the cache, grouped under its default cache
    /// group so invalidating the entity also drops the cached copy.
    ///
    /// `clear_for_cache` runs on freshly loaded entities before they are
    /// stored. Entities that override `cache_group` should go through
    /// [`ResultCache::call`] with their own group instead.
    pub async fn cached_entity<E, F, Fut>(
        &self,
        unique_key: &str,
        options: &CallOptions,
        load: F,
    ) -> StrataResult<Option<E>>
    where
        E: CachedEntity + Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Option<E>>,
    {
        let key = CallKey::new(unique_key)
            .in_group(GroupRef::Named(format!("{ENTITY_GROUP_PREFIX}{unique_key}")));
        self.results
            .call("entity", &key, options, || async move {
                load().await.map(|mut entity| {
                    entity.clear_for_cache();
                    entity
                })
            })
            .await
    }

    // ------------------------------------------------------------------
    // Ops

    /// Wipe the store behind `name`.
    ///
    /// Every cache sharing that store is wiped with it. This is an
    /// operations tool, never part of invalidation.
    pub async fn clear_cache(&self, name: CacheName) -> StrataResult<u64> {
        let space = self.spaces.get(name);
        tracing::warn!(
            cache = %name,
            backend = space.store().backend_name(),
            "Clearing cache backend"
        );
        let removed = space.store().clear().await?;
        self.clear_local_buffers();
        Ok(removed)
    }

    /// Drop every locally buffered version and value.
    ///
    /// Only this process is affected; other processes keep their buffers
    /// until they age out.
    pub fn clear_local_buffers(&self) -> usize {
        let cleared = self.versions.clear_buffer() + self.results.clear_buffer();
        tracing::debug!(cleared, "Local buffers cleared");
        cleared
    }

    /// Result cache counters.
    pub fn stats(&self) -> CacheStats {
        self.results.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;
    use strata_core::{ConfigError, ManualClock, StrataError};

    fn engine() -> (CacheEngine, ManualClock) {
        let clock = ManualClock::new(chrono::Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let engine = CacheEngine::builder(CacheSettings::default())
            .with_clock(Arc::new(clock.clone()))
            .build()
            .unwrap();
        (engine, clock)
    }

    #[test]
    fn test_build_rejects_invalid_settings() {
        let settings = CacheSettings {
            version_token_len: 4,
            ..CacheSettings::default()
        };
        match CacheEngine::new(settings) {
            Err(StrataError::Config(ConfigError::InvalidValue { field, .. })) => {
                assert_eq!(field, "version_token_len")
            }
            other => panic!("expected config error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_store_override_routes_one_cache() {
        let sessions = Arc::new(InMemoryStore::new());
        let engine = CacheEngine::builder(CacheSettings::default())
            .with_store_for(CacheName::Session, sessions.clone())
            .build()
            .unwrap();

        let key = CallKey::new("user.1");
        let _: Option<String> = engine
            .cached("profile", &key, &CallOptions::in_cache(CacheName::Session), || async {
                Some("alice".to_string())
            })
            .await
            .unwrap();

        assert_eq!(sessions.len(), 1);
        assert!(sessions.keys()[0].starts_with("ses:dev:"));
    }

    struct Log(Mutex<Vec<String>>);

    impl InvalidationListener for Log {
        fn on_invalidate(&self, event: &InvalidationEvent) {
            self.0.lock().unwrap().push(event.kind().to_string());
        }

        fn name(&self) -> &'static str {
            "log"
        }
    }

    #[tokio::test]
    async fn test_invalidations_are_announced() {
        let (engine, _) = engine();
        let log = Arc::new(Log(Mutex::new(Vec::new())));
        engine.subscribe(log.clone());

        engine.invalidate_group("mcg-item.1").await.unwrap();
        engine.invalidate_system("tg").await.unwrap();
        engine.invalidate_provider(ProviderId(42), "tg").await.unwrap();
        engine
            .invalidate_sandbox(SandboxId(7), Some(ProviderId(42)), "tg")
            .await
            .unwrap();
        engine.invalidate_window("tw").await.unwrap();
        engine
            .invalidate_key("f", &CallKey::new("x"), CacheName::Default)
            .await
            .unwrap();

        assert_eq!(
            *log.0.lock().unwrap(),
            vec!["group", "system", "provider", "sandbox", "window", "key"]
        );
    }

    #[tokio::test]
    async fn test_clear_local_buffers_and_clear_cache() {
        let (engine, _) = engine();
        engine.system_group("tg").await.unwrap();
        engine.version("mcg-item.1").await.unwrap();
        assert_eq!(engine.clear_local_buffers(), 2);

        let removed = engine.clear_cache(CacheName::Default).await.unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn test_timewin_passthrough() {
        let (engine, clock) = engine();
        let start = engine
            .timewin_start("tw-1", Duration::from_secs(300))
            .await
            .unwrap();
        assert_eq!(start, clock.now());
        assert_eq!(engine.timewin_peek("tw-1").await.unwrap(), Some(start));
        assert_eq!(engine.timewin_hash("tw-1").await.unwrap().len(), 8);
    }
}
