//! Distributed memoization of function results.
//!
//! A call is cached under a key built from the function name, a fragment
//! derived from its arguments, a version key naming the invalidation scope,
//! and the current token of that version key:
//!
//! ```text
//! {cache prefix}:{name}:{fragment}:{version key}:{version token}
//! ```
//!
//! Invalidating the version key changes the token, so the next call misses
//! and recomputes. Entries cached under old tokens are left for the backend
//! to expire.
//!
//! Results of `None` are never cached: a call that legitimately returns
//! nothing recomputes every time rather than pinning an empty placeholder.

use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use strata_core::{
    args_signature, make_full_key, CacheSettings, Clock, StoreError, StrataResult,
};

use crate::buffer::LocalBuffer;
use crate::groups::{CacheGroup, CacheGroups};
use crate::policy::ErrorPolicy;
use crate::spaces::{CacheName, CacheSpace, CacheSpaces, Expiry};
use crate::store::CacheStats;
use crate::timewin::{window_key, TimeWindows};
use crate::version::{VersionKeyStore, VersionRequest};

/// Scope of a time window used as a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowScope {
    /// A fixed window key.
    Key(String),
    /// The joined tokens of these groups, so invalidating any of them starts
    /// a new window.
    Tiers(Vec<CacheGroup>),
}

/// Invalidation scope of a cached call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupRef {
    /// A version key string, such as an entity's cache group.
    Named(String),
    /// A tier of the tenant hierarchy; its token is the version key.
    Tier(CacheGroup),
    /// A time window, started on first use; its key is the version key.
    Window { scope: WindowScope, length: Duration },
}

impl GroupRef {
    /// A named version key.
    pub fn named(key: impl Into<String>) -> Self {
        GroupRef::Named(key.into())
    }

    /// A window over a fixed key.
    pub fn window(key: impl Into<String>, length: Duration) -> Self {
        GroupRef::Window {
            scope: WindowScope::Key(key.into()),
            length,
        }
    }

    /// A window over the joined tokens of `tiers`.
    pub fn tier_window(tiers: Vec<CacheGroup>, length: Duration) -> Self {
        GroupRef::Window {
            scope: WindowScope::Tiers(tiers),
            length,
        }
    }
}

impl From<CacheGroup> for GroupRef {
    fn from(group: CacheGroup) -> Self {
        GroupRef::Tier(group)
    }
}

impl From<&str> for GroupRef {
    fn from(key: &str) -> Self {
        GroupRef::Named(key.to_string())
    }
}

impl From<String> for GroupRef {
    fn from(key: String) -> Self {
        GroupRef::Named(key)
    }
}

/// Key of one cached call: an argument fragment plus an optional group.
///
/// Without a group the function name itself is the version key, so all
/// results of one function can be invalidated together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallKey {
    pub fragment: String,
    pub group: Option<GroupRef>,
}

impl CallKey {
    /// Key with `fragment` and no group.
    pub fn new(fragment: impl Into<String>) -> Self {
        Self {
            fragment: fragment.into(),
            group: None,
        }
    }

    /// Key derived from the signature of `args`.
    pub fn from_args<A: Serialize + Debug + ?Sized>(args: &A) -> Self {
        Self::new(args_signature(args))
    }

    /// Put this key in `group`.
    pub fn in_group(mut self, group: impl Into<GroupRef>) -> Self {
        self.group = Some(group.into());
        self
    }
}

/// Per-call caching options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
    /// Logical cache holding the result.
    pub cache: CacheName,
    /// Lifetime of the stored result.
    pub ttl: Expiry,
    /// Also keep the result in the local value buffer for this long.
    pub buffer: Option<Duration>,
    /// Skip reads and always recompute; the result is still stored.
    pub punch_through: bool,
    /// Never store; only return what another caller already cached.
    pub no_set: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            cache: CacheName::Default,
            ttl: Expiry::Default,
            buffer: None,
            punch_through: false,
            no_set: false,
        }
    }
}

impl CallOptions {
    /// Options writing to `cache`.
    pub fn in_cache(cache: CacheName) -> Self {
        Self {
            cache,
            ..Self::default()
        }
    }

    /// Set the lifetime of stored results.
    pub fn with_ttl(mut self, ttl: impl Into<Expiry>) -> Self {
        self.ttl = ttl.into();
        self
    }

    /// Buffer results locally for `age`.
    pub fn buffered(mut self, age: Duration) -> Self {
        self.buffer = Some(age);
        self
    }

    /// Always recompute.
    pub fn punch_through(mut self) -> Self {
        self.punch_through = true;
        self
    }

    /// Never store.
    pub fn no_set(mut self) -> Self {
        self.no_set = true;
        self
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    sets: AtomicU64,
    errors: AtomicU64,
}

/// Read-through cache of serialized call results.
pub struct ResultCache {
    spaces: CacheSpaces,
    versions: Arc<VersionKeyStore>,
    groups: CacheGroups,
    windows: TimeWindows,
    values: LocalBuffer<Vec<u8>>,
    policy: ErrorPolicy,
    version_buffer: Duration,
    value_buffer_ttl: Duration,
    counters: Counters,
}

impl ResultCache {
    /// Create a result cache over `spaces`.
    pub fn new(
        spaces: CacheSpaces,
        versions: Arc<VersionKeyStore>,
        groups: CacheGroups,
        windows: TimeWindows,
        clock: Arc<dyn Clock>,
        settings: &CacheSettings,
    ) -> Self {
        Self {
            spaces,
            versions,
            groups,
            windows,
            values: LocalBuffer::new(clock, settings.buffer_max_entries),
            policy: ErrorPolicy::new(settings.ignore_backend_errors),
            version_buffer: settings.buffer_version,
            value_buffer_ttl: settings.value_buffer_ttl,
            counters: Counters::default(),
        }
    }

    /// Version key for `group`.
    ///
    /// Tiers resolve to their token; windows are started if not active and
    /// resolve to their key.
    pub async fn version_key(&self, group: &GroupRef) -> StrataResult<String> {
        match group {
            GroupRef::Named(key) => Ok(key.clone()),
            GroupRef::Tier(group) => self.groups.resolve(group).await,
            GroupRef::Window { scope, length } => {
                let key = match scope {
                    WindowScope::Key(key) => key.clone(),
                    WindowScope::Tiers(tiers) => {
                        let mut tokens = Vec::with_capacity(tiers.len());
                        for tier in tiers {
                            tokens.push(self.groups.resolve(tier).await?);
                        }
                        let parts: Vec<&str> = tokens.iter().map(String::as_str).collect();
                        window_key(&parts)
                    }
                };
                self.windows.start(&key, *length).await?;
                Ok(key)
            }
        }
    }

    /// Storage key for a call of `name` under `key`, before the cache prefix.
    pub async fn call_key(&self, name: &str, key: &CallKey) -> StrataResult<String> {
        let (version_key, key_name) = match &key.group {
            Some(group) => (self.version_key(group).await?, name),
            None => (name.to_string(), ""),
        };
        let version = self
            .versions
            .get_or_create(VersionRequest::new(&version_key).buffered(self.version_buffer))
            .await?;
        Ok(make_full_key(&[key_name, &key.fragment, &version_key, &version]))
    }

    /// Return the cached result of `name` under `key`, or run `compute` and
    /// cache what it returns.
    pub async fn call<T, F, Fut>(
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
        let space = self.spaces.get(options.cache);
        let call_key = self.call_key(name, key).await?;

        if !options.punch_through {
            if let Some(value) = self.read(space, &call_key, options).await? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(cache = %options.cache, key = %call_key, "Result hit");
                return Ok(Some(value));
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let value = compute().await;
        if let Some(value) = &value {
            self.write(space, &call_key, value, options).await?;
        }
        Ok(value)
    }

    /// Like [`ResultCache::call`] for computations that always produce a value.
    ///
    /// A value that serializes to JSON `null`, such as `None` from an
    /// `Option<T>` computation, is returned but not cached, so it is
    /// recomputed on the next call the same way [`ResultCache::call`] treats
    /// `None`.
    pub async fn call_value<T, F, Fut>(
        &self,
        name: &str,
        key: &CallKey,
        options: &CallOptions,
        compute: F,
    ) -> StrataResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let space = self.spaces.get(options.cache);
        let call_key = self.call_key(name, key).await?;

        if !options.punch_through {
            if let Some(value) = self.read(space, &call_key, options).await? {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
        }
        self.counters.misses.fetch_add(1, Ordering::Relaxed);

        let value = compute().await;
        self.write(space, &call_key, &value, options).await?;
        Ok(value)
    }

    /// Read a cached result without computing anything.
    pub async fn peek<T: DeserializeOwned>(
        &self,
        name: &str,
        key: &CallKey,
        cache: CacheName,
    ) -> StrataResult<Option<T>> {
        let call_key = self.call_key(name, key).await?;
        self.read(self.spaces.get(cache), &call_key, &CallOptions::in_cache(cache))
            .await
    }

    /// Remove one cached result from the store and the local buffer.
    pub async fn invalidate_key(
        &self,
        name: &str,
        key: &CallKey,
        cache: CacheName,
    ) -> StrataResult<()> {
        let space = self.spaces.get(cache);
        let call_key = self.call_key(name, key).await?;
        let full_key = space.full_key(&call_key);
        self.values.remove(&full_key);
        self.record_error_if(space.delete(&call_key).await, "delete", &full_key)
            .map(|_| ())
    }

    /// Drop every locally buffered result.
    pub fn clear_buffer(&self) -> usize {
        self.values.clear()
    }

    /// Counters since startup.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            sets: self.counters.sets.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
            entry_count: self.values.len() as u64,
        }
    }

    async fn read<T: DeserializeOwned>(
        &self,
        space: &CacheSpace,
        call_key: &str,
        options: &CallOptions,
    ) -> StrataResult<Option<T>> {
        let full_key = space.full_key(call_key);

        let buffered = options
            .buffer
            .and_then(|_| self.values.get(&full_key));
        let bytes = match buffered {
            Some(bytes) => bytes,
            None => {
                let stored = self.record_error_if(space.get(call_key).await, "get", &full_key)?;
                match stored.flatten() {
                    Some(bytes) => {
                        if let Some(age) = options.buffer {
                            self.values.insert(&full_key, bytes.clone(), self.buffer_age(age));
                        }
                        bytes
                    }
                    None => return Ok(None),
                }
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                self.values.remove(&full_key);
                let error = StoreError::Deserialization {
                    key: full_key.clone(),
                    reason: e.to_string(),
                };
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                self.policy.absorb::<T>("decode", &full_key, Err(error))
            }
        }
    }

    async fn write<T: Serialize>(
        &self,
        space: &CacheSpace,
        call_key: &str,
        value: &T,
        options: &CallOptions,
    ) -> StrataResult<()> {
        let full_key = space.full_key(call_key);
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => {
                let error = StoreError::Serialization {
                    key: full_key.clone(),
                    reason: e.to_string(),
                };
                self.counters.errors.fetch_add(1, Ordering::Relaxed);
                return self.policy.absorb::<()>("encode", &full_key, Err(error)).map(|_| ());
            }
        };
        // A stored null would read back as a hit for `None`
        if bytes == b"null" {
            tracing::trace!(cache = %options.cache, key = %full_key, "Null result not cached");
            return Ok(());
        }

        if !options.no_set {
            let stored = self.record_error_if(
                space.set(call_key, &bytes, options.ttl).await,
                "set",
                &full_key,
            )?;
            if stored.is_some() {
                self.counters.sets.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    cache = %options.cache,
                    key = %full_key,
                    size = bytes.len(),
                    "Result set"
                );
            }
        }
        if let Some(age) = options.buffer {
            self.values.insert(&full_key, bytes, self.buffer_age(age));
        }
        Ok(())
    }

    /// Count and resolve a backend outcome; `None` means an absorbed error.
    fn record_error_if<T>(
        &self,
        result: Result<T, StoreError>,
        op: &'static str,
        key: &str,
    ) -> StrataResult<Option<T>> {
        if result.is_err() {
            self.counters.errors.fetch_add(1, Ordering::Relaxed);
        }
        self.policy.absorb(op, key, result.map(Some))
    }

    fn buffer_age(&self, requested: Duration) -> Duration {
        if requested.is_zero() {
            self.value_buffer_ttl
        } else {
            requested
        }
    }
}

impl fmt::Debug for ResultCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultCache")
            .field("spaces", &self.spaces)
            .field("policy", &self.policy)
            .field("stats", &self.stats())
            .finish()
    }
}

/// Builds the key of a call from its arguments; `None` skips caching.
pub type KeyFn<A> = Box<dyn Fn(&A) -> Option<CallKey> + Send + Sync>;

/// A function wrapped with a result cache.
///
/// # Example
///
/// ```ignore
/// let price = CachedFn::new(engine.results(), "price", |id: &u64| {
///     let id = *id;
///     async move { Some(load_price(id).await) }
/// })
/// .in_group(|id: &u64| GroupRef::named(format!("mcg-item.{id}")));
///
/// let value = price.call(&7).await?;
/// ```
pub struct CachedFn<A, T, F> {
    name: String,
    cache: Arc<ResultCache>,
    key_fn: KeyFn<A>,
    options: CallOptions,
    func: F,
    _result: PhantomData<fn() -> T>,
}

impl<A, T, F, Fut> CachedFn<A, T, F>
where
    A: Serialize + Debug + 'static,
    T: Serialize + DeserializeOwned,
    F: Fn(&A) -> Fut,
    Fut: Future<Output = Option<T>>,
{
    /// Wrap `func` under `name`, keyed by the signature of its arguments.
    pub fn new(cache: Arc<ResultCache>, name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            cache,
            key_fn: Box::new(|args: &A| Some(CallKey::from_args(args))),
            options: CallOptions::default(),
            func,
            _result: PhantomData,
        }
    }

    /// Key calls by their arguments within the group chosen by `group_fn`.
    pub fn in_group<G>(mut self, group_fn: G) -> Self
    where
        G: Fn(&A) -> GroupRef + Send + Sync + 'static,
    {
        self.key_fn = Box::new(move |args: &A| Some(CallKey::from_args(args).in_group(group_fn(args))));
        self
    }

    /// Replace the key function.
    pub fn with_key_fn<K>(mut self, key_fn: K) -> Self
    where
        K: Fn(&A) -> Option<CallKey> + Send + Sync + 'static,
    {
        self.key_fn = Box::new(key_fn);
        self
    }

    /// Replace the call options.
    pub fn with_options(mut self, options: CallOptions) -> Self {
        self.options = options;
        self
    }

    /// Name used in keys.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Call through the cache.
    pub async fn call(&self, args: &A) -> StrataResult<Option<T>> {
        let Some(key) = (self.key_fn)(args) else {
            tracing::trace!(name = %self.name, "Key function declined caching");
            return Ok((self.func)(args).await);
        };
        self.cache
            .call(&self.name, &key, &self.options, || (self.func)(args))
            .await
    }

    /// Remove the cached result for `args`.
    pub async fn invalidate(&self, args: &A) -> StrataResult<()> {
        match (self.key_fn)(args) {
            Some(key) => {
                self.cache
                    .invalidate_key(&self.name, &key, self.options.cache)
                    .await
            }
            None => Ok(()),
        }
    }
}

impl<A, T, F> Debug for CachedFn<A, T, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedFn")
            .field("name", &self.name)
            .field("options", &self.options)
            .finish()
    }
}
