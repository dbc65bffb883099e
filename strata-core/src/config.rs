//! Cache engine settings.
//!
//! Settings are loaded from environment variables with development-friendly
//! defaults. All ages are whole seconds in the environment.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ConfigError;

/// Shortest random version token accepted; below this, invalidation can no
/// longer be relied on to produce a different token.
pub const MIN_VERSION_TOKEN_LEN: usize = 16;

/// Settings for the cache engine.
///
/// Buffer ages bound how long a server may keep serving a version token
/// after another server invalidated it: a system group may lag up to
/// `buffer_version_system`, a provider group up to
/// `buffer_version_provider`, everything else up to `buffer_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Deployment namespace shared by every cache (e.g. "prod", "stage").
    pub key_prefix: String,
    /// Code version; joined into prefixes of caches whose values depend on code.
    pub code_version: String,

    /// Lifetime of version tokens in the distributed store. `None` = no expiry.
    pub version_ttl: Option<Duration>,
    /// Default lifetime of values in the `default` cache.
    pub default_ttl: Option<Duration>,
    /// Default lifetime of values in the `template` cache.
    pub template_ttl: Option<Duration>,
    /// Default lifetime of values in the `persist` cache.
    pub persist_ttl: Option<Duration>,
    /// Default lifetime of values in the `session` cache.
    pub session_ttl: Option<Duration>,

    /// Local buffer age for version tokens without a tier-specific age.
    pub buffer_version: Duration,
    /// Local buffer age for system group tokens.
    pub buffer_version_system: Duration,
    /// Local buffer age for provider group tokens.
    pub buffer_version_provider: Duration,
    /// Default local buffer age for cached values when a call asks for buffering.
    pub value_buffer_ttl: Duration,
    /// Entries a local buffer holds before it is culled.
    pub buffer_max_entries: usize,

    /// Length of random version tokens.
    pub version_token_len: usize,
    /// Longest backend key; longer keys are replaced by a digest.
    pub max_key_len: usize,
    /// Treat backend failures as misses instead of returning them.
    pub ignore_backend_errors: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            key_prefix: "dev".to_string(),
            code_version: "0".to_string(),

            version_ttl: Some(Duration::from_secs(7 * 24 * 3600)), // 1 week
            default_ttl: Some(Duration::from_secs(3600)),          // 1 hour
            template_ttl: Some(Duration::from_secs(3600)),
            persist_ttl: Some(Duration::from_secs(30 * 24 * 3600)), // 30 days
            session_ttl: Some(Duration::from_secs(24 * 3600)),

            buffer_version: Duration::from_secs(4),
            buffer_version_system: Duration::from_secs(30),
            buffer_version_provider: Duration::from_secs(10),
            value_buffer_ttl: Duration::from_secs(60),
            buffer_max_entries: 16_000,

            version_token_len: 24,
            max_key_len: 250, // memcached limit
            ignore_backend_errors: true,
        }
    }
}

impl CacheSettings {
    /// Create settings with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from environment variables.
    ///
    /// Environment variables:
    /// - `STRATA_KEY_PREFIX`: deployment namespace (default: "dev")
    /// - `STRATA_CODE_VERSION`: code version for code-sensitive caches (default: "0")
    /// - `STRATA_VERSION_TTL_SECS`: version token lifetime, 0 = no expiry
    /// - `STRATA_DEFAULT_TTL_SECS`, `STRATA_TEMPLATE_TTL_SECS`,
    ///   `STRATA_PERSIST_TTL_SECS`, `STRATA_SESSION_TTL_SECS`: cache lifetimes, 0 = no expiry
    /// - `STRATA_BUFFER_VERSION_SECS`, `STRATA_BUFFER_VERSION_SYSTEM_SECS`,
    ///   `STRATA_BUFFER_VERSION_PROVIDER_SECS`: version buffer ages
    /// - `STRATA_VALUE_BUFFER_SECS`: value buffer age
    /// - `STRATA_BUFFER_MAX_ENTRIES`: local buffer capacity
    /// - `STRATA_VERSION_TOKEN_LEN`: random token length
    /// - `STRATA_MAX_KEY_LEN`: longest backend key
    /// - `STRATA_IGNORE_BACKEND_ERRORS`: "true" or "false" (default: true)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let settings = Self {
            key_prefix: lookup("STRATA_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            code_version: lookup("STRATA_CODE_VERSION").unwrap_or(defaults.code_version),

            version_ttl: optional_secs(&lookup, "STRATA_VERSION_TTL_SECS", defaults.version_ttl)?,
            default_ttl: optional_secs(&lookup, "STRATA_DEFAULT_TTL_SECS", defaults.default_ttl)?,
            template_ttl: optional_secs(
                &lookup,
                "STRATA_TEMPLATE_TTL_SECS",
                defaults.template_ttl,
            )?,
            persist_ttl: optional_secs(&lookup, "STRATA_PERSIST_TTL_SECS", defaults.persist_ttl)?,
            session_ttl: optional_secs(&lookup, "STRATA_SESSION_TTL_SECS", defaults.session_ttl)?,

            buffer_version: secs(&lookup, "STRATA_BUFFER_VERSION_SECS", defaults.buffer_version)?,
            buffer_version_system: secs(
                &lookup,
                "STRATA_BUFFER_VERSION_SYSTEM_SECS",
                defaults.buffer_version_system,
            )?,
            buffer_version_provider: secs(
                &lookup,
                "STRATA_BUFFER_VERSION_PROVIDER_SECS",
                defaults.buffer_version_provider,
            )?,
            value_buffer_ttl: secs(&lookup, "STRATA_VALUE_BUFFER_SECS", defaults.value_buffer_ttl)?,
            buffer_max_entries: parsed(
                &lookup,
                "STRATA_BUFFER_MAX_ENTRIES",
                defaults.buffer_max_entries,
            )?,

            version_token_len: parsed(
                &lookup,
                "STRATA_VERSION_TOKEN_LEN",
                defaults.version_token_len,
            )?,
            max_key_len: parsed(&lookup, "STRATA_MAX_KEY_LEN", defaults.max_key_len)?,
            ignore_backend_errors: lookup("STRATA_IGNORE_BACKEND_ERRORS")
                .map(|s| s.to_lowercase() != "false")
                .unwrap_or(defaults.ignore_backend_errors),
        };

        settings.validate()?;
        Ok(settings)
    }

    /// Check invariants the engine relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_prefix.is_empty() {
            return Err(ConfigError::MissingRequired {
                field: "key_prefix".to_string(),
            });
        }
        if self.version_token_len < MIN_VERSION_TOKEN_LEN {
            return Err(ConfigError::InvalidValue {
                field: "version_token_len".to_string(),
                value: self.version_token_len.to_string(),
                reason: format!("must be at least {MIN_VERSION_TOKEN_LEN}"),
            });
        }
        // Room for a prefix plus a 64 char digest.
        if self.max_key_len < 100 {
            return Err(ConfigError::InvalidValue {
                field: "max_key_len".to_string(),
                value: self.max_key_len.to_string(),
                reason: "must be at least 100".to_string(),
            });
        }
        if self.buffer_max_entries == 0 {
            return Err(ConfigError::InvalidValue {
                field: "buffer_max_entries".to_string(),
                value: "0".to_string(),
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }

    /// Set the deployment key prefix.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set the code version.
    pub fn with_code_version(mut self, version: impl Into<String>) -> Self {
        self.code_version = version.into();
        self
    }

    /// Set the version token lifetime.
    pub fn with_version_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.version_ttl = ttl;
        self
    }

    /// Set all three version buffer ages at once; zero disables buffering.
    pub fn with_version_buffering(mut self, age: Duration) -> Self {
        self.buffer_version = age;
        self.buffer_version_system = age;
        self.buffer_version_provider = age;
        self
    }

    /// Set the default value buffer age.
    pub fn with_value_buffer_ttl(mut self, ttl: Duration) -> Self {
        self.value_buffer_ttl = ttl;
        self
    }

    /// Choose whether backend errors are absorbed.
    pub fn with_ignore_backend_errors(mut self, ignore: bool) -> Self {
        self.ignore_backend_errors = ignore;
        self
    }
}

fn parsed<F, T>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.clone(),
            reason: "not a number".to_string(),
        }),
    }
}

fn secs<F>(lookup: &F, name: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parsed(lookup, name, default.as_secs()).map(Duration::from_secs)
}

fn optional_secs<F>(
    lookup: &F,
    name: &str,
    default: Option<Duration>,
) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let raw = default.map(|d| d.as_secs()).unwrap_or(0);
    let value = parsed(lookup, name, raw)?;
    Ok((value > 0).then(|| Duration::from_secs(value)))
}
