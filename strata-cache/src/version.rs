//! Version keys.
//!
//! A version key names an invalidation scope. Its stored value, the version
//! token, is embedded in the key of every cached value that depends on the
//! scope. Deleting the version key makes the next lookup create a new,
//! unrelated token, so every value cached under the old token becomes
//! unreachable without being touched.
//!
//! # Races
//!
//! Concurrent callers that all miss will each create and store a candidate
//! token. The last write wins and becomes the token every later reader sees.
//! Values computed under a losing token are never read again; they are
//! extra misses, not errors.
//!
//! # Buffering
//!
//! A buffered token is held for the requested age, but never past the
//! expiry of the stored token it copies. Otherwise a key shorter-lived than
//! the buffer, such as a time window, would outlive its TTL locally.

use std::sync::Arc;
use std::time::Duration;

use strata_core::{random_token, CacheSettings, Clock, StrataResult, Timestamp};

use crate::buffer::LocalBuffer;
use crate::policy::ErrorPolicy;
use crate::spaces::{CacheSpace, Expiry};

/// How to look up or create one version token.
#[derive(Debug, Clone, Copy)]
pub struct VersionRequest<'a> {
    /// The version key.
    pub key: &'a str,
    /// Prefix for new random tokens, stored as `"{prefix}({random})"`.
    pub prefix: Option<&'a str>,
    /// Local buffer age; `None` goes straight to the store.
    pub buffer: Option<Duration>,
    /// Lifetime of a newly created token.
    pub ttl: Expiry,
    /// Ignore any existing token and store a new one.
    pub force_new: bool,
}

impl<'a> VersionRequest<'a> {
    /// Request for `key`: unbuffered, unprefixed, default TTL.
    pub fn new(key: &'a str) -> Self {
        Self {
            key,
            prefix: None,
            buffer: None,
            ttl: Expiry::Default,
            force_new: false,
        }
    }

    /// Prefix new random tokens with `prefix`.
    pub fn prefixed(mut self, prefix: &'a str) -> Self {
        self.prefix = Some(prefix);
        self
    }

    /// Buffer the token locally for `age`.
    pub fn buffered(mut self, age: Duration) -> Self {
        self.buffer = Some(age);
        self
    }

    /// Set the lifetime of a newly created token.
    pub fn ttl(mut self, ttl: Expiry) -> Self {
        self.ttl = ttl;
        self
    }

    /// Replace any existing token.
    pub fn force_new(mut self, force: bool) -> Self {
        self.force_new = force;
        self
    }
}

/// Get-or-create and invalidate version tokens.
#[derive(Debug)]
pub struct VersionKeyStore {
    space: CacheSpace,
    buffer: LocalBuffer<String>,
    clock: Arc<dyn Clock>,
    policy: ErrorPolicy,
    token_len: usize,
}

impl VersionKeyStore {
    /// Create a version store writing to `space`.
    pub fn new(space: CacheSpace, clock: Arc<dyn Clock>, settings: &CacheSettings) -> Self {
        Self {
            space,
            buffer: LocalBuffer::new(clock.clone(), settings.buffer_max_entries),
            clock,
            policy: ErrorPolicy::new(settings.ignore_backend_errors),
            token_len: settings.version_token_len,
        }
    }

    /// The space version tokens are stored in.
    pub fn space(&self) -> &CacheSpace {
        &self.space
    }

    /// Get the token for `req.key`, creating a random one if absent.
    pub async fn get_or_create(&self, req: VersionRequest<'_>) -> StrataResult<String> {
        if !req.force_new {
            if let Some(token) = self.lookup(&req).await? {
                return Ok(token);
            }
        }
        let random = random_token(self.token_len);
        let token = match req.prefix {
            Some(prefix) => format!("{prefix}({random})"),
            None => random,
        };
        self.publish(&req, &token).await?;
        Ok(token)
    }

    /// Get the token for `req.key`, creating it with `generator` if absent.
    ///
    /// A generator returning `None` creates nothing and the call returns
    /// `None`. `req.prefix` is not applied to generated tokens.
    pub async fn get_or_create_with<G>(
        &self,
        req: VersionRequest<'_>,
        generator: G,
    ) -> StrataResult<Option<String>>
    where
        G: FnOnce() -> Option<String> + Send,
    {
        if !req.force_new {
            if let Some(token) = self.lookup(&req).await? {
                return Ok(Some(token));
            }
        }
        let Some(token) = generator() else {
            return Ok(None);
        };
        self.publish(&req, &token).await?;
        Ok(Some(token))
    }

    /// Read the token for `key` without ever creating one.
    pub async fn peek(&self, key: &str, buffer: Option<Duration>) -> StrataResult<Option<String>> {
        let req = VersionRequest {
            buffer,
            ..VersionRequest::new(key)
        };
        self.lookup(&req).await
    }

    /// Delete the token for `key`. Absent keys are not an error.
    ///
    /// Only this process's buffer is cleared; other processes see the
    /// change once their buffered copy ages out.
    pub async fn invalidate(&self, key: &str) -> StrataResult<()> {
        self.buffer.remove(key);
        let deleted = self
            .policy
            .absorb_unit("delete", key, self.space.delete(key).await)?;
        if deleted {
            tracing::debug!(key, "Version invalidated");
        }
        Ok(())
    }

    /// Drop every locally buffered token.
    pub fn clear_buffer(&self) -> usize {
        self.buffer.clear()
    }

    /// Buffer first, then store. Tokens read from the store are buffered;
    /// tokens read from the buffer are not, so a buffered copy never outlives
    /// its age.
    async fn lookup(&self, req: &VersionRequest<'_>) -> StrataResult<Option<String>> {
        if req.buffer.is_some() {
            if let Some(token) = self.buffer.get(req.key) {
                return Ok(Some(token));
            }
        }

        let stored = self
            .policy
            .absorb("get", req.key, self.space.get_entry(req.key).await)?;
        let Some(entry) = stored else {
            return Ok(None);
        };

        match String::from_utf8(entry.bytes) {
            Ok(token) if !token.is_empty() => {
                tracing::trace!(key = req.key, version = %token, "Version get");
                if let Some(age) = self.buffer_age(req, entry.expires_at) {
                    self.buffer.insert(req.key, token.clone(), age);
                }
                Ok(Some(token))
            }
            _ => {
                tracing::warn!(key = req.key, "Unreadable version token, replacing");
                Ok(None)
            }
        }
    }

    async fn publish(&self, req: &VersionRequest<'_>, token: &str) -> StrataResult<()> {
        self.policy.absorb_unit(
            "set",
            req.key,
            self.space.set(req.key, token.as_bytes(), req.ttl).await,
        )?;
        tracing::debug!(
            key = req.key,
            version = token,
            force = req.force_new,
            "Version created"
        );
        if let Some(age) = self.buffer_age(req, None) {
            self.buffer.insert(req.key, token.to_string(), age);
        }
        Ok(())
    }

    /// `req.buffer` capped at the token's TTL and at the time left before
    /// `expires_at`. A token already expired gets a zero age.
    fn buffer_age(
        &self,
        req: &VersionRequest<'_>,
        expires_at: Option<Timestamp>,
    ) -> Option<Duration> {
        let mut age = req.buffer?;
        if let Some(ttl) = req.ttl.resolve(self.space.default_ttl()) {
            age = age.min(ttl);
        }
        if let Some(at) = expires_at {
            let left = (at - self.clock.now()).to_std().unwrap_or(Duration::ZERO);
            age = age.min(left);
        }
        Some(age)
    }
}
