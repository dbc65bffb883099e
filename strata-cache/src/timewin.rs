//! Time windows for snapshot-plus-delta caching.
//!
//! Collections that change in small bursts are cached as a base snapshot
//! taken at the start of a window, plus a much smaller delta of changes
//! since the window started. Individual edits only invalidate the delta;
//! the snapshot is recomputed when the window expires or is ended early.
//!
//! A window is a version key whose token is its start time, stored with a
//! TTL equal to the window length. No key means no active window. Local
//! buffering of a start never extends a window past its length.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use strata_core::{expires_at, random_token, short_hash, Clock, StrataResult, Timestamp};

use crate::spaces::Expiry;
use crate::version::{VersionKeyStore, VersionRequest};

/// Length of the hash returned by [`TimeWindows::hash`].
pub const WINDOW_HASH_LEN: usize = 8;

/// Separator for composite window keys.
pub const WINDOW_KEY_SEPARATOR: &str = "-";

/// Join group tokens into one window key, so invalidating any of the
/// groups starts a new window.
pub fn window_key(parts: &[&str]) -> String {
    parts.join(WINDOW_KEY_SEPARATOR)
}

/// Starts, reads and ends time windows.
#[derive(Debug, Clone)]
pub struct TimeWindows {
    versions: Arc<VersionKeyStore>,
    clock: Arc<dyn Clock>,
    buffer: Duration,
}

impl TimeWindows {
    /// Create a window manager; window starts are buffered locally for `buffer`.
    pub fn new(versions: Arc<VersionKeyStore>, clock: Arc<dyn Clock>, buffer: Duration) -> Self {
        Self {
            versions,
            clock,
            buffer,
        }
    }

    /// Start of the window for `key`, starting one now if none is active.
    ///
    /// Calls within `length` of the first call return the same start. A
    /// start older than `length` is replaced, even if its key was stored
    /// with a longer length.
    pub async fn start(&self, key: &str, length: Duration) -> StrataResult<Timestamp> {
        let now = self.clock.now();
        let req = VersionRequest::new(key)
            .buffered(self.buffer)
            .ttl(Expiry::After(length));

        let token = self
            .versions
            .get_or_create_with(req, || Some(encode_start(now)))
            .await?;
        match token.as_deref().and_then(decode_start) {
            Some(start) if expires_at(start, length) > now => return Ok(start),
            Some(start) => tracing::debug!(key, %start, "Window outlived its length, restarting"),
            None => tracing::warn!(key, "Unreadable window start, restarting window"),
        }

        self.versions
            .get_or_create_with(req.force_new(true), || Some(encode_start(now)))
            .await?;
        Ok(now)
    }

    /// Start of the active window for `key`, without starting one.
    pub async fn peek(&self, key: &str) -> StrataResult<Option<Timestamp>> {
        let token = self.versions.peek(key, Some(self.buffer)).await?;
        Ok(token.as_deref().and_then(decode_start))
    }

    /// Short stable hash of the active window for `key`, for cache busting
    /// in URLs.
    ///
    /// With no active window a fresh random string is returned, so a stale
    /// hash is never reused.
    pub async fn hash(&self, key: &str) -> StrataResult<String> {
        let token = self.versions.peek(key, Some(self.buffer)).await?;
        Ok(match token {
            Some(token) => short_hash(token.as_bytes(), WINDOW_HASH_LEN),
            None => random_token(WINDOW_HASH_LEN),
        })
    }

    /// End the window for `key` early; the next `start` opens a new one.
    pub async fn invalidate(&self, key: &str) -> StrataResult<()> {
        self.versions.invalidate(key).await
    }
}

fn encode_start(start: Timestamp) -> String {
    start.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn decode_start(token: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(token)
        .ok()
        .map(|start| start.with_timezone(&Utc))
}
