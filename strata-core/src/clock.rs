//! Time sources.
//!
//! Every TTL, buffer age and time window in STRATA reads time through
//! [`Clock`], so deployments use [`SystemClock`] and tests drive a
//! [`ManualClock`] forward explicitly.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::Utc;

use crate::Timestamp;

/// Source of "now".
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same instant, so a test can hand one clone to the
/// engine and keep another to advance time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<RwLock<Timestamp>>,
}

impl ManualClock {
    /// Create a manual clock frozen at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: Arc::new(RwLock::new(start)),
        }
    }

    /// Create a manual clock frozen at the current wall time.
    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let step = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
        if let Ok(mut now) = self.now.write() {
            *now = now.checked_add_signed(step).unwrap_or(*now);
        }
    }

    /// Jump to an absolute instant.
    pub fn set(&self, at: Timestamp) {
        if let Ok(mut now) = self.now.write() {
            *now = at;
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        match self.now.read() {
            Ok(now) => *now,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Convert a `std` duration to a chrono one, saturating on overflow.
pub fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// Instant at which something stored at `now` with `ttl` expires.
pub fn expires_at(now: Timestamp, ttl: Duration) -> Timestamp {
    now.checked_add_signed(to_chrono(ttl))
        .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_manual_clock_is_frozen_until_advanced() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = ManualClock::new(start);
        assert_eq!(clock.now(), start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(60));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(60));
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::starting_now();
        let handle = clock.clone();
        let before = clock.now();
        handle.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), before + chrono::Duration::seconds(5));
    }

    #[test]
    fn test_expires_at_saturates() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            expires_at(start, Duration::from_secs(10)),
            start + chrono::Duration::seconds(10)
        );
        assert_eq!(
            expires_at(start, Duration::MAX),
            chrono::DateTime::<Utc>::MAX_UTC
        );
    }
}
