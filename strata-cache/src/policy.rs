//! What to do when a backend call fails.
//!
//! Caching is an optimization, never a correctness dependency: in
//! production a failed backend call is logged and treated as a miss. In
//! development the error is surfaced so misconfiguration is noticed.

use strata_core::{StoreError, StrataResult};

/// Backend failure handling shared by every engine component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ErrorPolicy {
    /// Log and absorb backend errors instead of returning them.
    pub ignore_backend_errors: bool,
}

impl ErrorPolicy {
    /// Absorb every backend error.
    pub const ABSORB: Self = Self {
        ignore_backend_errors: true,
    };

    /// Propagate every backend error.
    pub const PROPAGATE: Self = Self {
        ignore_backend_errors: false,
    };

    /// Create a policy from the `ignore_backend_errors` setting.
    pub fn new(ignore_backend_errors: bool) -> Self {
        Self {
            ignore_backend_errors,
        }
    }

    /// Resolve the outcome of a backend read.
    ///
    /// An absorbed error reads as `None`, i.e. a miss.
    pub fn absorb<T>(
        &self,
        op: &'static str,
        key: &str,
        result: Result<Option<T>, StoreError>,
    ) -> StrataResult<Option<T>> {
        match result {
            Ok(value) => Ok(value),
            Err(e) if self.ignore_backend_errors => {
                tracing::warn!(op, key, error = %e, "Cache backend error ignored");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the outcome of a backend write or delete.
    ///
    /// Returns `Ok(false)` when an error was absorbed.
    pub fn absorb_unit(
        &self,
        op: &'static str,
        key: &str,
        result: Result<(), StoreError>,
    ) -> StrataResult<bool> {
        self.absorb(op, key, result.map(Some))
            .map(|done| done.is_some())
    }
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self::ABSORB
    }
}
