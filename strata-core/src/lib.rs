//! STRATA Core - shared types
//!
//! Errors, settings, tenant identifiers, clocks and key hashing used by
//! every other STRATA crate. No I/O lives here.

pub mod clock;
pub mod config;
pub mod error;
pub mod hashing;
pub mod identity;

pub use clock::{expires_at, Clock, ManualClock, SystemClock};
pub use config::{CacheSettings, MIN_VERSION_TOKEN_LEN};
pub use error::{ConfigError, StoreError, StoreResult, StrataError, StrataResult};
pub use hashing::{
    args_signature, bound_key, canonical_json, key_signature, make_full_key, random_token, sha256_hex,
    short_hash,
};
pub use identity::{ProviderId, SandboxId, Timestamp};
