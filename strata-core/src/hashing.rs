//! Key signatures and version tokens.
//!
//! Cache keys are built from a function name plus its arguments. Arguments
//! are rendered as canonical JSON (object keys sorted at every depth, no
//! whitespace), so the same logical arguments always produce the same key
//! regardless of field order or map iteration order. Short signatures are
//! embedded verbatim to keep keys readable in a backend browser; anything
//! long or unsafe for memcached-style keys is replaced by its SHA-256 digest.

use std::fmt::Debug;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Longest canonical argument rendering embedded verbatim in a key.
pub const INLINE_SIGNATURE_MAX: usize = 64;

/// Separator between key parts.
pub const KEY_SEPARATOR: char = ':';

/// Marks a digest in place of inline arguments.
const DIGEST_MARK: char = '#';

/// Marks a digest of the `Debug` rendering, used when serialization fails.
const DEBUG_DIGEST_MARK: char = '~';

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// First `len` hex characters of the SHA-256 of `data`.
pub fn short_hash(data: &[u8], len: usize) -> String {
    let mut digest = sha256_hex(data);
    digest.truncate(len);
    digest
}

/// Random alphanumeric token of `len` characters.
///
/// Each character carries ~5.95 bits, so 24 characters exceed 128 bits.
pub fn random_token(len: usize) -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Canonical JSON rendering of `args`, or `None` if it cannot be serialized.
pub fn canonical_json<A: Serialize + ?Sized>(args: &A) -> Option<String> {
    let value = serde_json::to_value(args).ok()?;
    let mut out = String::new();
    write_canonical(&value, &mut out);
    Some(out)
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Serializing a plain string cannot fail.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

/// True if `s` can be embedded directly in a backend key.
pub fn is_key_safe(s: &str) -> bool {
    s.len() <= INLINE_SIGNATURE_MAX && s.chars().all(|c| c.is_ascii_graphic())
}

/// Deterministic signature of `args` alone.
///
/// Never fails: arguments that cannot be serialized fall back to a digest
/// of their `Debug` rendering.
pub fn args_signature<A>(args: &A) -> String
where
    A: Serialize + Debug + ?Sized,
{
    match canonical_json(args) {
        Some(canonical) if is_key_safe(&canonical) => canonical,
        Some(canonical) => format!("{DIGEST_MARK}{}", sha256_hex(canonical.as_bytes())),
        None => format!(
            "{DEBUG_DIGEST_MARK}{}",
            sha256_hex(format!("{args:?}").as_bytes())
        ),
    }
}

/// Deterministic signature for a call of `name` with `args`.
pub fn key_signature<A>(name: &str, args: &A) -> String
where
    A: Serialize + Debug + ?Sized,
{
    format!("{name}{KEY_SEPARATOR}{}", args_signature(args))
}

/// Join non-empty key parts with [`KEY_SEPARATOR`].
pub fn make_full_key(parts: &[&str]) -> String {
    let mut key = String::new();
    for part in parts.iter().filter(|p| !p.is_empty()) {
        if !key.is_empty() {
            key.push(KEY_SEPARATOR);
        }
        key.push_str(part);
    }
    key
}

/// Keep `key` within `max_len`, replacing it by a prefixed digest if needed.
pub fn bound_key(prefix: &str, key: &str, max_len: usize) -> String {
    let full = make_full_key(&[prefix, key]);
    if full.len() <= max_len && full.chars().all(|c| c.is_ascii_graphic()) {
        full
    } else {
        make_full_key(&[prefix, "h", &sha256_hex(key.as_bytes())])
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        /// Property: signatures are a pure function of name and arguments.
        #[test]
        fn prop_signature_is_deterministic(name in "[a-z_]{1,16}", a in any::<i64>(), b in ".{0,80}") {
            prop_assert_eq!(key_signature(&name, &(a, &b)), key_signature(&name, &(a, &b)));
        }

        /// Property: signatures are always usable as backend keys.
        #[test]
        fn prop_signature_is_key_safe(a in any::<i64>(), b in ".{0,200}") {
            let sig = key_signature("f", &(a, &b));
            prop_assert!(sig.chars().all(|c| c.is_ascii_graphic()));
            prop_assert!(sig.len() <= "f:".len() + 1 + 64);
        }

        /// Property: different arguments give different signatures.
        #[test]
        fn prop_distinct_args_distinct_signatures(a in any::<u32>(), b in any::<u32>()) {
            prop_assume!(a != b);
            prop_assert_ne!(key_signature("f", &a), key_signature("f", &b));
        }
    }
}
