//! Cache key derivation.
//!
//! A key depends only on the prefix, the function label and the *projected*
//! tags of a call. Arguments outside the function's tag schema never reach the
//! key, so two calls that differ only in untagged arguments share an entry.

use sha2::{Digest, Sha256};

use super::error::CacheError;
use super::tags::Tags;

/// Formats `"{prefix}/{label}_{sha256(canonical json of tags)}"`.
pub fn cache_key(prefix: &str, label: &str, tagged: &Tags) -> Result<String, CacheError> {
    let canonical = serde_json::to_vec(tagged).map_err(CacheError::codec)?;
    let mut hasher = Sha256::new();
    hasher.update(&canonical);
    Ok(format!("{prefix}/{label}_{}", hex::encode(hasher.finalize())))
}

/// Lock resource guarding population of `key`.
pub fn lock_resource(key: &str) -> String {
    format!("lock/{key}")
}
