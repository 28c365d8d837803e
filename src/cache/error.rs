use thiserror::Error;

use super::locker::LockError;
use super::metadata::IndexError;
use super::store::StoreError;

/// Errors surfaced by the cacher and the invalidator.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("payload codec error: {0}")]
    Codec(String),
    #[error("invalid cached function spec `{label}`: {reason}")]
    InvalidSpec { label: String, reason: String },
    #[error("tag `{name}` does not match its declared {expected}")]
    TagMismatch { name: String, expected: String },
}

impl CacheError {
    pub fn codec(err: impl std::fmt::Display) -> Self {
        Self::Codec(err.to_string())
    }

    pub fn invalid_spec(label: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSpec {
            label: label.into(),
            reason: reason.into(),
        }
    }
}
