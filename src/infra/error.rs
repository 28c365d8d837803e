use thiserror::Error;

use crate::cache::{CacheError, IndexError, LockError, StoreError};

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("database error: {message}")]
    Database { message: String },
    #[error("redis error: {message}")]
    Redis { message: String },
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
}

impl InfraError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    pub fn redis(message: impl Into<String>) -> Self {
        Self::Redis {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }
}

impl From<sqlx::Error> for InfraError {
    fn from(err: sqlx::Error) -> Self {
        Self::database(err.to_string())
    }
}

impl From<IndexError> for InfraError {
    fn from(err: IndexError) -> Self {
        Self::database(err.to_string())
    }
}

impl From<StoreError> for InfraError {
    fn from(err: StoreError) -> Self {
        Self::redis(err.to_string())
    }
}

impl From<LockError> for InfraError {
    fn from(err: LockError) -> Self {
        Self::redis(err.to_string())
    }
}

impl From<CacheError> for InfraError {
    fn from(err: CacheError) -> Self {
        Self::configuration(err.to_string())
    }
}
