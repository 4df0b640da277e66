//! Error types for the mining engine

use std::time::Duration;
use thiserror::Error;

/// Failure talking to the durable store, the cache or the notify channel.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Storage call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = std::result::Result<T, StorageError>;

/// Outcome of an engine operation that did not go through.
///
/// Everything except `StorageUnavailable` is an expected, user-facing
/// rejection and is returned to the caller verbatim.
#[derive(Error, Debug)]
pub enum MiningError {
    #[error("User is already mining")]
    AlreadyMining,

    #[error("User is not currently mining")]
    NotMining,

    #[error("User not found or inactive")]
    UserNotFound,

    #[error("Insufficient energy. Required: {required}, Available: {available:.2}")]
    InsufficientEnergy { required: f64, available: f64 },

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[from] StorageError),
}

impl MiningError {
    /// Storage failures are transient; the caller may try again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MiningError::StorageUnavailable(_))
    }

    /// Short machine-readable code for front-ends.
    pub fn code(&self) -> &'static str {
        match self {
            MiningError::AlreadyMining => "ALREADY_MINING",
            MiningError::NotMining => "NOT_MINING",
            MiningError::UserNotFound => "USER_NOT_FOUND",
            MiningError::InsufficientEnergy { .. } => "INSUFFICIENT_ENERGY",
            MiningError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
        }
    }
}

pub type Result<T> = std::result::Result<T, MiningError>;
