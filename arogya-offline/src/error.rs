//! Error types for the offline engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum OfflineError {
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Remote call failed: {0}")]
    Remote(String),

    #[error("Conflict detected: {0}")]
    Conflict(String),

    #[error("Sync cycle failed: {0}")]
    SyncFailed(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for OfflineError {
    fn from(err: serde_json::Error) -> Self {
        OfflineError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for OfflineError {
    fn from(err: reqwest::Error) -> Self {
        OfflineError::Remote(err.to_string())
    }
}

pub type OfflineResult<T> = Result<T, OfflineError>;
