//! Error types for storage and the inspector service

use capture_core::CaptureError;
use thiserror::Error;

/// Errors raised by the transaction store and the rule store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be turned back into a value
    #[error("corrupt {table} row '{id}': {reason}")]
    Corrupt {
        table: &'static str,
        id: String,
        reason: String,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Capture(#[from] CaptureError),

    #[error("rule not found: {0}")]
    RuleNotFound(String),
}

impl StoreError {
    pub(crate) fn corrupt(table: &'static str, id: impl Into<String>, reason: impl ToString) -> Self {
        StoreError::Corrupt {
            table,
            id: id.into(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while starting or running the inspector
#[derive(Debug, Error)]
pub enum InspectorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("logging setup failed: {0}")]
    Logging(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

pub type Result<T> = std::result::Result<T, InspectorError>;
