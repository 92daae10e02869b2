//! Error types for capture operations

use crate::model::TransactionStatus;
use thiserror::Error;

/// Main error type for the capture pipeline
#[derive(Debug, Error)]
pub enum CaptureError {
    /// A rule blocked the request before it reached the network
    #[error("request blocked by rule: {reason}")]
    Blocked { reason: String },

    /// A lifecycle transition was attempted on a finished transaction
    #[error("transaction {id} is already {status}")]
    AlreadyTerminal {
        id: String,
        status: TransactionStatus,
    },

    /// Stored parts do not describe a valid transaction
    #[error("invalid transaction {id}: {reason}")]
    InvalidTransaction { id: String, reason: String },

    #[error("unknown transaction status '{0}'")]
    UnknownStatus(String),

    #[error("unknown rule outcome '{0}'")]
    UnknownOutcome(String),

    /// Rule definition rejected on import
    #[error("invalid rule '{id}': {reason}")]
    InvalidRule { id: String, reason: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CaptureError {
    /// Whether this error was produced on purpose by a rule rather than by the network
    pub fn is_blocked(&self) -> bool {
        matches!(self, CaptureError::Blocked { .. })
    }
}
