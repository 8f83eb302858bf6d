//! Error types for the core layer.

use thiserror::Error;

/// Errors raised by stores, keys and CRDT merges.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoreError {
    #[error("key not found: {key}")]
    NotFound { key: String },

    #[error("transaction conflict on key {key}")]
    TxnConflict { key: String },

    #[error("transaction already finished")]
    TxnFinished,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("invalid varint: {0}")]
    InvalidVarint(String),

    #[error("mismatched merge type: expected {expected}, got {actual}")]
    MismatchedMergeType { expected: &'static str, actual: &'static str },

    #[error("negative value {0} not allowed on a grow-only counter")]
    NegativeValue(String),

    #[error("invalid counter value: {0}")]
    InvalidCounterValue(String),

    #[error("invalid document status: {0}")]
    InvalidStatus(u8),

    #[error("failed to store value: {0}")]
    FailedToStoreValue(String),
}

impl CoreError {
    /// Build a `NotFound` error for a raw store key.
    pub fn not_found(key: &[u8]) -> Self {
        CoreError::NotFound {
            key: String::from_utf8_lossy(key).into_owned(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CoreError::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
