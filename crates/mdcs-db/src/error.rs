//! Error types for the database layer.

use mdcs_core::CoreError;
use mdcs_merkle::MerkleError;
use thiserror::Error;

/// Errors that can occur in database operations.
#[derive(Error, Debug)]
pub enum DbError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Merkle(#[from] MerkleError),

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Document {0} is deleted")]
    DocumentDeleted(String),

    #[error("Collection not found: {0}")]
    CollectionNotFound(String),

    #[error("Field {field} does not exist in collection {collection}")]
    FieldNotFound { collection: String, field: String },

    #[error("Invalid value for field {field}: {reason}")]
    InvalidFieldValue { field: String, reason: String },

    #[error("Invalid document id: {0}")]
    InvalidDocumentId(String),

    #[error("Block {cid} does not match its content")]
    BlockCidMismatch { cid: String },

    #[error("Block {cid} is not a {expected} block")]
    UnexpectedBlock { cid: String, expected: &'static str },

    #[error("Block {cid} is not available from the source")]
    MissingRemoteBlock { cid: String },

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Key exchange failed: {0}")]
    KeyExchange(String),

    #[error("Pub/sub error: {0}")]
    PubSub(String),

    #[error("Channel closed")]
    ChannelClosed,
}

impl From<serde_json::Error> for DbError {
    fn from(err: serde_json::Error) -> Self {
        DbError::SerializationError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
