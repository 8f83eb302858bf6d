//! Error types for the Merkle clock layer.

use mdcs_core::CoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MerkleError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("schema registry is inconsistent: {0}")]
    Schema(String),

    #[error("failed to encode {type_name}: {reason}")]
    Encoding { type_name: &'static str, reason: String },

    /// The bytes are not a single well-formed CBOR item.
    #[error("failed to decode block: {0}")]
    Decoding(String),

    /// Well-formed CBOR that does not match the expected node type.
    #[error("failed to convert node to {expected}: {reason}")]
    NodeToBlock { expected: &'static str, reason: String },

    #[error("failed to generate link: {0}")]
    GeneratingLink(String),

    #[error("invalid cid: {0}")]
    InvalidCid(String),

    #[error("could not find block {cid}")]
    CouldNotFindBlock { cid: String },

    #[error("failed to get block {cid}: {source}")]
    FailedToGetBlock { cid: String, source: CoreError },

    #[error("failed to write block {cid}: {source}")]
    WritingBlock { cid: String, source: CoreError },

    #[error("failed to get heads: {0}")]
    GettingHeads(CoreError),

    #[error("failed to decode head height under {key}: {source}")]
    DecodingHeight { key: String, source: CoreError },

    #[error("failed to merge delta of block {cid}: {source}")]
    MergingDelta { cid: String, source: CoreError },

    #[error("failed to add head {cid}: {source}")]
    AddingHead { cid: String, source: CoreError },

    #[error("failed to replace head {old} with {new}: {source}")]
    ReplacingHead { old: String, new: String, source: CoreError },

    #[error("failed to check head {cid}: {source}")]
    CheckingHead { cid: String, source: CoreError },

    #[error("signing is enabled but no identity was provided")]
    MissingSigningIdentity,

    #[error("key type {0} cannot be used for signing")]
    UnsupportedKeyForSigning(&'static str),

    #[error("unsupported signature type {0}")]
    UnsupportedSignatureType(String),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("signature public key does not match the expected identity")]
    SignaturePubKeyMismatch,

    #[error("could not load signature block {cid}: {source}")]
    CouldNotLoadSignatureBlock { cid: String, source: Box<MerkleError> },

    #[error("could not load encryption block {cid}: {source}")]
    CouldNotLoadEncryptionBlock { cid: String, source: Box<MerkleError> },

    #[error("failed to encrypt payload: {0}")]
    Encrypting(String),

    #[error("failed to decrypt payload of document {doc_id}: {reason}")]
    Decrypting { doc_id: String, reason: String },

    #[error("invalid encryption key length {0}, expected 32 bytes")]
    InvalidKeyLength(usize),
}

impl MerkleError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            MerkleError::CouldNotFindBlock { .. } | MerkleError::Core(CoreError::NotFound { .. })
        )
    }
}

pub type Result<T> = std::result::Result<T, MerkleError>;
