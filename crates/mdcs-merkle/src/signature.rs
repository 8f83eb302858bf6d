//! Block signing and verification.
//!
//! A signature covers the canonical encoding of the block with its
//! `signature` link cleared, and is stored as its own `Signature` node in the
//! block store.

use crate::block::{Block, Signature, SignatureHeader};
use crate::blockstore::BlockStore;
use crate::codec::IpldNode;
use crate::error::{MerkleError, Result};
use ed25519_dalek::{Signer, Verifier};
use mdcs_core::store::{Reader, Writer};
use rand_core::OsRng;
use x25519_dalek::StaticSecret;

pub const SIGNATURE_TYPE_ED25519: &str = "ed25519";

/// A private key held by the committing node.
///
/// Only Ed25519 keys can sign. X25519 keys exist for key exchange and are
/// rejected with `UnsupportedKeyForSigning`.
#[derive(Clone)]
pub enum SigningKey {
    Ed25519(ed25519_dalek::SigningKey),
    X25519(StaticSecret),
}

impl SigningKey {
    pub fn generate_ed25519() -> Self {
        SigningKey::Ed25519(ed25519_dalek::SigningKey::generate(&mut OsRng))
    }

    pub fn key_type(&self) -> &'static str {
        match self {
            SigningKey::Ed25519(_) => SIGNATURE_TYPE_ED25519,
            SigningKey::X25519(_) => "x25519",
        }
    }

    /// Raw public key bytes.
    pub fn public_key(&self) -> Vec<u8> {
        match self {
            SigningKey::Ed25519(key) => key.verifying_key().to_bytes().to_vec(),
            SigningKey::X25519(secret) => x25519_dalek::PublicKey::from(secret).as_bytes().to_vec(),
        }
    }

    fn sign(&self, message: &[u8]) -> Result<Signature> {
        match self {
            SigningKey::Ed25519(key) => Ok(Signature {
                header: SignatureHeader {
                    sig_type: SIGNATURE_TYPE_ED25519.to_string(),
                    identity: key.verifying_key().to_bytes().to_vec(),
                },
                value: key.sign(message).to_bytes().to_vec(),
            }),
            SigningKey::X25519(_) => Err(MerkleError::UnsupportedKeyForSigning("x25519")),
        }
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SigningKey::{}({})", self.key_type(), hex::encode(self.public_key()))
    }
}

/// Sign `block`, store the `Signature` node and link it from the block.
pub fn sign_block<S: Writer>(block: &mut Block, key: &SigningKey, blockstore: &BlockStore<S>) -> Result<()> {
    block.signature = None;
    let signature = key.sign(&block.marshal()?)?;
    let cid = blockstore.put(&signature)?;
    tracing::debug!(signature = %cid, identity = %hex::encode(&signature.header.identity), "signed block");
    block.signature = Some(cid);
    Ok(())
}

/// Check the signature of `block`.
///
/// Returns `Ok(false)` for an unsigned block and `Ok(true)` when the stored
/// signature is valid for the block contents.
pub fn verify_block_signature<S: Reader>(block: &Block, blockstore: &BlockStore<S>) -> Result<bool> {
    Ok(load_and_verify(block, blockstore)?.is_some())
}

/// Like [`verify_block_signature`], also requiring the signer to be `identity`.
pub fn verify_block_signature_with_identity<S: Reader>(
    block: &Block,
    blockstore: &BlockStore<S>,
    identity: &[u8],
) -> Result<bool> {
    match load_and_verify(block, blockstore)? {
        None => Ok(false),
        Some(signature) if signature.header.identity == identity => Ok(true),
        Some(_) => Err(MerkleError::SignaturePubKeyMismatch),
    }
}

fn load_and_verify<S: Reader>(block: &Block, blockstore: &BlockStore<S>) -> Result<Option<Signature>> {
    let Some(cid) = block.signature else {
        return Ok(None);
    };
    let signature: Signature = blockstore
        .get(&cid)
        .map_err(|source| MerkleError::CouldNotLoadSignatureBlock {
            cid: cid.to_string(),
            source: Box::new(source),
        })?;

    let mut unsigned = block.clone();
    unsigned.signature = None;
    let message = unsigned.marshal()?;

    match signature.header.sig_type.as_str() {
        SIGNATURE_TYPE_ED25519 => verify_ed25519(&signature, &message)?,
        other => return Err(MerkleError::UnsupportedSignatureType(other.to_string())),
    }
    Ok(Some(signature))
}

fn verify_ed25519(signature: &Signature, message: &[u8]) -> Result<()> {
    let identity: [u8; 32] = signature
        .header
        .identity
        .as_slice()
        .try_into()
        .map_err(|_| MerkleError::SignatureVerificationFailed)?;
    let public =
        ed25519_dalek::VerifyingKey::from_bytes(&identity).map_err(|_| MerkleError::SignatureVerificationFailed)?;
    let value = ed25519_dalek::Signature::from_slice(&signature.value)
        .map_err(|_| MerkleError::SignatureVerificationFailed)?;
    public
        .verify(message, &value)
        .map_err(|_| MerkleError::SignatureVerificationFailed)
}
