//! Content identifiers for blocks.
//!
//! Every node is addressed by a CIDv1 with the DAG-CBOR codec and a 32-byte
//! SHA2-256 multihash over its canonical encoding.

use crate::error::{MerkleError, Result};
use cid::multihash::Multihash;
pub use cid::Cid;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;

/// Multicodec code of DAG-CBOR.
pub const DAG_CBOR: u64 = 0x71;

/// Multihash code of SHA2-256.
pub const SHA2_256: u64 = 0x12;

/// Compute the content identifier of an encoded node.
pub fn compute_cid(encoded: &[u8]) -> Result<Cid> {
    let digest = Sha256::digest(encoded);
    let hash = Multihash::<64>::wrap(SHA2_256, &digest).map_err(|e| MerkleError::GeneratingLink(e.to_string()))?;
    Ok(Cid::new_v1(DAG_CBOR, hash))
}

/// Parse a CID from its string form.
pub fn parse_cid(s: &str) -> Result<Cid> {
    Cid::try_from(s).map_err(|e| MerkleError::InvalidCid(format!("{s}: {e}")))
}

/// Parse a CID from its binary form.
pub fn cid_from_bytes(bytes: &[u8]) -> Result<Cid> {
    Cid::try_from(bytes).map_err(|e| MerkleError::InvalidCid(e.to_string()))
}

/// Order CIDs by their string encoding, the order used inside blocks.
pub fn cmp_by_string(a: &Cid, b: &Cid) -> Ordering {
    a.to_string().cmp(&b.to_string())
}
