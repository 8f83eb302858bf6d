//! Content-addressed storage of encoded nodes over a key-value store.

use crate::codec::IpldNode;
use crate::error::{MerkleError, Result};
use crate::link::{compute_cid, Cid};
use mdcs_core::store::{Reader, Writer};

/// Stores encoded nodes under `/{cid}`.
///
/// The same type backs the main block store and the encryption side-block
/// store; they differ only in the namespace of `S`.
#[derive(Clone, Debug)]
pub struct BlockStore<S> {
    store: S,
}

fn block_key(cid: &Cid) -> Vec<u8> {
    format!("/{cid}").into_bytes()
}

impl<S> BlockStore<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn inner(&self) -> &S {
        &self.store
    }
}

impl<S: Reader> BlockStore<S> {
    pub fn has(&self, cid: &Cid) -> Result<bool> {
        self.store.has(&block_key(cid)).map_err(|source| MerkleError::FailedToGetBlock {
            cid: cid.to_string(),
            source,
        })
    }

    /// Raw bytes of a stored node. A missing node is `CouldNotFindBlock`.
    pub fn get_bytes(&self, cid: &Cid) -> Result<Vec<u8>> {
        match self.store.get(&block_key(cid)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.is_not_found() => Err(MerkleError::CouldNotFindBlock { cid: cid.to_string() }),
            Err(source) => Err(MerkleError::FailedToGetBlock {
                cid: cid.to_string(),
                source,
            }),
        }
    }

    pub fn get<T: IpldNode>(&self, cid: &Cid) -> Result<T> {
        T::unmarshal(&self.get_bytes(cid)?)
    }
}

impl<S: Writer> BlockStore<S> {
    /// Store already-encoded bytes and return their CID.
    pub fn put_bytes(&self, bytes: &[u8]) -> Result<Cid> {
        let cid = compute_cid(bytes)?;
        self.put_raw(&cid, bytes)?;
        Ok(cid)
    }

    /// Store bytes under a CID computed elsewhere (e.g. received from a peer).
    pub fn put_raw(&self, cid: &Cid, bytes: &[u8]) -> Result<()> {
        self.store
            .set(&block_key(cid), bytes)
            .map_err(|source| MerkleError::WritingBlock {
                cid: cid.to_string(),
                source,
            })
    }

    /// Encode and store a node.
    pub fn put<T: IpldNode>(&self, node: &T) -> Result<Cid> {
        self.put_bytes(&node.marshal()?)
    }
}
