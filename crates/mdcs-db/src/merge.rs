//! Applying DAGs received from peers.
//!
//! [`MergeProcessor::execute_merge`] walks back from a received head until it
//! reaches blocks the local blockstore already holds, then replays every new
//! block oldest first through [`MerkleClock::process_block`]. A local block
//! has always been processed, so the walk never needs to go past one.
//!
//! Encrypted field blocks are opened with a locally held key. Without one the
//! merge is skipped, the heads still advance, and the block is reported as
//! pending so it can be replayed by [`MergeProcessor::merge_encrypted_blocks`]
//! once the key arrives.

use crate::description::CollectionDescription;
use crate::error::{DbError, Result};
use crate::merkle_crdt::field_level_crdt;
use mdcs_core::keys::{DataStoreKey, EncStoreDocKey};
use mdcs_core::{Collection, CompositeDAG, Context, Namespaced, Reader, ReaderWriter, ReplicatedData, Txn};
use mdcs_merkle::encryption::decrypt_block;
use mdcs_merkle::{
    compute_cid, verify_block_signature, Block, BlockStore, Cid, ClockConfig, Encryption, IpldNode, MerkleClock,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

/// Where missing blocks are fetched from.
pub trait BlockSource {
    /// Raw bytes of `cid`, `None` if the source does not hold it.
    fn get_block_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>>;
}

impl<S: Reader> BlockSource for BlockStore<S> {
    fn get_block_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        match self.get_bytes(cid) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

impl BlockSource for HashMap<Cid, Vec<u8>> {
    fn get_block_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.get(cid).cloned())
    }
}

impl BlockSource for BTreeMap<Cid, Vec<u8>> {
    fn get_block_bytes(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        Ok(self.get(cid).cloned())
    }
}

/// An encrypted field block whose merge waits for a key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PendingBlock {
    pub doc_id: String,
    pub field_name: String,
    pub cid: Cid,
}

impl PendingBlock {
    /// Keys that can open this block: the field's own key, then the document key.
    pub fn key_targets(&self) -> [EncStoreDocKey; 2] {
        [
            EncStoreDocKey::new(self.doc_id.clone(), Some(self.field_name.clone())),
            EncStoreDocKey::new(self.doc_id.clone(), None),
        ]
    }
}

#[derive(Clone, Debug, Default)]
pub struct MergeOutcome {
    /// Blocks fetched and applied, in replay order.
    pub merged: Vec<Cid>,
    /// Encrypted blocks whose merge was skipped for lack of a key.
    pub pending: Vec<PendingBlock>,
}

struct Fetched {
    cid: Cid,
    bytes: Vec<u8>,
    block: Block,
}

/// Replays remote blocks of one collection into the local stores.
#[derive(Clone, Debug)]
pub struct MergeProcessor<S> {
    datastore: S,
    clock: MerkleClock<S>,
}

impl MergeProcessor<Namespaced<Txn>> {
    pub fn for_txn(txn: &Txn, config: ClockConfig) -> Self {
        let clock = MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), config);
        Self::new(txn.datastore(), clock)
    }
}

impl<S: ReaderWriter + Clone> MergeProcessor<S> {
    pub fn new(datastore: S, clock: MerkleClock<S>) -> Self {
        Self { datastore, clock }
    }

    pub fn clock(&self) -> &MerkleClock<S> {
        &self.clock
    }

    /// Fetch and apply every block reachable from `head` that is not yet local.
    pub fn execute_merge<B: BlockSource + ?Sized>(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        head: Cid,
        source: &B,
    ) -> Result<MergeOutcome> {
        let mut fetched = self.load_blocks(ctx, head, source)?;
        fetched.sort_by(|a, b| {
            a.block
                .delta
                .priority()
                .cmp(&b.block.delta.priority())
                .then_with(|| a.cid.to_string().cmp(&b.cid.to_string()))
        });

        let mut outcome = MergeOutcome::default();
        for item in fetched {
            ctx.check()?;
            self.clock.blockstore().put_raw(&item.cid, &item.bytes)?;
            if item.block.signature.is_some() {
                verify_block_signature(&item.block, self.clock.blockstore())?;
            }
            if let Some(pending) = self.process_remote(ctx, collection, &item.block, item.cid)? {
                outcome.pending.push(pending);
            }
            outcome.merged.push(item.cid);
        }

        debug!(
            collection = %collection.name,
            head = %head,
            merged = outcome.merged.len(),
            pending = outcome.pending.len(),
            "merged remote blocks"
        );
        Ok(outcome)
    }

    /// Depth-first walk from `head` over heads and links, stopping at local blocks.
    fn load_blocks<B: BlockSource + ?Sized>(&self, ctx: &Context, head: Cid, source: &B) -> Result<Vec<Fetched>> {
        let blockstore = self.clock.blockstore();
        let mut stack = vec![head];
        let mut seen = HashSet::new();
        let mut fetched = Vec::new();

        while let Some(cid) = stack.pop() {
            ctx.check()?;
            if !seen.insert(cid) || blockstore.has(&cid)? {
                continue;
            }
            let bytes = fetch_verified(source, &cid)?;
            let block = Block::unmarshal(&bytes)?;

            if let Some(signature) = block.signature {
                if !blockstore.has(&signature)? {
                    let sig_bytes = fetch_verified(source, &signature)?;
                    blockstore.put_raw(&signature, &sig_bytes)?;
                }
            }

            stack.extend(block.all_links());
            fetched.push(Fetched { cid, bytes, block });
        }
        Ok(fetched)
    }

    fn process_remote(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        block: &Block,
        cid: Cid,
    ) -> Result<Option<PendingBlock>> {
        let delta = &block.delta;
        let doc_id = String::from_utf8_lossy(delta.doc_id()).into_owned();

        if delta.is_collection() {
            self.clock.process_block(ctx, &Collection::new(collection.root_id), block, cid)?;
            return Ok(None);
        }
        if delta.is_composite() {
            let crdt = CompositeDAG::new(
                self.datastore.clone(),
                delta.schema_version_id(),
                DataStoreKey::new(collection.root_id, doc_id.as_str()),
            );
            if block.is_encrypted() {
                if let Some(key) = self.clock.encryptor().get_key(&doc_id, None)? {
                    self.restore_encryption_block(block, &doc_id, None, key)?;
                }
            }
            self.clock.process_block(ctx, &crdt, block, cid)?;
            return Ok(None);
        }

        let field_name = delta.field_name();
        let Some(description) = collection.field(field_name) else {
            debug!(collection = %collection.name, field = field_name, cid = %cid, "ignoring block of unknown field");
            return Ok(None);
        };
        let crdt = field_level_crdt(self.datastore.clone(), collection, &doc_id, description);

        if !block.is_encrypted() {
            self.clock.process_block(ctx, &crdt, block, cid)?;
            return Ok(None);
        }

        match self.find_key(&doc_id, field_name)? {
            Some((scope, key)) => {
                let plain = decrypt_block(block, &key)?;
                self.restore_encryption_block(block, &doc_id, scope, key)?;
                self.clock.process_block(ctx, &crdt, &plain, cid)?;
                Ok(None)
            }
            None => {
                warn!(doc_id = %doc_id, field = field_name, cid = %cid, "no key for encrypted block, merge deferred");
                self.clock.update_heads(ctx, &crdt, block, cid)?;
                Ok(Some(PendingBlock {
                    doc_id,
                    field_name: field_name.to_string(),
                    cid,
                }))
            }
        }
    }

    /// Merge previously deferred blocks whose keys are now held.
    ///
    /// Heads were already advanced when the blocks first arrived, so only the
    /// deltas are merged. Returns the blocks that still lack a key.
    pub fn merge_encrypted_blocks(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        pending: Vec<PendingBlock>,
    ) -> Result<Vec<PendingBlock>> {
        let mut blocks = Vec::with_capacity(pending.len());
        for item in pending {
            let block: Block = self.clock.blockstore().get(&item.cid)?;
            blocks.push((item, block));
        }
        blocks.sort_by_key(|(item, block)| (block.delta.priority(), item.cid.to_string()));

        let mut still_pending = Vec::new();
        for (item, block) in blocks {
            ctx.check()?;
            let Some(description) = collection.field(&item.field_name) else {
                continue;
            };
            let Some((scope, key)) = self.find_key(&item.doc_id, &item.field_name)? else {
                still_pending.push(item);
                continue;
            };
            let plain = decrypt_block(&block, &key)?;
            self.restore_encryption_block(&block, &item.doc_id, scope, key)?;
            let crdt = field_level_crdt(self.datastore.clone(), collection, &item.doc_id, description);
            crdt.merge(ctx, &plain.delta).map_err(|source| mdcs_merkle::MerkleError::MergingDelta {
                cid: item.cid.to_string(),
                source,
            })?;
            debug!(doc_id = %item.doc_id, field = %item.field_name, cid = %item.cid, "merged deferred block");
        }
        Ok(still_pending)
    }

    /// The key opening a field block and the scope it is stored under.
    fn find_key(&self, doc_id: &str, field_name: &str) -> Result<Option<(Option<String>, Vec<u8>)>> {
        let encryptor = self.clock.encryptor();
        if let Some(key) = encryptor.get_key(doc_id, Some(field_name))? {
            return Ok(Some((Some(field_name.to_string()), key)));
        }
        Ok(encryptor.get_key(doc_id, None)?.map(|key| (None, key)))
    }

    /// Store the encryption side-block a remote block links to, so later local
    /// writes on top of it inherit the key. Only stored when it reproduces the
    /// linked CID.
    fn restore_encryption_block(
        &self,
        block: &Block,
        doc_id: &str,
        field_name: Option<String>,
        key: Vec<u8>,
    ) -> Result<()> {
        let Some(link) = block.encryption else {
            return Ok(());
        };
        let encryption = Encryption {
            doc_id: doc_id.as_bytes().to_vec(),
            field_name,
            key,
        };
        if compute_cid(&encryption.marshal()?)? == link {
            self.clock.encryptor().put_encryption_block(&encryption)?;
        }
        Ok(())
    }
}

fn fetch_verified<B: BlockSource + ?Sized>(source: &B, cid: &Cid) -> Result<Vec<u8>> {
    let bytes = source
        .get_block_bytes(cid)?
        .ok_or_else(|| DbError::MissingRemoteBlock { cid: cid.to_string() })?;
    if compute_cid(&bytes)? != *cid {
        return Err(DbError::BlockCidMismatch { cid: cid.to_string() });
    }
    Ok(bytes)
}
