//! The Merkle clock: turns deltas into linked blocks and keeps the head set
//! of each CRDT namespace current.
//!
//! Local writes go through [`MerkleClock::add_delta`], which assigns the
//! priority from the current heads, decides encryption, signs when asked,
//! stores the block and then merges it. Blocks received from peers already
//! carry their priority, encryption and signature and only go through
//! [`MerkleClock::process_block`].

use crate::block::{Block, DAGLink};
use crate::blockstore::BlockStore;
use crate::codec::IpldNode;
use crate::config::{ClockConfig, CommitOptions};
use crate::encryption::{determine_block_encryption, encrypt_block, DocEncryptor};
use crate::error::{MerkleError, Result};
use crate::heads::HeadSet;
use crate::link::Cid;
use crate::signature::sign_block;
use mdcs_core::store::ReaderWriter;
use mdcs_core::{Context, Delta, ReplicatedData};
use tracing::{debug, error};

#[derive(Clone, Debug)]
pub struct MerkleClock<S> {
    headstore: S,
    blockstore: BlockStore<S>,
    encryptor: DocEncryptor<S>,
    config: ClockConfig,
}

impl<S: Clone> MerkleClock<S> {
    pub fn new(headstore: S, blockstore: S, encstore: S, config: ClockConfig) -> Self {
        Self {
            headstore,
            blockstore: BlockStore::new(blockstore),
            encryptor: DocEncryptor::new(encstore),
            config,
        }
    }

    /// Head set of the namespace `crdt` writes to.
    pub fn heads<C: ReplicatedData + ?Sized>(&self, crdt: &C) -> HeadSet<S> {
        HeadSet::new(self.headstore.clone(), crdt.headstore_prefix())
    }
}

impl<S> MerkleClock<S> {
    pub fn blockstore(&self) -> &BlockStore<S> {
        &self.blockstore
    }

    pub fn encryptor(&self) -> &DocEncryptor<S> {
        &self.encryptor
    }

    pub fn config(&self) -> &ClockConfig {
        &self.config
    }
}

impl<S: ReaderWriter + Clone> MerkleClock<S> {
    /// Commit a local delta on top of the current heads of `crdt`.
    ///
    /// Returns the block's CID and the stored bytes, which are encrypted when
    /// encryption applies.
    pub fn add_delta<C: ReplicatedData + ?Sized>(
        &self,
        ctx: &Context,
        crdt: &C,
        delta: impl Into<Delta>,
        links: Vec<DAGLink>,
        options: &CommitOptions,
    ) -> Result<(Cid, Vec<u8>)> {
        let mut delta = delta.into();
        let heads = self.heads(crdt);
        let (parents, height) = heads.list(ctx)?;
        delta.set_priority(height + 1);

        let block = Block::new(delta, links, parents);
        let mut stored = block.clone();

        let encryption = determine_block_encryption(
            ctx,
            &block,
            options.encryption.as_ref(),
            &self.blockstore,
            &self.encryptor,
        )?;
        if let Some(encryption) = &encryption {
            let link = self.encryptor.put_encryption_block(encryption)?;
            stored = encrypt_block(&block, encryption, link)?;
        }

        if options.signing_enabled && (block.delta.is_composite() || block.delta.priority() == 1) {
            let key = options.identity.as_ref().ok_or(MerkleError::MissingSigningIdentity)?;
            sign_block(&mut stored, key, &self.blockstore)?;
        }

        let bytes = stored.marshal()?;
        let link = self.blockstore.put_bytes(&bytes)?;
        debug!(
            cid = %link,
            namespace = %heads.namespace(),
            priority = block.delta.priority(),
            encrypted = stored.is_encrypted(),
            signed = stored.signature.is_some(),
            "added delta"
        );

        self.process_block(ctx, crdt, &block, link)?;
        Ok((link, bytes))
    }

    /// Merge an already-built block and update the head set.
    ///
    /// `block` must carry a plaintext delta.
    pub fn process_block<C: ReplicatedData + ?Sized>(
        &self,
        ctx: &Context,
        crdt: &C,
        block: &Block,
        link: Cid,
    ) -> Result<()> {
        crdt.merge(ctx, &block.delta)
            .map_err(|source| MerkleError::MergingDelta {
                cid: link.to_string(),
                source,
            })?;
        self.update_heads(ctx, crdt, block, link)
    }

    /// Advance the head set past every block `block` subsumes.
    ///
    /// A genesis block becomes a head. A linked head is replaced by the new
    /// block. A linked block that is stored but no longer a head means the
    /// new block starts a parallel branch, so it is added as a further head.
    /// Unknown links are ignored.
    pub fn update_heads<C: ReplicatedData + ?Sized>(
        &self,
        ctx: &Context,
        crdt: &C,
        block: &Block,
        link: Cid,
    ) -> Result<()> {
        let heads = self.heads(crdt);
        let priority = block.delta.priority();

        if block.heads.is_empty() {
            return heads.write(&link, priority).map_err(|source| MerkleError::AddingHead {
                cid: link.to_string(),
                source,
            });
        }

        for linked in block.all_links() {
            ctx.check()?;
            let is_head = heads.is_head(&linked).map_err(|source| MerkleError::CheckingHead {
                cid: linked.to_string(),
                source,
            })?;
            if is_head {
                heads
                    .replace(&linked, &link, priority)
                    .map_err(|source| MerkleError::ReplacingHead {
                        old: linked.to_string(),
                        new: link.to_string(),
                        source,
                    })?;
                continue;
            }

            if !self.blockstore.has(&linked)? {
                continue;
            }
            if let Err(source) = heads.write(&link, priority) {
                if self.config.strict_head_updates {
                    return Err(MerkleError::AddingHead {
                        cid: link.to_string(),
                        source,
                    });
                }
                error!(cid = %link, error = %source, "failure adding head");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CommitOptionsBuilder;
    use crate::encryption::EncryptionConfig;
    use crate::signature::{verify_block_signature, SigningKey};
    use mdcs_core::keys::DataStoreKey;
    use mdcs_core::{CompositeDAG, LWWRegister, MemoryRootStore, Namespaced, Txn};

    struct Fixture {
        txn: Txn,
        clock: MerkleClock<Namespaced<Txn>>,
    }

    fn fixture(config: ClockConfig) -> Fixture {
        let txn = MemoryRootStore::new().new_txn();
        let clock = MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), config);
        Fixture { txn, clock }
    }

    fn register(txn: &Txn, field: &str) -> LWWRegister<Namespaced<Txn>> {
        let key = DataStoreKey::new(1, "bae-1").with_field_id("1");
        LWWRegister::new(txn.datastore(), "schema-v1", key, field)
    }

    #[test]
    fn test_genesis_and_chain() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let ctx = Context::new();
        let opts = CommitOptions::default();

        let (first, bytes) = f.clock.add_delta(&ctx, &reg, reg.delta(b"John".to_vec()), vec![], &opts).unwrap();
        let block = Block::get_from_bytes(&bytes).unwrap();
        assert!(block.heads.is_empty());
        assert_eq!(block.delta.priority(), 1);
        assert_eq!(f.clock.heads(&reg).list(&ctx).unwrap(), (vec![first], 1));

        let (second, bytes) = f.clock.add_delta(&ctx, &reg, reg.delta(b"Jo".to_vec()), vec![], &opts).unwrap();
        let block = Block::get_from_bytes(&bytes).unwrap();
        assert_eq!(block.heads, vec![first]);
        assert_eq!(block.delta.priority(), 2);
        assert_eq!(f.clock.heads(&reg).list(&ctx).unwrap(), (vec![second], 2));
        assert_eq!(reg.value().unwrap(), Some(b"Jo".to_vec()));
    }

    #[test]
    fn test_process_block_is_idempotent() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let ctx = Context::new();

        let (link, bytes) = f
            .clock
            .add_delta(&ctx, &reg, reg.delta(b"John".to_vec()), vec![], &CommitOptions::default())
            .unwrap();
        let block = Block::get_from_bytes(&bytes).unwrap();
        f.clock.process_block(&ctx, &reg, &block, link).unwrap();

        assert_eq!(f.clock.heads(&reg).list(&ctx).unwrap(), (vec![link], 1));
        assert_eq!(reg.value().unwrap(), Some(b"John".to_vec()));
    }

    #[test]
    fn test_unknown_links_do_not_register_heads() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let ctx = Context::new();

        let orphan = crate::link::compute_cid(b"elsewhere").unwrap();
        let mut delta = reg.delta(b"x".to_vec());
        delta.priority = 4;
        let block = Block::new(delta.into(), vec![], vec![orphan]);
        let link = f.clock.blockstore().put(&block).unwrap();
        f.clock.process_block(&ctx, &reg, &block, link).unwrap();

        assert!(f.clock.heads(&reg).list(&ctx).unwrap().0.is_empty());
    }

    #[test]
    fn test_signing_requires_identity() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let opts = CommitOptionsBuilder::new().signing(true).build();

        let err = f
            .clock
            .add_delta(&Context::new(), &reg, reg.delta(b"x".to_vec()), vec![], &opts)
            .unwrap_err();
        assert!(matches!(err, MerkleError::MissingSigningIdentity));
    }

    #[test]
    fn test_signing_scope() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let ctx = Context::new();
        let opts = CommitOptions::builder().sign_with(SigningKey::generate_ed25519()).build();

        let (_, first) = f.clock.add_delta(&ctx, &reg, reg.delta(b"a".to_vec()), vec![], &opts).unwrap();
        let first = Block::get_from_bytes(&first).unwrap();
        assert!(verify_block_signature(&first, f.clock.blockstore()).unwrap());

        let (_, second) = f.clock.add_delta(&ctx, &reg, reg.delta(b"b".to_vec()), vec![], &opts).unwrap();
        assert!(Block::get_from_bytes(&second).unwrap().signature.is_none());

        let composite = CompositeDAG::new(f.txn.datastore(), "schema-v1", DataStoreKey::new(1, "bae-1"));
        for _ in 0..2 {
            let (_, bytes) = f
                .clock
                .add_delta(&ctx, &composite, composite.delta(Default::default()), vec![], &opts)
                .unwrap();
            let block = Block::get_from_bytes(&bytes).unwrap();
            assert!(verify_block_signature(&block, f.clock.blockstore()).unwrap());
        }
    }

    #[test]
    fn test_encrypted_payload_is_stored_sealed() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "age");
        let ctx = Context::new();
        let opts = CommitOptions::builder().encryption(EncryptionConfig::fields(["age"])).build();

        let (link, bytes) = f.clock.add_delta(&ctx, &reg, reg.delta(b"33".to_vec()), vec![], &opts).unwrap();
        let stored = Block::get_from_bytes(&bytes).unwrap();
        assert!(stored.is_encrypted());
        assert_ne!(stored.delta.data(), Some(&b"33"[..]));
        assert_eq!(f.clock.blockstore().get_bytes(&link).unwrap(), bytes);
        // The local projection holds the plaintext.
        assert_eq!(reg.value().unwrap(), Some(b"33".to_vec()));

        let (_, bytes) = f
            .clock
            .add_delta(&ctx, &reg, reg.delta(b"34".to_vec()), vec![], &CommitOptions::default())
            .unwrap();
        let next = Block::get_from_bytes(&bytes).unwrap();
        let first_key = f.clock.encryptor().block_encryption(&stored).unwrap().unwrap();
        let next_key = f.clock.encryptor().block_encryption(&next).unwrap().unwrap();
        assert_eq!(first_key.key, next_key.key);
    }

    #[test]
    fn test_add_delta_checks_cancellation() {
        let f = fixture(ClockConfig::default());
        let reg = register(&f.txn, "name");
        let ctx = Context::new();
        f.clock
            .add_delta(&ctx, &reg, reg.delta(b"a".to_vec()), vec![], &CommitOptions::default())
            .unwrap();

        ctx.cancel();
        assert!(f
            .clock
            .add_delta(&ctx, &reg, reg.delta(b"b".to_vec()), vec![], &CommitOptions::default())
            .is_err());
    }
}
