//! Reading a document as of an earlier composite block.
//!
//! The fetcher copies the target's history into a transient store and
//! replays it there, so the primary stores are never written. History is
//! followed through the first head of each block only; revisions reachable
//! solely through a merged side branch are not replayed.

use crate::description::CollectionDescription;
use crate::document::DocumentId;
use crate::error::{DbError, Result};
use crate::merkle_crdt::field_level_crdt;
use mdcs_core::keys::DataStoreKey;
use mdcs_core::{Collection, CompositeDAG, Context, DocStatus, MemoryRootStore, Namespaced, Reader, Txn};
use mdcs_merkle::encryption::decrypt_block;
use mdcs_merkle::{Block, BlockStore, Cid, ClockConfig, DocEncryptor, IpldNode, MerkleClock, MerkleError};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::{debug, warn};

/// A document projection reconstructed at a past revision.
#[derive(Clone, Debug, PartialEq)]
pub struct HistoricalDocument {
    pub doc_id: DocumentId,
    /// The composite block the projection was built up to.
    pub cid: Cid,
    pub status: Option<DocStatus>,
    pub fields: BTreeMap<String, Value>,
}

pub struct VersionedFetcher<'a, B, E> {
    blocks: &'a BlockStore<B>,
    encryptor: &'a DocEncryptor<E>,
    collection: &'a CollectionDescription,
}

struct Transient {
    txn: Txn,
    clock: MerkleClock<Namespaced<Txn>>,
}

impl<'a, B: Reader, E: Reader> VersionedFetcher<'a, B, E> {
    /// `blocks` and `encryptor` are the primary stores; they are only read.
    pub fn new(blocks: &'a BlockStore<B>, encryptor: &'a DocEncryptor<E>, collection: &'a CollectionDescription) -> Self {
        Self {
            blocks,
            encryptor,
            collection,
        }
    }

    /// Reconstruct the document whose composite block is `target`.
    pub fn fetch(&self, ctx: &Context, target: Cid) -> Result<HistoricalDocument> {
        let head: Block = self.blocks.get(&target)?;
        if !head.delta.is_composite() {
            return Err(DbError::UnexpectedBlock {
                cid: target.to_string(),
                expected: "composite",
            });
        }
        let doc_id = DocumentId::parse(&String::from_utf8_lossy(head.delta.doc_id()))?;

        let store = MemoryRootStore::new();
        let txn = store.new_txn();
        let transient = Transient {
            clock: MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), ClockConfig::default()),
            txn,
        };

        let result = self.replay(ctx, &transient, target, &doc_id);
        transient.txn.discard();
        result
    }

    fn replay(&self, ctx: &Context, transient: &Transient, target: Cid, doc_id: &DocumentId) -> Result<HistoricalDocument> {
        let queued = self.seek(ctx, transient, target)?;
        debug!(doc_id = %doc_id, target = %target, revisions = queued.len(), "replaying history");

        let mut processed = HashSet::new();
        for cid in queued {
            self.merge(ctx, transient, cid, &mut processed)?;
        }

        let datastore = transient.txn.datastore();
        let status = CompositeDAG::new(
            datastore.clone(),
            self.collection.schema_version_id.clone(),
            DataStoreKey::new(self.collection.root_id, doc_id.as_str()),
        )
        .status()?;
        let mut fields = BTreeMap::new();
        for description in &self.collection.fields {
            let value = field_level_crdt(datastore.clone(), self.collection, doc_id.as_str(), description).value()?;
            if !value.is_null() {
                fields.insert(description.name.clone(), value);
            }
        }

        Ok(HistoricalDocument {
            doc_id: doc_id.clone(),
            cid: target,
            status,
            fields,
        })
    }

    /// Copy the history of `target` into the transient blockstore.
    ///
    /// Returns the blocks reached through first heads, oldest first. Linked
    /// field blocks are copied but replayed through their composite.
    fn seek(&self, ctx: &Context, transient: &Transient, target: Cid) -> Result<VecDeque<Cid>> {
        let local = transient.clock.blockstore();
        let mut queued = VecDeque::new();
        let mut stack = vec![(target, true)];

        while let Some((cid, top_parent)) = stack.pop() {
            ctx.check()?;
            if local.has(&cid)? {
                continue;
            }
            let bytes = self.blocks.get_bytes(&cid)?;
            local.put_raw(&cid, &bytes)?;
            if top_parent {
                queued.push_front(cid);
            }

            let block = Block::unmarshal(&bytes)?;
            for link in block.links.iter().rev() {
                stack.push((link.cid, false));
            }
            if let Some(parent) = block.heads.first() {
                stack.push((*parent, true));
            }
        }
        Ok(queued)
    }

    /// Replay `root` and every block it links to.
    fn merge(&self, ctx: &Context, transient: &Transient, root: Cid, processed: &mut HashSet<Cid>) -> Result<()> {
        let mut stack = vec![root];
        while let Some(cid) = stack.pop() {
            ctx.check()?;
            if !processed.insert(cid) {
                continue;
            }
            let block: Block = transient.clock.blockstore().get(&cid)?;
            self.process(ctx, transient, &block, cid)?;
            stack.extend(block.links.iter().rev().map(|link| link.cid));
        }
        Ok(())
    }

    fn process(&self, ctx: &Context, transient: &Transient, block: &Block, cid: Cid) -> Result<()> {
        let clock = &transient.clock;
        let datastore = transient.txn.datastore();
        let delta = &block.delta;
        let doc_id = String::from_utf8_lossy(delta.doc_id()).into_owned();

        if delta.is_collection() {
            clock.process_block(ctx, &Collection::new(self.collection.root_id), block, cid)?;
            return Ok(());
        }
        if delta.is_composite() {
            let crdt = CompositeDAG::new(
                datastore,
                delta.schema_version_id(),
                DataStoreKey::new(self.collection.root_id, doc_id.as_str()),
            );
            clock.process_block(ctx, &crdt, block, cid)?;
            return Ok(());
        }

        let Some(description) = self.collection.field(delta.field_name()) else {
            debug!(field = delta.field_name(), cid = %cid, "skipping block of unknown field");
            return Ok(());
        };
        let crdt = field_level_crdt(datastore, self.collection, &doc_id, description);
        if !block.is_encrypted() {
            clock.process_block(ctx, &crdt, block, cid)?;
            return Ok(());
        }

        let key = match self.encryptor.block_encryption(block) {
            Ok(Some(encryption)) => Some(encryption.key),
            Ok(None) => self.encryptor.find_key(&doc_id, delta.field_name())?,
            Err(MerkleError::CouldNotLoadEncryptionBlock { source, .. }) if source.is_not_found() => {
                self.encryptor.find_key(&doc_id, delta.field_name())?
            }
            Err(err) => return Err(err.into()),
        };
        match key {
            Some(key) => clock.process_block(ctx, &crdt, &decrypt_block(block, &key)?, cid)?,
            None => {
                warn!(doc_id = %doc_id, field = delta.field_name(), cid = %cid, "no key for encrypted block, value skipped");
                clock.update_heads(ctx, &crdt, block, cid)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::CType;
    use crate::document::DocumentWriter;
    use mdcs_core::CounterKind;
    use mdcs_merkle::{CommitOptions, EncryptionConfig};
    use serde_json::{json, Map};

    fn users() -> CollectionDescription {
        CollectionDescription::new(1, "Users", "schema-v1")
            .with_field("1", "name", CType::LwwRegister)
            .with_field("2", "points", CType::PCounter(CounterKind::Int))
    }

    fn fields(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    struct Fixture {
        writer: DocumentWriter<Namespaced<Txn>>,
        blocks: BlockStore<Namespaced<Txn>>,
        encryptor: DocEncryptor<Namespaced<Txn>>,
    }

    fn fixture() -> Fixture {
        let txn = MemoryRootStore::new().new_txn();
        Fixture {
            writer: DocumentWriter::for_txn(&txn, ClockConfig::default()),
            blocks: BlockStore::new(txn.blockstore()),
            encryptor: DocEncryptor::new(txn.encstore()),
        }
    }

    #[test]
    fn test_fetch_each_revision() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let opts = CommitOptions::default();
        let users = users();

        let v1 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice", "points": 1})), &opts).unwrap();
        let v2 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alicia"})), &opts).unwrap();
        let v3 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"points": 5})), &opts).unwrap();

        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        let at_v1 = fetcher.fetch(&ctx, v1.head).unwrap();
        assert_eq!(at_v1.fields["name"], json!("Alice"));
        assert_eq!(at_v1.fields["points"], json!(1));
        assert_eq!(at_v1.status, Some(DocStatus::Active));

        let at_v2 = fetcher.fetch(&ctx, v2.head).unwrap();
        assert_eq!(at_v2.fields["name"], json!("Alicia"));
        assert_eq!(at_v2.fields["points"], json!(1));

        let at_v3 = fetcher.fetch(&ctx, v3.head).unwrap();
        assert_eq!(at_v3.fields["points"], json!(6));
        assert_eq!(at_v3.doc_id, doc);

        // The primary projection is untouched.
        assert_eq!(fx.writer.read(&ctx, &users, &doc).unwrap().fields["points"], json!(6));
    }

    #[test]
    fn test_fetch_before_delete() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let opts = CommitOptions::default();
        let users = users();

        let v1 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        let v2 = fx.writer.delete(&ctx, &users, &doc, &opts).unwrap();

        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        assert_eq!(fetcher.fetch(&ctx, v1.head).unwrap().status, Some(DocStatus::Active));
        assert_eq!(fetcher.fetch(&ctx, v2.head).unwrap().status, Some(DocStatus::Deleted));
    }

    #[test]
    fn test_fetch_encrypted_history() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let users = users();
        let opts = CommitOptions::builder().encryption(EncryptionConfig::fields(["name"])).build();

        let v1 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        fx.writer
            .save(&ctx, &users, &doc, &fields(json!({"name": "Bob"})), &CommitOptions::default())
            .unwrap();

        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        assert_eq!(fetcher.fetch(&ctx, v1.head).unwrap().fields["name"], json!("Alice"));
    }

    #[test]
    fn test_fetch_without_key_skips_value() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let users = users();
        let opts = CommitOptions::builder().encryption(EncryptionConfig::fields(["name"])).build();

        let v1 = fx
            .writer
            .save(&ctx, &users, &doc, &fields(json!({"name": "Alice", "points": 2})), &opts)
            .unwrap();

        let empty = DocEncryptor::new(MemoryRootStore::new());
        let fetcher = VersionedFetcher::new(&fx.blocks, &empty, &users);
        let doc_v1 = fetcher.fetch(&ctx, v1.head).unwrap();
        assert!(!doc_v1.fields.contains_key("name"));
        assert_eq!(doc_v1.fields["points"], json!(2));
    }

    #[test]
    fn test_fetch_corrupt_encryption_block_fails() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let users = users();
        let opts = CommitOptions::builder().encryption(EncryptionConfig::fields(["name"])).build();

        let v1 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        let name_block = Block::unmarshal(&v1.blocks[0].1).unwrap();
        let side_block = name_block.encryption.unwrap();
        fx.encryptor.blocks().put_raw(&side_block, b"not a node").unwrap();

        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        assert!(matches!(
            fetcher.fetch(&ctx, v1.head),
            Err(DbError::Merkle(MerkleError::CouldNotLoadEncryptionBlock { .. }))
        ));
    }

    #[test]
    fn test_fetch_rejects_field_block_target() {
        let fx = fixture();
        let ctx = Context::new();
        let users = users();
        let v1 = fx
            .writer
            .save(&ctx, &users, &DocumentId::new(), &fields(json!({"name": "Alice"})), &CommitOptions::default())
            .unwrap();

        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        assert!(matches!(
            fetcher.fetch(&ctx, v1.blocks[0].0),
            Err(DbError::UnexpectedBlock { .. })
        ));
    }

    #[test]
    fn test_fetch_missing_history_fails() {
        let fx = fixture();
        let ctx = Context::new();
        let doc = DocumentId::new();
        let users = users();
        let opts = CommitOptions::default();

        fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        let v2 = fx.writer.save(&ctx, &users, &doc, &fields(json!({"name": "Bob"})), &opts).unwrap();

        // Only the newest revision is available.
        let partial = BlockStore::new(MemoryRootStore::new());
        for (cid, bytes) in &v2.blocks {
            partial.put_raw(cid, bytes).unwrap();
        }

        let fetcher = VersionedFetcher::new(&partial, &fx.encryptor, &users);
        assert!(matches!(
            fetcher.fetch(&ctx, v2.head),
            Err(DbError::Merkle(MerkleError::CouldNotFindBlock { .. }))
        ));
    }

    #[test]
    fn test_fetch_cancelled() {
        let fx = fixture();
        let ctx = Context::new();
        let users = users();
        let v1 = fx
            .writer
            .save(&ctx, &users, &DocumentId::new(), &fields(json!({"name": "Alice"})), &CommitOptions::default())
            .unwrap();

        ctx.cancel();
        let fetcher = VersionedFetcher::new(&fx.blocks, &fx.encryptor, &users);
        assert!(fetcher.fetch(&ctx, v1.head).is_err());
    }
}
