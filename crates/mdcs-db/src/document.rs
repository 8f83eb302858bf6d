//! Document identifiers and the local write path.
//!
//! A document revision is committed as one block per written field, then a
//! composite block linking those field blocks by name. Branchable collections
//! additionally get a collection-level block linking the composite.

use crate::description::CollectionDescription;
use crate::error::{DbError, Result};
use crate::merkle_crdt::{field_level_crdt, MerkleCrdt};
use mdcs_core::keys::DataStoreKey;
use mdcs_core::{
    Collection, CollectionDelta, CompositeDAG, Context, DocStatus, Namespaced, ReaderWriter, Txn,
};
use mdcs_merkle::{Cid, ClockConfig, CommitOptions, DAGLink, MerkleClock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::str::FromStr;
use tracing::debug;
use ulid::Ulid;

/// Prefix shared by every document id.
pub const DOC_ID_PREFIX: &str = "bae-";

/// Unique identifier for a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new() -> Self {
        Self(format!("{DOC_ID_PREFIX}{}", Ulid::new().to_string().to_lowercase()))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let ulid = s
            .strip_prefix(DOC_ID_PREFIX)
            .ok_or_else(|| DbError::InvalidDocumentId(s.to_string()))?;
        Ulid::from_string(&ulid.to_uppercase()).map_err(|_| DbError::InvalidDocumentId(s.to_string()))?;
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for DocumentId {
    type Err = DbError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current projection of a document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub status: DocStatus,
    /// Set fields only; cleared registers are left out.
    pub fields: BTreeMap<String, Value>,
}

/// Blocks produced by one document commit, in commit order.
#[derive(Clone, Debug)]
pub struct CommitResult {
    pub doc_id: DocumentId,
    /// CID of the composite block of this revision.
    pub head: Cid,
    pub blocks: Vec<(Cid, Vec<u8>)>,
}

/// Commits document revisions through a Merkle clock.
#[derive(Clone, Debug)]
pub struct DocumentWriter<S> {
    datastore: S,
    clock: MerkleClock<S>,
}

impl DocumentWriter<Namespaced<Txn>> {
    /// Writer over the stores of `txn`.
    pub fn for_txn(txn: &Txn, config: ClockConfig) -> Self {
        let clock = MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), config);
        Self::new(txn.datastore(), clock)
    }
}

impl<S: ReaderWriter + Clone> DocumentWriter<S> {
    pub fn new(datastore: S, clock: MerkleClock<S>) -> Self {
        Self { datastore, clock }
    }

    pub fn clock(&self) -> &MerkleClock<S> {
        &self.clock
    }

    pub fn composite(&self, collection: &CollectionDescription, doc_id: &DocumentId) -> CompositeDAG<S> {
        CompositeDAG::new(
            self.datastore.clone(),
            collection.schema_version_id.clone(),
            DataStoreKey::new(collection.root_id, doc_id.as_str()),
        )
    }

    /// Commit `fields` as a new revision of `doc_id`.
    ///
    /// Each value is converted by the field's CRDT: registers take the value
    /// itself (`null` clears), counters take an increment.
    pub fn save(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        doc_id: &DocumentId,
        fields: &Map<String, Value>,
        options: &CommitOptions,
    ) -> Result<CommitResult> {
        let composite = self.composite(collection, doc_id);
        if composite.status()? == Some(DocStatus::Deleted) {
            return Err(DbError::DocumentDeleted(doc_id.to_string()));
        }

        let mut blocks = Vec::with_capacity(fields.len() + 2);
        let mut links = Vec::with_capacity(fields.len());
        for (name, value) in fields {
            ctx.check()?;
            let description = collection.require_field(name)?;
            let crdt = MerkleCrdt::new(
                &self.clock,
                field_level_crdt(self.datastore.clone(), collection, doc_id.as_str(), description),
            );
            let delta = crdt.crdt().delta_for(name, value)?;
            let (cid, bytes) = crdt.save(ctx, delta, vec![], options)?;
            links.push(DAGLink::new(name.clone(), cid));
            blocks.push((cid, bytes));
        }

        self.commit_composite(ctx, collection, doc_id, &composite, DocStatus::Active, links, options, blocks)
    }

    /// Commit a revision marking `doc_id` deleted.
    pub fn delete(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        doc_id: &DocumentId,
        options: &CommitOptions,
    ) -> Result<CommitResult> {
        let composite = self.composite(collection, doc_id);
        match composite.status()? {
            None => return Err(DbError::DocumentNotFound(doc_id.to_string())),
            Some(DocStatus::Deleted) => return Err(DbError::DocumentDeleted(doc_id.to_string())),
            Some(DocStatus::Active) => {}
        }
        self.commit_composite(
            ctx,
            collection,
            doc_id,
            &composite,
            DocStatus::Deleted,
            vec![],
            options,
            Vec::with_capacity(2),
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_composite(
        &self,
        ctx: &Context,
        collection: &CollectionDescription,
        doc_id: &DocumentId,
        composite: &CompositeDAG<S>,
        status: DocStatus,
        links: Vec<DAGLink>,
        options: &CommitOptions,
        mut blocks: Vec<(Cid, Vec<u8>)>,
    ) -> Result<CommitResult> {
        let (head, bytes) = MerkleCrdt::new(&self.clock, composite).save(ctx, composite.delta(status), links, options)?;
        blocks.push((head, bytes));

        if collection.branchable {
            // Collection blocks carry no payload and no document id to key on.
            let options = CommitOptions {
                encryption: None,
                ..options.clone()
            };
            let delta = CollectionDelta {
                priority: 0,
                schema_version_id: collection.schema_version_id.clone(),
            };
            let link = DAGLink::new(doc_id.as_str(), head);
            let crdt = MerkleCrdt::new(&self.clock, Collection::new(collection.root_id));
            blocks.push(crdt.save(ctx, delta, vec![link], &options)?);
        }

        debug!(
            collection = %collection.name,
            doc_id = %doc_id,
            head = %head,
            ?status,
            blocks = blocks.len(),
            "committed document revision"
        );
        Ok(CommitResult {
            doc_id: doc_id.clone(),
            head,
            blocks,
        })
    }

    /// Read the current projection of `doc_id`.
    pub fn read(&self, ctx: &Context, collection: &CollectionDescription, doc_id: &DocumentId) -> Result<Document> {
        let status = self
            .composite(collection, doc_id)
            .status()?
            .ok_or_else(|| DbError::DocumentNotFound(doc_id.to_string()))?;

        let mut fields = BTreeMap::new();
        for description in &collection.fields {
            ctx.check()?;
            let value = field_level_crdt(self.datastore.clone(), collection, doc_id.as_str(), description).value()?;
            if !value.is_null() {
                fields.insert(description.name.clone(), value);
            }
        }
        Ok(Document {
            id: doc_id.clone(),
            status,
            fields,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::description::CType;
    use mdcs_core::{CounterKind, MemoryRootStore};
    use mdcs_merkle::{Block, EncryptionConfig, IpldNode, HEAD_LINK_NAME};
    use serde_json::json;

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

    fn writer(root: &MemoryRootStore) -> (Txn, DocumentWriter<Namespaced<Txn>>) {
        let txn = root.new_txn();
        let writer = DocumentWriter::for_txn(&txn, ClockConfig::default());
        (txn, writer)
    }

    #[test]
    fn test_document_id_format() {
        let id = DocumentId::new();
        assert!(id.as_str().starts_with(DOC_ID_PREFIX));
        assert_eq!(DocumentId::parse(id.as_str()).unwrap(), id);
        assert!(matches!(DocumentId::parse("doc-1"), Err(DbError::InvalidDocumentId(_))));
        assert!(matches!(DocumentId::parse("bae-nope"), Err(DbError::InvalidDocumentId(_))));
    }

    #[test]
    fn test_save_links_field_blocks() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let ctx = Context::new();
        let doc = DocumentId::new();

        let result = writer
            .save(&ctx, &users(), &doc, &fields(json!({"name": "Alice", "points": 3})), &CommitOptions::default())
            .unwrap();
        assert_eq!(result.blocks.len(), 3);

        let (head_cid, head_bytes) = result.blocks.last().unwrap();
        assert_eq!(*head_cid, result.head);
        let composite = Block::unmarshal(head_bytes).unwrap();
        assert!(composite.delta.is_composite());
        assert_eq!(composite.link_by_name("name"), Some(result.blocks[0].0));
        assert_eq!(composite.link_by_name("points"), Some(result.blocks[1].0));
        assert_eq!(composite.link_by_name(HEAD_LINK_NAME), None);

        let read = writer.read(&ctx, &users(), &doc).unwrap();
        assert_eq!(read.status, DocStatus::Active);
        assert_eq!(read.fields["name"], json!("Alice"));
        assert_eq!(read.fields["points"], json!(3));
    }

    #[test]
    fn test_update_builds_on_previous_revision() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let ctx = Context::new();
        let doc = DocumentId::new();
        let opts = CommitOptions::default();

        let first = writer.save(&ctx, &users(), &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        let second = writer
            .save(&ctx, &users(), &doc, &fields(json!({"name": "Bob", "points": 2})), &opts)
            .unwrap();

        let composite = Block::unmarshal(&second.blocks.last().unwrap().1).unwrap();
        assert_eq!(composite.heads, vec![first.head]);
        assert_eq!(composite.delta.priority(), 2);
        assert_eq!(writer.read(&ctx, &users(), &doc).unwrap().fields["name"], json!("Bob"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let err = writer
            .save(
                &Context::new(),
                &users(),
                &DocumentId::new(),
                &fields(json!({"email": "a@b"})),
                &CommitOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, DbError::FieldNotFound { .. }));
    }

    #[test]
    fn test_delete_is_final() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let ctx = Context::new();
        let doc = DocumentId::new();
        let opts = CommitOptions::default();

        assert!(matches!(
            writer.delete(&ctx, &users(), &doc, &opts),
            Err(DbError::DocumentNotFound(_))
        ));

        writer.save(&ctx, &users(), &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        writer.delete(&ctx, &users(), &doc, &opts).unwrap();

        let read = writer.read(&ctx, &users(), &doc).unwrap();
        assert_eq!(read.status, DocStatus::Deleted);
        assert!(matches!(
            writer.save(&ctx, &users(), &doc, &fields(json!({"name": "Eve"})), &opts),
            Err(DbError::DocumentDeleted(_))
        ));
    }

    #[test]
    fn test_branchable_collection_block() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let ctx = Context::new();
        let doc = DocumentId::new();
        let users = users().branchable(true);
        let opts = CommitOptions::builder().encryption(EncryptionConfig::document()).build();

        let result = writer.save(&ctx, &users, &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        assert_eq!(result.blocks.len(), 3);

        let collection = Block::unmarshal(&result.blocks[2].1).unwrap();
        assert!(collection.delta.is_collection());
        assert!(!collection.is_encrypted());
        assert_eq!(collection.link_by_name(doc.as_str()), Some(result.head));

        let heads = writer.clock().heads(&Collection::new(1)).list(&ctx).unwrap();
        assert_eq!(heads, (vec![result.blocks[2].0], 1));
    }

    #[test]
    fn test_encrypted_document_reads_plaintext() {
        let root = MemoryRootStore::new();
        let (_txn, writer) = writer(&root);
        let ctx = Context::new();
        let doc = DocumentId::new();
        let opts = CommitOptions::builder().encryption(EncryptionConfig::fields(["name"])).build();

        let result = writer.save(&ctx, &users(), &doc, &fields(json!({"name": "Alice"})), &opts).unwrap();
        let stored = Block::unmarshal(&result.blocks[0].1).unwrap();
        assert!(stored.is_encrypted());
        assert_ne!(stored.delta.data(), Some(br#""Alice""#.as_slice()));
        assert_eq!(writer.read(&ctx, &users(), &doc).unwrap().fields["name"], json!("Alice"));
    }
}
