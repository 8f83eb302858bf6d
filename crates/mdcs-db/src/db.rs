//! The replica-level entry point.
//!
//! A [`Database`] owns one root store. Every operation runs in its own
//! transaction: writes commit together or not at all, and a conflicting
//! concurrent commit surfaces as `TxnConflict` for the caller to retry.

use crate::description::CollectionDescription;
use crate::document::{CommitResult, Document, DocumentId, DocumentWriter};
use crate::error::{DbError, Result};
use crate::kms::{KeyRequestEvent, PeerId, RetrievedKey};
use crate::merge::{BlockSource, MergeOutcome, MergeProcessor, PendingBlock};
use crate::versioned::{HistoricalDocument, VersionedFetcher};
use mdcs_core::keys::{EncStoreDocKey, HeadStoreKey, COMPOSITE_NAMESPACE};
use mdcs_core::store::{BLOCKSTORE_PREFIX, ENCSTORE_PREFIX};
use mdcs_core::{
    Collection, CollectionDefinitionDelta, Context, FieldDefinitionDelta, MemoryRootStore, Namespaced, Txn,
};
use mdcs_merkle::{BlockStore, Cid, ClockConfig, CommitOptions, DocEncryptor, HeadSet, MerkleClock};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

/// Configuration of a [`Database`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub peer_id: PeerId,
    #[serde(default)]
    pub clock: ClockConfig,
}

impl DatabaseConfig {
    pub fn new(peer_id: impl Into<String>) -> Self {
        Self {
            peer_id: PeerId::new(peer_id),
            clock: ClockConfig::default(),
        }
    }

    pub fn strict_head_updates(mut self, strict: bool) -> Self {
        self.clock.strict_head_updates = strict;
        self
    }
}

/// Outcome of a remote merge, plus the key request issued for its pending blocks.
#[derive(Debug)]
pub struct MergeResult {
    pub outcome: MergeOutcome,
    pub keys: Option<oneshot::Receiver<Result<Vec<RetrievedKey>>>>,
}

pub struct Database {
    config: DatabaseConfig,
    root: MemoryRootStore,
    collections: RwLock<BTreeMap<String, CollectionDescription>>,
    /// Deferred encrypted blocks per collection.
    pending: Mutex<BTreeMap<String, BTreeSet<PendingBlock>>>,
    /// Held while deferred blocks are replayed so no block is merged twice.
    replay: Mutex<()>,
    key_requests: Option<mpsc::UnboundedSender<KeyRequestEvent>>,
}

impl Database {
    pub fn new(config: DatabaseConfig) -> Self {
        Self {
            config,
            root: MemoryRootStore::new(),
            collections: RwLock::new(BTreeMap::new()),
            pending: Mutex::new(BTreeMap::new()),
            replay: Mutex::new(()),
            key_requests: None,
        }
    }

    /// Send key requests for undecryptable blocks to a key service.
    pub fn with_key_requests(mut self, sender: mpsc::UnboundedSender<KeyRequestEvent>) -> Self {
        self.key_requests = Some(sender);
        self
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.config.peer_id
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Committed encryption store, for a key service serving this replica.
    pub fn encstore(&self) -> Namespaced<MemoryRootStore> {
        Namespaced::new(self.root.clone(), ENCSTORE_PREFIX)
    }

    /// Committed blocks, for peers pulling from this replica.
    pub fn block_source(&self) -> BlockStore<Namespaced<MemoryRootStore>> {
        BlockStore::new(Namespaced::new(self.root.clone(), BLOCKSTORE_PREFIX))
    }

    pub fn collection(&self, name: &str) -> Result<CollectionDescription> {
        self.collections
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::CollectionNotFound(name.to_string()))
    }

    /// Register `description` and record its definition in the collection DAG.
    pub fn define_collection(&self, ctx: &Context, description: CollectionDescription) -> Result<Vec<(Cid, Vec<u8>)>> {
        let blocks = self.in_txn(|txn| {
            let clock = self.clock(txn);
            let crdt = Collection::new(description.root_id);
            let collection_id = description.root_id.to_string();
            let options = CommitOptions::default();

            let mut blocks = Vec::with_capacity(description.fields.len() + 1);
            let definition = CollectionDefinitionDelta {
                priority: 0,
                collection_id: collection_id.clone(),
                definition: serde_json::to_string(&description)?,
            };
            blocks.push(clock.add_delta(ctx, &crdt, definition, vec![], &options)?);
            for field in &description.fields {
                let delta = FieldDefinitionDelta {
                    priority: 0,
                    collection_id: collection_id.clone(),
                    field_name: field.name.clone(),
                    definition: serde_json::to_string(field)?,
                };
                blocks.push(clock.add_delta(ctx, &crdt, delta, vec![], &options)?);
            }
            Ok(blocks)
        })?;

        info!(collection = %description.name, root_id = description.root_id, "defined collection");
        self.collections.write().insert(description.name.clone(), description);
        Ok(blocks)
    }

    pub fn create_document(
        &self,
        ctx: &Context,
        collection: &str,
        fields: &Map<String, Value>,
        options: &CommitOptions,
    ) -> Result<CommitResult> {
        let description = self.collection(collection)?;
        let doc_id = DocumentId::new();
        self.in_txn(|txn| self.writer(txn).save(ctx, &description, &doc_id, fields, options))
    }

    pub fn update_document(
        &self,
        ctx: &Context,
        collection: &str,
        doc_id: &DocumentId,
        fields: &Map<String, Value>,
        options: &CommitOptions,
    ) -> Result<CommitResult> {
        let description = self.collection(collection)?;
        self.in_txn(|txn| {
            let writer = self.writer(txn);
            if writer.composite(&description, doc_id).status()?.is_none() {
                return Err(DbError::DocumentNotFound(doc_id.to_string()));
            }
            writer.save(ctx, &description, doc_id, fields, options)
        })
    }

    pub fn delete_document(
        &self,
        ctx: &Context,
        collection: &str,
        doc_id: &DocumentId,
        options: &CommitOptions,
    ) -> Result<CommitResult> {
        let description = self.collection(collection)?;
        self.in_txn(|txn| self.writer(txn).delete(ctx, &description, doc_id, options))
    }

    pub fn read_document(&self, ctx: &Context, collection: &str, doc_id: &DocumentId) -> Result<Document> {
        let description = self.collection(collection)?;
        self.read_only(|txn| self.writer(txn).read(ctx, &description, doc_id))
    }

    /// Current composite heads of a document and their maximum height.
    pub fn document_heads(&self, ctx: &Context, doc_id: &DocumentId) -> Result<(Vec<Cid>, u64)> {
        self.read_only(|txn| {
            let heads = HeadSet::new(txn.headstore(), HeadStoreKey::doc(doc_id.as_str(), COMPOSITE_NAMESPACE));
            Ok(heads.list(ctx)?)
        })
    }

    /// Apply a DAG received from a peer.
    ///
    /// Blocks that cannot be decrypted are remembered and, when a key service
    /// is attached, their keys are requested; pass [`MergeResult::keys`] to
    /// [`Database::resolve_pending`] to finish.
    pub fn execute_merge<B: BlockSource + ?Sized>(
        &self,
        ctx: &Context,
        collection: &str,
        head: Cid,
        source: &B,
    ) -> Result<MergeResult> {
        let description = self.collection(collection)?;
        let outcome = self.in_txn(|txn| self.merger(txn).execute_merge(ctx, &description, head, source))?;
        if outcome.pending.is_empty() {
            return Ok(MergeResult { outcome, keys: None });
        }

        self.pending
            .lock()
            .entry(description.name.clone())
            .or_default()
            .extend(outcome.pending.iter().cloned());
        let keys = self.request_keys(&outcome.pending);
        Ok(MergeResult { outcome, keys })
    }

    fn request_keys(&self, pending: &[PendingBlock]) -> Option<oneshot::Receiver<Result<Vec<RetrievedKey>>>> {
        let sender = self.key_requests.as_ref()?;
        let keys: BTreeSet<EncStoreDocKey> = pending.iter().flat_map(PendingBlock::key_targets).collect();
        let (resp, rx) = oneshot::channel();
        let event = KeyRequestEvent {
            keys: keys.into_iter().collect(),
            resp,
        };
        if sender.send(event).is_err() {
            warn!(peer = %self.config.peer_id, "key service is not running");
            return None;
        }
        Some(rx)
    }

    /// Replay deferred blocks of `collection` whose keys are now held.
    ///
    /// Returns how many blocks were merged.
    pub fn merge_encrypted_blocks(&self, ctx: &Context, collection: &str) -> Result<usize> {
        let description = self.collection(collection)?;
        let _replay = self.replay.lock();
        let pending = self.pending_blocks(&description.name);
        if pending.is_empty() {
            return Ok(0);
        }

        let still = self.in_txn(|txn| self.merger(txn).merge_encrypted_blocks(ctx, &description, pending.clone()))?;
        let merged = self.settle_pending(&description.name, &pending, &still);
        debug!(collection = %description.name, merged, "merged encrypted blocks");
        Ok(merged)
    }

    /// Drop the blocks of `processed` that are not in `still` from the
    /// pending set. Blocks recorded since `processed` was taken are kept.
    fn settle_pending(&self, collection: &str, processed: &[PendingBlock], still: &[PendingBlock]) -> usize {
        let still: BTreeSet<&PendingBlock> = still.iter().collect();
        let merged: BTreeSet<&PendingBlock> = processed.iter().filter(|block| !still.contains(block)).collect();
        if let Some(set) = self.pending.lock().get_mut(collection) {
            set.retain(|block| !merged.contains(block));
        }
        merged.len()
    }

    /// Wait for a key request to complete, then replay what it unlocked.
    pub async fn resolve_pending(
        &self,
        ctx: &Context,
        collection: &str,
        keys: oneshot::Receiver<Result<Vec<RetrievedKey>>>,
    ) -> Result<usize> {
        let retrieved = keys.await.map_err(|_| DbError::ChannelClosed)??;
        if retrieved.is_empty() {
            return Ok(0);
        }
        self.merge_encrypted_blocks(ctx, collection)
    }

    /// Encrypted blocks still waiting for a key.
    pub fn pending_blocks(&self, collection: &str) -> Vec<PendingBlock> {
        self.pending
            .lock()
            .get(collection)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Read a document as of its composite block `cid`.
    pub fn fetch_version(&self, ctx: &Context, collection: &str, cid: Cid) -> Result<HistoricalDocument> {
        let description = self.collection(collection)?;
        self.read_only(|txn| {
            let blocks = BlockStore::new(txn.blockstore());
            let encryptor = DocEncryptor::new(txn.encstore());
            VersionedFetcher::new(&blocks, &encryptor, &description).fetch(ctx, cid)
        })
    }

    fn clock(&self, txn: &Txn) -> MerkleClock<Namespaced<Txn>> {
        MerkleClock::new(txn.headstore(), txn.blockstore(), txn.encstore(), self.config.clock.clone())
    }

    fn writer(&self, txn: &Txn) -> DocumentWriter<Namespaced<Txn>> {
        DocumentWriter::for_txn(txn, self.config.clock.clone())
    }

    fn merger(&self, txn: &Txn) -> MergeProcessor<Namespaced<Txn>> {
        MergeProcessor::for_txn(txn, self.config.clock.clone())
    }

    /// Run `f` in a transaction, committing on success and discarding on error.
    fn in_txn<T>(&self, f: impl FnOnce(&Txn) -> Result<T>) -> Result<T> {
        let txn = self.root.new_txn();
        match f(&txn) {
            Ok(value) => {
                txn.commit()?;
                Ok(value)
            }
            Err(err) => {
                txn.discard();
                Err(err)
            }
        }
    }

    fn read_only<T>(&self, f: impl FnOnce(&Txn) -> Result<T>) -> Result<T> {
        let txn = self.root.new_txn();
        let result = f(&txn);
        txn.discard();
        result
    }
}
