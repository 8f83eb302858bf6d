//! Document-level CRDT tracking the lifecycle of a document.
//!
//! Deletion is absorbing: once any replica merges a `Deleted` composite delta
//! the document stays deleted, and a later `Active` delta synced from a peer
//! never resurrects it. The schema version recorded for the document follows
//! the LWW rule on the composite priority.

use crate::context::Context;
use crate::crdt::{get_priority, is_deleted, mismatched, set_priority, ReplicatedData};
use crate::delta::{CompositeDAGDelta, Delta, DocStatus};
use crate::error::Result;
use crate::keys::{
    DataStoreKey, HeadStoreKey, COMPOSITE_NAMESPACE, DELETED_OBJECT_MARKER, DOC_VERSION_FIELD_ID, OBJECT_MARKER,
};
use crate::store::ReaderWriter;

#[derive(Clone, Debug)]
pub struct CompositeDAG<S> {
    store: S,
    /// Primary document key (no field id).
    key: DataStoreKey,
    schema_version_id: String,
}

impl<S: ReaderWriter> CompositeDAG<S> {
    pub fn new(store: S, schema_version_id: impl Into<String>, key: DataStoreKey) -> Self {
        Self {
            store,
            key: key.to_primary_key(),
            schema_version_id: schema_version_id.into(),
        }
    }

    pub fn delta(&self, status: DocStatus) -> CompositeDAGDelta {
        CompositeDAGDelta {
            doc_id: self.key.doc_id.clone().into_bytes(),
            field_name: String::new(),
            priority: 0,
            schema_version_id: self.schema_version_id.clone(),
            status,
        }
    }

    /// Status of the stored document, `None` if it was never written.
    pub fn status(&self) -> Result<Option<DocStatus>> {
        match self.store.get(&self.key.bytes()) {
            Ok(marker) if marker == [DELETED_OBJECT_MARKER] => Ok(Some(DocStatus::Deleted)),
            Ok(_) => Ok(Some(DocStatus::Active)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn composite_key(&self) -> DataStoreKey {
        self.key.with_field_id(COMPOSITE_NAMESPACE)
    }

    fn mark_deleted(&self, ctx: &Context) -> Result<()> {
        self.store.set(&self.key.bytes(), &[DELETED_OBJECT_MARKER])?;

        let prefix = format!("{}/", self.key.with_value_flag());
        let live: Vec<(Vec<u8>, Vec<u8>)> = self
            .store
            .iter_prefix(prefix.as_bytes())?
            .collect::<Result<_>>()?;
        for (raw, value) in live {
            ctx.check()?;
            let key = DataStoreKey::parse(&String::from_utf8_lossy(&raw))?;
            self.store.set(&key.with_deleted_flag().bytes(), &value)?;
            self.store.delete(&raw)?;
        }
        Ok(())
    }

    fn record_version(&self, d: &CompositeDAGDelta) -> Result<()> {
        let composite = self.composite_key();
        let current = get_priority(&self.store, &composite)?;
        if d.priority < current {
            return Ok(());
        }

        let version_key = self.key.with_field_id(DOC_VERSION_FIELD_ID);
        let version_key = if is_deleted(&self.store, &self.key)? {
            version_key.with_deleted_flag()
        } else {
            version_key.with_value_flag()
        };
        if d.priority == current {
            if let Ok(existing) = self.store.get(&version_key.bytes()) {
                if existing.as_slice() >= d.schema_version_id.as_bytes() {
                    return Ok(());
                }
            }
        }
        self.store
            .set(&version_key.bytes(), d.schema_version_id.as_bytes())?;
        set_priority(&self.store, &composite, d.priority)
    }
}

impl<S: ReaderWriter> ReplicatedData for CompositeDAG<S> {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        ctx.check()?;
        let d = match delta {
            Delta::Composite(d) => d,
            other => return Err(mismatched("composite", other)),
        };

        match d.status {
            DocStatus::Deleted => self.mark_deleted(ctx)?,
            DocStatus::Active => {
                if !self.store.has(&self.key.bytes())? {
                    self.store.set(&self.key.bytes(), &[OBJECT_MARKER])?;
                }
            }
        }
        self.record_version(d)
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        self.composite_key().to_headstore_key()
    }
}
