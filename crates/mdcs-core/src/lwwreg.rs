//! Last-Write-Wins (LWW) Register CRDT
//!
//! The register keeps the payload of the delta with the highest priority it
//! has seen. Priority is the block height in the field's DAG, so a write that
//! causally follows another always wins. Concurrent writes at the same height
//! are broken by comparing payloads byte-wise: the greater payload wins on
//! every replica regardless of arrival order.

use crate::context::Context;
use crate::crdt::{get_priority, mismatched, set_priority, value_key, ReplicatedData};
use crate::delta::{Delta, LWWRegDelta};
use crate::error::{CoreError, Result};
use crate::keys::{DataStoreKey, HeadStoreKey};
use crate::store::ReaderWriter;

/// A Last-Write-Wins Register backed by the datastore.
#[derive(Clone, Debug)]
pub struct LWWRegister<S> {
    store: S,
    key: DataStoreKey,
    schema_version_id: String,
    field_name: String,
}

impl<S: ReaderWriter> LWWRegister<S> {
    /// `key` must address the field (doc id and field id set).
    pub fn new(
        store: S,
        schema_version_id: impl Into<String>,
        key: DataStoreKey,
        field_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            key,
            schema_version_id: schema_version_id.into(),
            field_name: field_name.into(),
        }
    }

    pub fn key(&self) -> &DataStoreKey {
        &self.key
    }

    /// Build the delta for setting this register to `data`. Priority is
    /// assigned later by the clock.
    pub fn delta(&self, data: Vec<u8>) -> LWWRegDelta {
        LWWRegDelta {
            doc_id: self.key.doc_id.clone().into_bytes(),
            field_name: self.field_name.clone(),
            priority: 0,
            schema_version_id: self.schema_version_id.clone(),
            data,
        }
    }

    /// Current value, if any.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let key = value_key(&self.store, &self.key)?;
        match self.store.get(&key.bytes()) {
            Ok(value) => Ok(Some(value)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Current priority, 0 if never written.
    pub fn priority(&self) -> Result<u64> {
        get_priority(&self.store, &self.key)
    }

    fn set_value(&self, data: &[u8], priority: u64) -> Result<()> {
        let current = get_priority(&self.store, &self.key)?;
        if priority < current {
            return Ok(());
        }

        let key = value_key(&self.store, &self.key)?;
        if priority == current {
            let existing = match self.store.get(&key.bytes()) {
                Ok(value) => value,
                Err(err) if err.is_not_found() => Vec::new(),
                Err(err) => return Err(err),
            };
            if existing.as_slice() >= data {
                return Ok(());
            }
        }

        if data.is_empty() {
            self.store.delete(&key.bytes())?;
        } else {
            self.store
                .set(&key.bytes(), data)
                .map_err(|e| CoreError::FailedToStoreValue(e.to_string()))?;
        }
        set_priority(&self.store, &self.key, priority)
    }
}

impl<S: ReaderWriter> ReplicatedData for LWWRegister<S> {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        ctx.check()?;
        match delta {
            Delta::LWWRegister(d) => self.set_value(&d.data, d.priority),
            other => Err(mismatched("lww", other)),
        }
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        self.key.to_headstore_key()
    }
}
