//! The `ReplicatedData` trait and helpers shared by the store-backed CRDTs.
//!
//! A replicated data type owns no state of its own: it is a view over the
//! datastore at one [`DataStoreKey`]. Merging a delta updates that stored
//! projection. Every merge must be commutative, associative and idempotent
//! with respect to the order deltas are applied in.

use crate::context::Context;
use crate::delta::Delta;
use crate::encoding::{decode_uvarint, encode_uvarint};
use crate::error::{CoreError, Result};
use crate::keys::{DataStoreKey, HeadStoreKey, DELETED_OBJECT_MARKER};
use crate::store::{Reader, Writer};

/// A CRDT whose state lives in the datastore.
pub trait ReplicatedData {
    /// Fold a delta into the stored projection.
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()>;

    /// Headstore namespace holding the DAG tips of this CRDT.
    fn headstore_prefix(&self) -> HeadStoreKey;
}

impl<T: ReplicatedData + ?Sized> ReplicatedData for &T {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        (**self).merge(ctx, delta)
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        (**self).headstore_prefix()
    }
}

impl<T: ReplicatedData + ?Sized> ReplicatedData for Box<T> {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        (**self).merge(ctx, delta)
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        (**self).headstore_prefix()
    }
}

/// Read the priority stored for `key`. A key that was never merged has priority 0.
pub fn get_priority<S: Reader>(store: &S, key: &DataStoreKey) -> Result<u64> {
    match store.get(&key.with_priority_flag().bytes()) {
        Ok(bytes) => decode_uvarint(&bytes),
        Err(err) if err.is_not_found() => Ok(0),
        Err(err) => Err(err),
    }
}

pub fn set_priority<S: Writer>(store: &S, key: &DataStoreKey, priority: u64) -> Result<()> {
    store.set(&key.with_priority_flag().bytes(), &encode_uvarint(priority))
}

/// Whether the document owning `key` carries the deleted marker.
pub fn is_deleted<S: Reader>(store: &S, key: &DataStoreKey) -> Result<bool> {
    match store.get(&key.to_primary_key().bytes()) {
        Ok(marker) => Ok(marker == [DELETED_OBJECT_MARKER]),
        Err(err) if err.is_not_found() => Ok(false),
        Err(err) => Err(err),
    }
}

/// The key a merge should write the value of `key` to: the value instance
/// for a live document, the deleted instance once it is deleted.
pub fn value_key<S: Reader>(store: &S, key: &DataStoreKey) -> Result<DataStoreKey> {
    if is_deleted(store, key)? {
        Ok(key.with_deleted_flag())
    } else {
        Ok(key.with_value_flag())
    }
}

pub(crate) fn mismatched(expected: &'static str, delta: &Delta) -> CoreError {
    CoreError::MismatchedMergeType {
        expected,
        actual: delta.tag(),
    }
}

/// Collection-level CRDT.
///
/// Collection, collection-definition, collection-set and field-definition
/// deltas only exist to give schema changes a place in the DAG. Schema
/// mutation assumes a single writer, so merging them stores nothing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Collection {
    root_id: u32,
}

impl Collection {
    pub fn new(root_id: u32) -> Self {
        Self { root_id }
    }

    pub fn root_id(&self) -> u32 {
        self.root_id
    }
}

impl ReplicatedData for Collection {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        ctx.check()?;
        if !delta.is_collection() {
            return Err(mismatched("collection", delta));
        }
        Ok(())
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        HeadStoreKey::collection(self.root_id)
    }
}
