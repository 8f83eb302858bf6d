//! Merkle CRDTs: a store-backed CRDT paired with the clock that commits its
//! deltas.

use crate::description::{CType, CollectionDescription, FieldDescription};
use crate::error::{DbError, Result};
use mdcs_core::keys::{DataStoreKey, HeadStoreKey};
use mdcs_core::{
    Context, Counter, CounterKind, CounterValue, Delta, LWWRegister, ReaderWriter, ReplicatedData,
    Result as CoreResult,
};
use mdcs_merkle::{Cid, CommitOptions, DAGLink, MerkleClock};
use serde_json::Value;

/// The CRDT behind one document field.
#[derive(Clone, Debug)]
pub enum FieldCrdt<S> {
    Lww(LWWRegister<S>),
    Counter(Counter<S>),
}

/// Build the CRDT for `field` of document `doc_id`.
pub fn field_level_crdt<S: ReaderWriter>(
    store: S,
    collection: &CollectionDescription,
    doc_id: &str,
    field: &FieldDescription,
) -> FieldCrdt<S> {
    let key = DataStoreKey::new(collection.root_id, doc_id).with_field_id(field.id.clone());
    let schema_version_id = collection.schema_version_id.as_str();
    match field.ctype {
        CType::LwwRegister => FieldCrdt::Lww(LWWRegister::new(store, schema_version_id, key, field.name.clone())),
        CType::PCounter(kind) => FieldCrdt::Counter(Counter::new(
            store,
            schema_version_id,
            key,
            field.name.clone(),
            false,
            kind,
        )),
        CType::PnCounter(kind) => FieldCrdt::Counter(Counter::new(
            store,
            schema_version_id,
            key,
            field.name.clone(),
            true,
            kind,
        )),
    }
}

fn invalid(field: &str, reason: impl Into<String>) -> DbError {
    DbError::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

impl<S: ReaderWriter> FieldCrdt<S> {
    /// Delta that moves the field towards `value`.
    ///
    /// A register stores the JSON encoding of the value, with `null` clearing
    /// it. A counter treats the value as an increment.
    pub fn delta_for(&self, field: &str, value: &Value) -> Result<Delta> {
        match self {
            FieldCrdt::Lww(reg) => {
                let data = match value {
                    Value::Null => Vec::new(),
                    other => serde_json::to_vec(other)?,
                };
                Ok(reg.delta(data).into())
            }
            FieldCrdt::Counter(counter) => {
                let increment = match counter.kind() {
                    CounterKind::Int => value.as_i64().map(CounterValue::Int),
                    CounterKind::Float => value.as_f64().map(CounterValue::Float),
                }
                .ok_or_else(|| invalid(field, format!("expected a {:?} increment", counter.kind())))?;
                if increment.is_negative() && !counter.allows_decrement() {
                    return Err(invalid(field, "negative increment on an increment-only counter"));
                }
                Ok(counter.delta(increment)?.into())
            }
        }
    }

    /// Current value as JSON; `null` when unset.
    pub fn value(&self) -> Result<Value> {
        match self {
            FieldCrdt::Lww(reg) => match reg.value()? {
                Some(bytes) if !bytes.is_empty() => Ok(serde_json::from_slice(&bytes)?),
                _ => Ok(Value::Null),
            },
            FieldCrdt::Counter(counter) => Ok(match counter.value()? {
                CounterValue::Int(v) => Value::from(v),
                CounterValue::Float(v) => Value::from(v),
            }),
        }
    }
}

impl<S: ReaderWriter> ReplicatedData for FieldCrdt<S> {
    fn merge(&self, ctx: &Context, delta: &Delta) -> CoreResult<()> {
        match self {
            FieldCrdt::Lww(reg) => reg.merge(ctx, delta),
            FieldCrdt::Counter(counter) => counter.merge(ctx, delta),
        }
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        match self {
            FieldCrdt::Lww(reg) => reg.headstore_prefix(),
            FieldCrdt::Counter(counter) => counter.headstore_prefix(),
        }
    }
}

/// A CRDT bound to the clock that commits its deltas.
pub struct MerkleCrdt<'c, S, C> {
    clock: &'c MerkleClock<S>,
    crdt: C,
}

impl<'c, S, C> MerkleCrdt<'c, S, C>
where
    S: ReaderWriter + Clone,
    C: ReplicatedData,
{
    pub fn new(clock: &'c MerkleClock<S>, crdt: C) -> Self {
        Self { clock, crdt }
    }

    pub fn clock(&self) -> &MerkleClock<S> {
        self.clock
    }

    pub fn crdt(&self) -> &C {
        &self.crdt
    }

    /// Commit `delta` with `links` and merge it locally.
    pub fn save(
        &self,
        ctx: &Context,
        delta: impl Into<Delta>,
        links: Vec<DAGLink>,
        options: &CommitOptions,
    ) -> Result<(Cid, Vec<u8>)> {
        Ok(self.clock.add_delta(ctx, &self.crdt, delta, links, options)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mdcs_core::MemoryRootStore;
    use mdcs_merkle::ClockConfig;
    use serde_json::json;

    fn users() -> CollectionDescription {
        CollectionDescription::new(1, "Users", "schema-v1")
            .with_field("1", "name", CType::LwwRegister)
            .with_field("2", "points", CType::PCounter(CounterKind::Int))
            .with_field("3", "balance", CType::PnCounter(CounterKind::Float))
    }

    fn crdt(store: &MemoryRootStore, field: &str) -> FieldCrdt<MemoryRootStore> {
        let col = users();
        let desc = col.field(field).unwrap().clone();
        field_level_crdt(store.clone(), &col, "bae-1", &desc)
    }

    #[test]
    fn test_factory_picks_crdt() {
        let store = MemoryRootStore::new();
        assert!(matches!(crdt(&store, "name"), FieldCrdt::Lww(_)));
        match crdt(&store, "points") {
            FieldCrdt::Counter(c) => assert!(!c.allows_decrement()),
            _ => panic!("expected a counter"),
        }
        match crdt(&store, "balance") {
            FieldCrdt::Counter(c) => {
                assert!(c.allows_decrement());
                assert_eq!(c.kind(), CounterKind::Float);
            }
            _ => panic!("expected a counter"),
        }
    }

    #[test]
    fn test_save_through_clock() {
        let store = MemoryRootStore::new();
        let clock = MerkleClock::new(store.clone(), store.clone(), store.clone(), ClockConfig::default());
        let ctx = Context::new();

        let name = MerkleCrdt::new(&clock, crdt(&store, "name"));
        let delta = name.crdt().delta_for("name", &json!("Alice")).unwrap();
        name.save(&ctx, delta, vec![], &CommitOptions::default()).unwrap();
        assert_eq!(name.crdt().value().unwrap(), json!("Alice"));

        let points = MerkleCrdt::new(&clock, crdt(&store, "points"));
        for inc in [3, 4] {
            let delta = points.crdt().delta_for("points", &json!(inc)).unwrap();
            points.save(&ctx, delta, vec![], &CommitOptions::default()).unwrap();
        }
        assert_eq!(points.crdt().value().unwrap(), json!(7));
    }

    #[test]
    fn test_invalid_increments() {
        let store = MemoryRootStore::new();
        let points = crdt(&store, "points");
        assert!(matches!(
            points.delta_for("points", &json!(-1)),
            Err(DbError::InvalidFieldValue { .. })
        ));
        assert!(matches!(
            points.delta_for("points", &json!("many")),
            Err(DbError::InvalidFieldValue { .. })
        ));
        assert!(crdt(&store, "balance").delta_for("balance", &json!(-2.5)).is_ok());
    }

    #[test]
    fn test_null_clears_register() {
        let store = MemoryRootStore::new();
        let name = crdt(&store, "name");
        match name.delta_for("name", &Value::Null).unwrap() {
            Delta::LWWRegister(d) => assert!(d.data.is_empty()),
            other => panic!("unexpected delta {other:?}"),
        }
        assert_eq!(name.value().unwrap(), Value::Null);
    }
}
