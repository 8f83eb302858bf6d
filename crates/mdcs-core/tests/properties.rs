//! Property-based tests that MUST pass for every store-backed CRDT
//!
//! Replicas receive the same deltas in different orders; convergence means
//! their stored projections end up byte-identical:
//!  - Commutativity: any delivery order yields the same state
//!  - Idempotence:   merging a delta twice equals merging it once

use mdcs_core::keys::DataStoreKey;
use mdcs_core::store::KeyValue;
use mdcs_core::{
    CompositeDAG, Context, Counter, CounterKind, CounterValue, Delta, DocStatus, LWWRegister, MemoryRootStore,
    Reader, ReplicatedData,
};
use proptest::prelude::*;

fn snapshot(store: &MemoryRootStore) -> Vec<KeyValue> {
    store
        .iter_prefix(b"")
        .unwrap()
        .map(|kv| kv.unwrap())
        .collect()
}

fn field_key() -> DataStoreKey {
    DataStoreKey::new(1, "bae-doc").with_field_id("1")
}

fn lww_deltas() -> impl Strategy<Value = Vec<Delta>> {
    prop::collection::vec((prop::collection::vec(any::<u8>(), 1..6), 1u64..5), 1..12).prop_map(|writes| {
        let reg = LWWRegister::new(MemoryRootStore::new(), "v1", field_key(), "name");
        writes
            .into_iter()
            .map(|(data, priority)| {
                let mut delta = reg.delta(data);
                delta.priority = priority;
                delta.into()
            })
            .collect()
    })
}

fn counter_deltas() -> impl Strategy<Value = Vec<Delta>> {
    prop::collection::vec((-1000i64..1000, 1u64..5), 1..12).prop_map(|increments| {
        let counter = Counter::new(MemoryRootStore::new(), "v1", field_key(), "points", true, CounterKind::Int);
        increments
            .into_iter()
            .map(|(value, priority)| {
                let mut delta = counter.delta(CounterValue::Int(value)).unwrap();
                delta.priority = priority;
                delta.into()
            })
            .collect()
    })
}

fn composite_deltas() -> impl Strategy<Value = Vec<Delta>> {
    prop::collection::vec((any::<bool>(), 1u64..5, "v[0-9]"), 1..8).prop_map(|updates| {
        updates
            .into_iter()
            .map(|(deleted, priority, version)| {
                let doc = CompositeDAG::new(MemoryRootStore::new(), version, DataStoreKey::new(1, "bae-doc"));
                let status = if deleted { DocStatus::Deleted } else { DocStatus::Active };
                let mut delta = doc.delta(status);
                delta.priority = priority;
                delta.into()
            })
            .collect()
    })
}

fn apply_all<C: ReplicatedData>(crdt: &C, deltas: &[Delta]) {
    let ctx = Context::new();
    for delta in deltas {
        crdt.merge(&ctx, delta).unwrap();
    }
}

fn lww_state(deltas: &[Delta]) -> Vec<KeyValue> {
    let store = MemoryRootStore::new();
    apply_all(&LWWRegister::new(store.clone(), "v1", field_key(), "name"), deltas);
    snapshot(&store)
}

fn counter_state(deltas: &[Delta]) -> Vec<KeyValue> {
    let store = MemoryRootStore::new();
    apply_all(
        &Counter::new(store.clone(), "v1", field_key(), "points", true, CounterKind::Int),
        deltas,
    );
    snapshot(&store)
}

fn composite_state(deltas: &[Delta]) -> Vec<KeyValue> {
    let store = MemoryRootStore::new();
    apply_all(&CompositeDAG::new(store.clone(), "v1", DataStoreKey::new(1, "bae-doc")), deltas);
    snapshot(&store)
}

// ============================================================================
// LWWRegister Property Tests
// ============================================================================

proptest! {
    #[test]
    fn lwwreg_merge_is_commutative(
        (deltas, shuffled) in lww_deltas().prop_flat_map(|d| (Just(d.clone()), Just(d).prop_shuffle()))
    ) {
        prop_assert_eq!(lww_state(&deltas), lww_state(&shuffled));
    }

    #[test]
    fn lwwreg_merge_is_idempotent(deltas in lww_deltas()) {
        let twice: Vec<Delta> = deltas.iter().chain(deltas.iter()).cloned().collect();
        prop_assert_eq!(lww_state(&deltas), lww_state(&twice));
    }
}

// ============================================================================
// Counter Property Tests
// ============================================================================

proptest! {
    #[test]
    fn counter_merge_is_commutative(
        (deltas, shuffled) in counter_deltas().prop_flat_map(|d| (Just(d.clone()), Just(d).prop_shuffle()))
    ) {
        prop_assert_eq!(counter_state(&deltas), counter_state(&shuffled));
    }

    #[test]
    fn counter_total_is_sum_of_increments(values in prop::collection::vec(-1000i64..1000, 0..20)) {
        let store = MemoryRootStore::new();
        let counter = Counter::new(store.clone(), "v1", field_key(), "points", true, CounterKind::Int);
        let ctx = Context::new();
        for v in &values {
            let mut delta = counter.delta(CounterValue::Int(*v)).unwrap();
            delta.priority = 1;
            counter.merge(&ctx, &delta.into()).unwrap();
        }
        prop_assert_eq!(counter.value().unwrap(), CounterValue::Int(values.iter().sum()));
    }
}

// ============================================================================
// CompositeDAG Property Tests
// ============================================================================

proptest! {
    #[test]
    fn composite_merge_is_commutative(
        (deltas, shuffled) in composite_deltas().prop_flat_map(|d| (Just(d.clone()), Just(d).prop_shuffle()))
    ) {
        prop_assert_eq!(composite_state(&deltas), composite_state(&shuffled));
    }

    #[test]
    fn composite_merge_is_idempotent(deltas in composite_deltas()) {
        let twice: Vec<Delta> = deltas.iter().chain(deltas.iter()).cloned().collect();
        prop_assert_eq!(composite_state(&deltas), composite_state(&twice));
    }
}
