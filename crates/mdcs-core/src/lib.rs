//! # mdcs-core
//!
//! Building blocks shared by every layer of the Merkle-CRDT replication core:
//!
//! - [`context`] - cancellation handle threaded through every store access
//! - [`store`] - the narrow key-value contract plus an in-memory transactional store
//! - [`keys`] - structured datastore, headstore and encryption-store keys
//! - [`delta`] - the closed set of delta variants carried by DAG blocks
//! - [`crdt`] - the `ReplicatedData` trait shared by every CRDT
//! - [`lwwreg`], [`counter`], [`composite`] - the store-backed CRDTs

pub mod composite;
pub mod context;
pub mod counter;
pub mod crdt;
pub mod delta;
pub mod encoding;
pub mod error;
pub mod keys;
pub mod lwwreg;
pub mod store;

pub use composite::CompositeDAG;
pub use context::Context;
pub use counter::{Counter, CounterKind, CounterValue};
pub use crdt::{Collection, ReplicatedData};
pub use delta::{
    CollectionDefinitionDelta, CollectionDelta, CollectionSetDelta, CompositeDAGDelta, CounterDelta, Delta,
    DocStatus, FieldDefinitionDelta, LWWRegDelta,
};
pub use error::{CoreError, Result};
pub use lwwreg::LWWRegister;
pub use store::{MemoryRootStore, Namespaced, Reader, ReaderWriter, Txn, Writer};
