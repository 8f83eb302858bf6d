//! Counter CRDT (P-Counter and PN-Counter) backed by the datastore.
//!
//! Every delta carries an increment encoded as a CBOR number; merging adds it
//! to the stored total. Addition commutes, so replicas converge regardless of
//! delivery order. Merge does not deduplicate: a re-delivered block is
//! filtered out by content addressing before it reaches the counter.
//!
//! The stored priority is the highest priority merged so far.
//! Integer totals wrap on overflow. Float totals follow IEEE-754 addition.

use crate::context::Context;
use crate::crdt::{get_priority, mismatched, set_priority, value_key, ReplicatedData};
use crate::delta::{CounterDelta, Delta};
use crate::error::{CoreError, Result};
use crate::keys::{DataStoreKey, HeadStoreKey};
use crate::store::ReaderWriter;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Numeric kind of a counter field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterKind {
    Int,
    Float,
}

/// A decoded counter value or increment.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum CounterValue {
    Int(i64),
    Float(f64),
}

impl CounterValue {
    pub fn kind(&self) -> CounterKind {
        match self {
            CounterValue::Int(_) => CounterKind::Int,
            CounterValue::Float(_) => CounterKind::Float,
        }
    }

    pub fn is_negative(&self) -> bool {
        match *self {
            CounterValue::Int(v) => v < 0,
            CounterValue::Float(v) => v < 0.0,
        }
    }

    /// Encode as a CBOR number.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let res = match *self {
            CounterValue::Int(v) => ciborium::ser::into_writer(&v, &mut buf),
            CounterValue::Float(v) => ciborium::ser::into_writer(&v, &mut buf),
        };
        res.map_err(|e| CoreError::InvalidCounterValue(e.to_string()))?;
        Ok(buf)
    }

    /// Decode a CBOR number of the given kind.
    pub fn from_bytes(kind: CounterKind, bytes: &[u8]) -> Result<Self> {
        let invalid = |e: ciborium::de::Error<std::io::Error>| CoreError::InvalidCounterValue(e.to_string());
        match kind {
            CounterKind::Int => ciborium::de::from_reader::<i64, _>(bytes)
                .map(CounterValue::Int)
                .map_err(invalid),
            CounterKind::Float => ciborium::de::from_reader::<f64, _>(bytes)
                .map(CounterValue::Float)
                .map_err(invalid),
        }
    }

    fn add(self, other: CounterValue) -> Result<CounterValue> {
        match (self, other) {
            (CounterValue::Int(a), CounterValue::Int(b)) => Ok(CounterValue::Int(a.wrapping_add(b))),
            (CounterValue::Float(a), CounterValue::Float(b)) => Ok(CounterValue::Float(a + b)),
            (a, b) => Err(CoreError::InvalidCounterValue(format!(
                "cannot add {:?} to {:?}",
                b.kind(),
                a.kind()
            ))),
        }
    }

    fn zero(kind: CounterKind) -> CounterValue {
        match kind {
            CounterKind::Int => CounterValue::Int(0),
            CounterKind::Float => CounterValue::Float(0.0),
        }
    }
}

impl std::fmt::Display for CounterValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CounterValue::Int(v) => write!(f, "{v}"),
            CounterValue::Float(v) => write!(f, "{v}"),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Counter<S> {
    store: S,
    key: DataStoreKey,
    schema_version_id: String,
    field_name: String,
    allow_decrement: bool,
    kind: CounterKind,
}

impl<S: ReaderWriter> Counter<S> {
    pub fn new(
        store: S,
        schema_version_id: impl Into<String>,
        key: DataStoreKey,
        field_name: impl Into<String>,
        allow_decrement: bool,
        kind: CounterKind,
    ) -> Self {
        Self {
            store,
            key,
            schema_version_id: schema_version_id.into(),
            field_name: field_name.into(),
            allow_decrement,
            kind,
        }
    }

    pub fn kind(&self) -> CounterKind {
        self.kind
    }

    pub fn allows_decrement(&self) -> bool {
        self.allow_decrement
    }

    /// Build the delta for adding `increment`.
    ///
    /// The nonce is zero while the document does not exist yet, so the first
    /// block of a document is reproducible. Later increments get a random
    /// nonce so identical increments still produce distinct blocks.
    pub fn delta(&self, increment: CounterValue) -> Result<CounterDelta> {
        let exists = self.store.has(&self.key.to_primary_key().bytes())?;
        let nonce = if exists {
            rand::thread_rng().gen_range(0..i64::MAX)
        } else {
            0
        };
        Ok(CounterDelta {
            doc_id: self.key.doc_id.clone().into_bytes(),
            field_name: self.field_name.clone(),
            priority: 0,
            nonce,
            schema_version_id: self.schema_version_id.clone(),
            data: increment.to_bytes()?,
        })
    }

    /// Current total, zero if never incremented.
    pub fn value(&self) -> Result<CounterValue> {
        let key = value_key(&self.store, &self.key)?;
        self.current(&key)
    }

    fn current(&self, key: &DataStoreKey) -> Result<CounterValue> {
        match self.store.get(&key.bytes()) {
            Ok(bytes) => CounterValue::from_bytes(self.kind, &bytes),
            Err(err) if err.is_not_found() => Ok(CounterValue::zero(self.kind)),
            Err(err) => Err(err),
        }
    }

    fn increment(&self, data: &[u8], priority: u64) -> Result<()> {
        let increment = CounterValue::from_bytes(self.kind, data)?;
        if !self.allow_decrement && increment.is_negative() {
            return Err(CoreError::NegativeValue(increment.to_string()));
        }

        let key = value_key(&self.store, &self.key)?;
        let total = self.current(&key)?.add(increment)?;
        self.store
            .set(&key.bytes(), &total.to_bytes()?)
            .map_err(|e| CoreError::FailedToStoreValue(e.to_string()))?;
        let current = get_priority(&self.store, &self.key)?;
        set_priority(&self.store, &self.key, priority.max(current))
    }
}

impl<S: ReaderWriter> ReplicatedData for Counter<S> {
    fn merge(&self, ctx: &Context, delta: &Delta) -> Result<()> {
        ctx.check()?;
        match delta {
            Delta::Counter(d) => self.increment(&d.data, d.priority),
            other => Err(mismatched("counter", other)),
        }
    }

    fn headstore_prefix(&self) -> HeadStoreKey {
        self.key.to_headstore_key()
    }
}
