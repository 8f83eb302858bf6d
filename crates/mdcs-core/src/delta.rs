//! The closed set of delta variants carried by DAG blocks.
//!
//! Every variant carries a priority: the logical height of the block in its
//! DAG position (1 for a genesis block, `max(parent priorities) + 1`
//! otherwise). Priority is not a wall-clock time.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a document, carried by composite deltas.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum DocStatus {
    #[default]
    Active = 1,
    Deleted = 2,
}

impl DocStatus {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(DocStatus::Active),
            2 => Ok(DocStatus::Deleted),
            other => Err(CoreError::InvalidStatus(other)),
        }
    }
}

/// Delta of a last-writer-wins register field.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LWWRegDelta {
    pub doc_id: Vec<u8>,
    pub field_name: String,
    pub priority: u64,
    /// Schema version at the time of commit.
    pub schema_version_id: String,
    pub data: Vec<u8>,
}

/// Document-level delta linking the field blocks of one revision.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompositeDAGDelta {
    pub doc_id: Vec<u8>,
    /// Always empty for document-level deltas; kept for a uniform accessor.
    pub field_name: String,
    pub priority: u64,
    pub schema_version_id: String,
    pub status: DocStatus,
}

/// Delta of a counter field. `data` is a CBOR-encoded number.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterDelta {
    pub doc_id: Vec<u8>,
    pub field_name: String,
    pub priority: u64,
    /// Random value making repeated identical increments produce distinct blocks.
    pub nonce: i64,
    pub schema_version_id: String,
    pub data: Vec<u8>,
}

/// Collection-level delta linking the composite blocks committed with it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDelta {
    pub priority: u64,
    pub schema_version_id: String,
}

/// Delta carrying a serialized collection definition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDefinitionDelta {
    pub priority: u64,
    pub collection_id: String,
    pub definition: String,
}

/// Delta grouping collections defined together.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionSetDelta {
    pub priority: u64,
    pub collection_set_id: String,
    pub collection_ids: Vec<String>,
}

/// Delta carrying a serialized field definition.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinitionDelta {
    pub priority: u64,
    pub collection_id: String,
    pub field_name: String,
    pub definition: String,
}

/// A CRDT delta: exactly one of the supported variants.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delta {
    LWWRegister(LWWRegDelta),
    Composite(CompositeDAGDelta),
    Counter(CounterDelta),
    Collection(CollectionDelta),
    CollectionDefinition(CollectionDefinitionDelta),
    CollectionSet(CollectionSetDelta),
    FieldDefinition(FieldDefinitionDelta),
}

impl Delta {
    /// Wire tag of the variant in the keyed union representation.
    pub fn tag(&self) -> &'static str {
        match self {
            Delta::LWWRegister(_) => "lww",
            Delta::Composite(_) => "composite",
            Delta::Counter(_) => "counter",
            Delta::Collection(_) => "collection",
            Delta::CollectionDefinition(_) => "collectionDefinition",
            Delta::CollectionSet(_) => "collectionSet",
            Delta::FieldDefinition(_) => "fieldDefinition",
        }
    }

    pub fn priority(&self) -> u64 {
        match self {
            Delta::LWWRegister(d) => d.priority,
            Delta::Composite(d) => d.priority,
            Delta::Counter(d) => d.priority,
            Delta::Collection(d) => d.priority,
            Delta::CollectionDefinition(d) => d.priority,
            Delta::CollectionSet(d) => d.priority,
            Delta::FieldDefinition(d) => d.priority,
        }
    }

    pub fn set_priority(&mut self, priority: u64) {
        match self {
            Delta::LWWRegister(d) => d.priority = priority,
            Delta::Composite(d) => d.priority = priority,
            Delta::Counter(d) => d.priority = priority,
            Delta::Collection(d) => d.priority = priority,
            Delta::CollectionDefinition(d) => d.priority = priority,
            Delta::CollectionSet(d) => d.priority = priority,
            Delta::FieldDefinition(d) => d.priority = priority,
        }
    }

    /// Document id, empty for collection-level deltas.
    pub fn doc_id(&self) -> &[u8] {
        match self {
            Delta::LWWRegister(d) => &d.doc_id,
            Delta::Composite(d) => &d.doc_id,
            Delta::Counter(d) => &d.doc_id,
            _ => &[],
        }
    }

    /// Field name, empty for document- and collection-level deltas.
    pub fn field_name(&self) -> &str {
        match self {
            Delta::LWWRegister(d) => &d.field_name,
            Delta::Composite(d) => &d.field_name,
            Delta::Counter(d) => &d.field_name,
            Delta::FieldDefinition(d) => &d.field_name,
            _ => "",
        }
    }

    pub fn schema_version_id(&self) -> &str {
        match self {
            Delta::LWWRegister(d) => &d.schema_version_id,
            Delta::Composite(d) => &d.schema_version_id,
            Delta::Counter(d) => &d.schema_version_id,
            Delta::Collection(d) => &d.schema_version_id,
            _ => "",
        }
    }

    /// Document status; only composite deltas carry one.
    pub fn status(&self) -> Option<DocStatus> {
        match self {
            Delta::Composite(d) => Some(d.status),
            _ => None,
        }
    }

    /// Raw encryptable payload of register and counter deltas.
    pub fn data(&self) -> Option<&[u8]> {
        match self {
            Delta::LWWRegister(d) => Some(&d.data),
            Delta::Counter(d) => Some(&d.data),
            _ => None,
        }
    }

    /// Replace the raw payload. Returns `false` for variants without one.
    pub fn set_data(&mut self, data: Vec<u8>) -> bool {
        match self {
            Delta::LWWRegister(d) => {
                d.data = data;
                true
            }
            Delta::Counter(d) => {
                d.data = data;
                true
            }
            _ => false,
        }
    }

    pub fn is_composite(&self) -> bool {
        matches!(self, Delta::Composite(_))
    }

    /// True for every collection-level variant, including schema definitions.
    pub fn is_collection(&self) -> bool {
        matches!(
            self,
            Delta::Collection(_)
                | Delta::CollectionDefinition(_)
                | Delta::CollectionSet(_)
                | Delta::FieldDefinition(_)
        )
    }
}

impl From<LWWRegDelta> for Delta {
    fn from(d: LWWRegDelta) -> Self {
        Delta::LWWRegister(d)
    }
}

impl From<CompositeDAGDelta> for Delta {
    fn from(d: CompositeDAGDelta) -> Self {
        Delta::Composite(d)
    }
}

impl From<CounterDelta> for Delta {
    fn from(d: CounterDelta) -> Self {
        Delta::Counter(d)
    }
}

impl From<CollectionDelta> for Delta {
    fn from(d: CollectionDelta) -> Self {
        Delta::Collection(d)
    }
}

impl From<CollectionDefinitionDelta> for Delta {
    fn from(d: CollectionDefinitionDelta) -> Self {
        Delta::CollectionDefinition(d)
    }
}

impl From<CollectionSetDelta> for Delta {
    fn from(d: CollectionSetDelta) -> Self {
        Delta::CollectionSet(d)
    }
}

impl From<FieldDefinitionDelta> for Delta {
    fn from(d: FieldDefinitionDelta) -> Self {
        Delta::FieldDefinition(d)
    }
}
