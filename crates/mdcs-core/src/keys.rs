//! Structured keys for the datastore, headstore and encryption store.
//!
//! Keys render to `/`-separated strings so a whole namespace can be range
//! scanned with a single prefix.

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Field id used for the document-level (composite) namespace.
pub const COMPOSITE_NAMESPACE: &str = "C";

/// Field id holding the schema version a document was last written with.
pub const DOC_VERSION_FIELD_ID: &str = "v";

/// Value stored under a primary document key while the document is live.
pub const OBJECT_MARKER: u8 = 0xff;

/// Value stored under a primary document key once the document is deleted.
pub const DELETED_OBJECT_MARKER: u8 = 0xfe;

/// The kind of instance a datastore key points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InstanceType {
    Value,
    Priority,
    Deleted,
}

impl InstanceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceType::Value => "v",
            InstanceType::Priority => "p",
            InstanceType::Deleted => "d",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "v" => Ok(InstanceType::Value),
            "p" => Ok(InstanceType::Priority),
            "d" => Ok(InstanceType::Deleted),
            other => Err(CoreError::InvalidKey(format!("unknown instance type {other}"))),
        }
    }
}

/// Key of a projected value in the datastore.
///
/// Renders as `/{collection_root_id}/{instance}/{doc_id}[/{field_id}]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DataStoreKey {
    pub collection_root_id: u32,
    pub instance_type: InstanceType,
    pub doc_id: String,
    pub field_id: String,
}

impl DataStoreKey {
    pub fn new(collection_root_id: u32, doc_id: impl Into<String>) -> Self {
        Self {
            collection_root_id,
            instance_type: InstanceType::Value,
            doc_id: doc_id.into(),
            field_id: String::new(),
        }
    }

    pub fn with_field_id(&self, field_id: impl Into<String>) -> Self {
        let mut key = self.clone();
        key.field_id = field_id.into();
        key
    }

    pub fn with_value_flag(&self) -> Self {
        self.with_instance(InstanceType::Value)
    }

    pub fn with_priority_flag(&self) -> Self {
        self.with_instance(InstanceType::Priority)
    }

    pub fn with_deleted_flag(&self) -> Self {
        self.with_instance(InstanceType::Deleted)
    }

    fn with_instance(&self, instance_type: InstanceType) -> Self {
        let mut key = self.clone();
        key.instance_type = instance_type;
        key
    }

    /// The key holding the document's live/deleted marker.
    pub fn to_primary_key(&self) -> Self {
        let mut key = self.with_value_flag();
        key.field_id.clear();
        key
    }

    /// Headstore namespace tracking the DAG tips for this position.
    pub fn to_headstore_key(&self) -> HeadStoreKey {
        HeadStoreKey::Doc {
            doc_id: self.doc_id.clone(),
            field_id: self.field_id.clone(),
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    /// Parse a rendered key back into its parts.
    pub fn parse(key: &str) -> Result<Self> {
        let parts: Vec<&str> = key.split('/').collect();
        if parts.len() < 4 || parts.len() > 5 || !parts[0].is_empty() {
            return Err(CoreError::InvalidKey(key.to_string()));
        }
        let collection_root_id = parts[1]
            .parse()
            .map_err(|_| CoreError::InvalidKey(key.to_string()))?;
        Ok(Self {
            collection_root_id,
            instance_type: InstanceType::parse(parts[2])?,
            doc_id: parts[3].to_string(),
            field_id: parts.get(4).map(|s| s.to_string()).unwrap_or_default(),
        })
    }
}

impl fmt::Display for DataStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "/{}/{}/{}",
            self.collection_root_id,
            self.instance_type.as_str(),
            self.doc_id
        )?;
        if !self.field_id.is_empty() {
            write!(f, "/{}", self.field_id)?;
        }
        Ok(())
    }
}

/// Namespace of a head set.
///
/// One namespace per document field, per document composite (`field_id ==
/// "C"`), or per collection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum HeadStoreKey {
    Doc { doc_id: String, field_id: String },
    Collection { root_id: u32 },
}

impl HeadStoreKey {
    pub fn doc(doc_id: impl Into<String>, field_id: impl Into<String>) -> Self {
        HeadStoreKey::Doc {
            doc_id: doc_id.into(),
            field_id: field_id.into(),
        }
    }

    pub fn collection(root_id: u32) -> Self {
        HeadStoreKey::Collection { root_id }
    }

    /// Prefix under which every tip of this namespace is stored.
    pub fn prefix(&self) -> String {
        format!("{self}/")
    }

    /// Key of a single tip in this namespace.
    pub fn with_cid(&self, cid: &str) -> Vec<u8> {
        format!("{self}/{cid}").into_bytes()
    }
}

impl fmt::Display for HeadStoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeadStoreKey::Doc { doc_id, field_id } => write!(f, "/{doc_id}/{field_id}"),
            HeadStoreKey::Collection { root_id } => write!(f, "/col/{root_id}"),
        }
    }
}

/// Key of a symmetric key in the encryption store.
///
/// `field_name` is `None` for a whole-document key.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EncStoreDocKey {
    pub doc_id: String,
    pub field_name: Option<String>,
}

impl EncStoreDocKey {
    pub fn new(doc_id: impl Into<String>, field_name: Option<String>) -> Self {
        Self {
            doc_id: doc_id.into(),
            field_name,
        }
    }

    pub fn bytes(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }
}

impl fmt::Display for EncStoreDocKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field_name {
            Some(field) => write!(f, "/{}/{}", self.doc_id, field),
            None => write!(f, "/{}", self.doc_id),
        }
    }
}
