//! Schema registry for every node type stored in the DAG.
//!
//! The registry describes the wire shape of `Block`, `DAGLink`, `Encryption`,
//! `Signature`, `SignatureHeader` and the keyed `CRDT` union of delta
//! variants. It is built once per process by [`init_schema`], which checks
//! that the definitions are self-consistent. The codec consults it to tell
//! valid CBOR of the wrong shape apart from corrupt bytes.

use crate::error::{MerkleError, Result};
use mdcs_core::{
    CollectionDefinitionDelta, CollectionDelta, CollectionSetDelta, CompositeDAGDelta, CounterDelta, Delta,
    FieldDefinitionDelta, LWWRegDelta,
};
use once_cell::sync::OnceCell;
use std::collections::{BTreeMap, BTreeSet};

/// Type names used by the codec.
pub const BLOCK: &str = "Block";
pub const DAG_LINK: &str = "DAGLink";
pub const ENCRYPTION: &str = "Encryption";
pub const SIGNATURE: &str = "Signature";
pub const SIGNATURE_HEADER: &str = "SignatureHeader";
pub const CRDT_UNION: &str = "CRDT";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldKind {
    Bytes,
    String,
    Int,
    Link,
    StringList,
    LinkList,
    /// A list of structs of the named type.
    List(&'static str),
    Struct(&'static str),
    Union(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldSchema {
    pub name: &'static str,
    pub kind: FieldKind,
    pub optional: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StructSchema {
    pub name: &'static str,
    pub fields: Vec<FieldSchema>,
}

impl StructSchema {
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A keyed union: exactly one `tag -> member` entry on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnionSchema {
    pub name: &'static str,
    pub members: Vec<(&'static str, &'static str)>,
}

#[derive(Clone, Debug, Default)]
pub struct SchemaRegistry {
    structs: BTreeMap<&'static str, StructSchema>,
    unions: BTreeMap<&'static str, UnionSchema>,
}

fn required(name: &'static str, kind: FieldKind) -> FieldSchema {
    FieldSchema {
        name,
        kind,
        optional: false,
    }
}

fn optional(name: &'static str, kind: FieldKind) -> FieldSchema {
    FieldSchema {
        name,
        kind,
        optional: true,
    }
}

impl SchemaRegistry {
    fn register_struct(&mut self, name: &'static str, fields: Vec<FieldSchema>) -> Result<()> {
        if self.structs.contains_key(name) || self.unions.contains_key(name) {
            return Err(MerkleError::Schema(format!("type {name} registered twice")));
        }
        self.structs.insert(name, StructSchema { name, fields });
        Ok(())
    }

    fn register_union(&mut self, name: &'static str, members: Vec<(&'static str, &'static str)>) -> Result<()> {
        if self.structs.contains_key(name) || self.unions.contains_key(name) {
            return Err(MerkleError::Schema(format!("type {name} registered twice")));
        }
        self.unions.insert(name, UnionSchema { name, members });
        Ok(())
    }

    pub fn struct_schema(&self, name: &str) -> Result<&StructSchema> {
        self.structs
            .get(name)
            .ok_or_else(|| MerkleError::Schema(format!("unknown type {name}")))
    }

    pub fn union_schema(&self, name: &str) -> Result<&UnionSchema> {
        self.unions
            .get(name)
            .ok_or_else(|| MerkleError::Schema(format!("unknown union {name}")))
    }

    /// Member type registered under `tag` in the union `name`.
    pub fn union_member(&self, name: &str, tag: &str) -> Option<&'static str> {
        self.unions
            .get(name)?
            .members
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, member)| *member)
    }

    /// Check a decoded map's keys against the struct schema `type_name`.
    ///
    /// Unknown keys and missing required keys are schema mismatches.
    pub fn check_keys<'a>(&self, type_name: &'static str, keys: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let schema = self.struct_schema(type_name)?;
        let mut seen = BTreeSet::new();
        for key in keys {
            if schema.field(key).is_none() {
                return Err(MerkleError::NodeToBlock {
                    expected: type_name,
                    reason: format!("unexpected field {key}"),
                });
            }
            if !seen.insert(key) {
                return Err(MerkleError::NodeToBlock {
                    expected: type_name,
                    reason: format!("duplicate field {key}"),
                });
            }
        }
        if let Some(missing) = schema
            .fields
            .iter()
            .find(|f| !f.optional && !seen.contains(f.name))
        {
            return Err(MerkleError::NodeToBlock {
                expected: type_name,
                reason: format!("missing field {}", missing.name),
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let exists = |name: &str| self.structs.contains_key(name) || self.unions.contains_key(name);

        for schema in self.structs.values() {
            let mut names = BTreeSet::new();
            for field in &schema.fields {
                if !names.insert(field.name) {
                    return Err(MerkleError::Schema(format!(
                        "{} declares field {} twice",
                        schema.name, field.name
                    )));
                }
                let referenced = match &field.kind {
                    FieldKind::List(t) | FieldKind::Struct(t) | FieldKind::Union(t) => Some(*t),
                    _ => None,
                };
                if let Some(t) = referenced {
                    if !exists(t) {
                        return Err(MerkleError::Schema(format!(
                            "{}.{} references unknown type {t}",
                            schema.name, field.name
                        )));
                    }
                }
            }
        }

        for union in self.unions.values() {
            let mut tags = BTreeSet::new();
            for (tag, member) in &union.members {
                if !tags.insert(*tag) {
                    return Err(MerkleError::Schema(format!("{} declares tag {tag} twice", union.name)));
                }
                if !self.structs.contains_key(member) {
                    return Err(MerkleError::Schema(format!(
                        "{} member {member} is not a registered struct",
                        union.name
                    )));
                }
            }
        }

        // Every delta variant must be reachable through the union under its own tag.
        let crdt = self.union_schema(CRDT_UNION)?;
        for delta in delta_samples() {
            if !crdt.members.iter().any(|(tag, _)| *tag == delta.tag()) {
                return Err(MerkleError::Schema(format!(
                    "delta tag {} is missing from the {CRDT_UNION} union",
                    delta.tag()
                )));
            }
        }
        if crdt.members.len() != delta_samples().len() {
            return Err(MerkleError::Schema(format!(
                "{CRDT_UNION} union has members without a delta variant"
            )));
        }
        Ok(())
    }
}

fn delta_samples() -> Vec<Delta> {
    vec![
        LWWRegDelta::default().into(),
        CompositeDAGDelta::default().into(),
        CounterDelta::default().into(),
        CollectionDelta::default().into(),
        CollectionDefinitionDelta::default().into(),
        CollectionSetDelta::default().into(),
        FieldDefinitionDelta::default().into(),
    ]
}

/// Build and validate the registry.
pub fn init_schema() -> Result<SchemaRegistry> {
    use FieldKind::*;

    let mut reg = SchemaRegistry::default();

    reg.register_struct(
        "LWWRegDelta",
        vec![
            required("docID", Bytes),
            required("fieldName", String),
            required("priority", Int),
            required("schemaVersionID", String),
            required("data", Bytes),
        ],
    )?;
    reg.register_struct(
        "CompositeDAGDelta",
        vec![
            required("docID", Bytes),
            required("fieldName", String),
            required("priority", Int),
            required("schemaVersionID", String),
            required("status", Int),
        ],
    )?;
    reg.register_struct(
        "CounterDelta",
        vec![
            required("docID", Bytes),
            required("fieldName", String),
            required("priority", Int),
            required("nonce", Int),
            required("schemaVersionID", String),
            required("data", Bytes),
        ],
    )?;
    reg.register_struct(
        "CollectionDelta",
        vec![required("priority", Int), required("schemaVersionID", String)],
    )?;
    reg.register_struct(
        "CollectionDefinitionDelta",
        vec![
            required("priority", Int),
            required("collectionID", String),
            required("definition", String),
        ],
    )?;
    reg.register_struct(
        "CollectionSetDelta",
        vec![
            required("priority", Int),
            required("collectionSetID", String),
            required("collectionIDs", StringList),
        ],
    )?;
    reg.register_struct(
        "FieldDefinitionDelta",
        vec![
            required("priority", Int),
            required("collectionID", String),
            required("fieldName", String),
            required("definition", String),
        ],
    )?;
    reg.register_union(
        CRDT_UNION,
        vec![
            ("lww", "LWWRegDelta"),
            ("composite", "CompositeDAGDelta"),
            ("counter", "CounterDelta"),
            ("collection", "CollectionDelta"),
            ("collectionDefinition", "CollectionDefinitionDelta"),
            ("collectionSet", "CollectionSetDelta"),
            ("fieldDefinition", "FieldDefinitionDelta"),
        ],
    )?;

    reg.register_struct(DAG_LINK, vec![required("name", String), required("link", Link)])?;
    reg.register_struct(
        BLOCK,
        vec![
            required("delta", Union(CRDT_UNION)),
            optional("heads", LinkList),
            optional("links", List(DAG_LINK)),
            optional("encryption", Link),
            optional("signature", Link),
        ],
    )?;
    reg.register_struct(
        ENCRYPTION,
        vec![
            required("docID", Bytes),
            optional("fieldName", String),
            required("key", Bytes),
        ],
    )?;
    reg.register_struct(
        SIGNATURE_HEADER,
        vec![required("type", String), required("identity", Bytes)],
    )?;
    reg.register_struct(
        SIGNATURE,
        vec![required("header", Struct(SIGNATURE_HEADER)), required("value", Bytes)],
    )?;

    reg.validate()?;
    Ok(reg)
}

static REGISTRY: OnceCell<SchemaRegistry> = OnceCell::new();

/// The process-wide registry, built on first use.
pub fn registry() -> Result<&'static SchemaRegistry> {
    REGISTRY.get_or_try_init(init_schema)
}
