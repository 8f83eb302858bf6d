//! DAG node format: the `Block` wrapping a delta, plus the `Encryption` and
//! `Signature` side-blocks it may link to.
//!
//! `heads` and `links` are sorted by CID string on construction so that two
//! blocks with the same logical content always encode to the same bytes and
//! therefore the same CID. Empty lists are omitted from the encoding.

use crate::codec::{canonical_map, int_value, link_value, parse_link, uint_value, Fields, IpldNode};
use crate::error::{MerkleError, Result};
use crate::link::{cmp_by_string, Cid};
use crate::schema::{SchemaRegistry, BLOCK, CRDT_UNION, DAG_LINK, ENCRYPTION, SIGNATURE, SIGNATURE_HEADER};
use ciborium::value::Value;
use mdcs_core::{
    CollectionDefinitionDelta, CollectionDelta, CollectionSetDelta, CompositeDAGDelta, CounterDelta, Delta,
    DocStatus, FieldDefinitionDelta, LWWRegDelta,
};

/// Link name used for the head link of a composite block.
pub const HEAD_LINK_NAME: &str = "_head";

/// A named link from a composite block to one of its field blocks.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DAGLink {
    /// Field name of the linked delta.
    pub name: String,
    pub cid: Cid,
}

impl DAGLink {
    pub fn new(name: impl Into<String>, cid: Cid) -> Self {
        Self { name: name.into(), cid }
    }

    fn to_value(&self) -> Value {
        canonical_map(vec![
            ("name", Value::Text(self.name.clone())),
            ("link", link_value(&self.cid)),
        ])
    }

    fn from_value(value: &Value, registry: &SchemaRegistry) -> Result<Self> {
        let fields = Fields::new(value, DAG_LINK, registry)?;
        Ok(Self {
            name: fields.string("name")?,
            cid: fields.link("link")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Block {
    pub delta: Delta,
    /// Previous blocks at the same position that this block succeeds.
    pub heads: Vec<Cid>,
    /// Field blocks of the same revision (composite blocks only).
    pub links: Vec<DAGLink>,
    /// Link to the `Encryption` side-block when the delta payload is encrypted.
    pub encryption: Option<Cid>,
    pub signature: Option<Cid>,
}

impl Block {
    pub fn new(delta: Delta, links: Vec<DAGLink>, heads: Vec<Cid>) -> Self {
        let mut heads = heads;
        heads.sort_by(cmp_by_string);
        let mut links = links;
        links.sort_by(|a, b| cmp_by_string(&a.cid, &b.cid));
        Self {
            delta,
            heads,
            links,
            encryption: None,
            signature: None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Every CID this block causally subsumes: heads first, then links.
    pub fn all_links(&self) -> Vec<Cid> {
        self.heads
            .iter()
            .copied()
            .chain(self.links.iter().map(|l| l.cid))
            .collect()
    }

    pub fn link_by_name(&self, name: &str) -> Option<Cid> {
        self.links.iter().find(|l| l.name == name).map(|l| l.cid)
    }

    /// Decode a block, failing with `NodeToBlock` if the bytes hold another node type.
    pub fn get_from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::unmarshal(bytes)
    }
}

impl IpldNode for Block {
    const TYPE_NAME: &'static str = BLOCK;

    fn to_value(&self) -> Result<Value> {
        let mut entries = vec![("delta", delta_to_value(&self.delta))];
        if !self.heads.is_empty() {
            entries.push(("heads", Value::Array(self.heads.iter().map(link_value).collect())));
        }
        if !self.links.is_empty() {
            entries.push(("links", Value::Array(self.links.iter().map(DAGLink::to_value).collect())));
        }
        if let Some(cid) = &self.encryption {
            entries.push(("encryption", link_value(cid)));
        }
        if let Some(cid) = &self.signature {
            entries.push(("signature", link_value(cid)));
        }
        Ok(canonical_map(entries))
    }

    fn from_value(value: &Value, registry: &SchemaRegistry) -> Result<Self> {
        let fields = Fields::new(value, BLOCK, registry)?;
        let delta = delta_from_value(fields.required("delta")?, registry)?;
        let heads = fields
            .opt_list("heads")?
            .iter()
            .map(|v| {
                parse_link(v).map_err(|_| MerkleError::NodeToBlock {
                    expected: BLOCK,
                    reason: "heads entry is not a link".to_string(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let links = fields
            .opt_list("links")?
            .iter()
            .map(|v| DAGLink::from_value(v, registry))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            delta,
            heads,
            links,
            encryption: fields.opt_link("encryption")?,
            signature: fields.opt_link("signature")?,
        })
    }
}

/// Symmetric key used to encrypt the deltas of a document or one of its fields.
#[derive(Clone, PartialEq, Eq)]
pub struct Encryption {
    pub doc_id: Vec<u8>,
    /// `None` for whole-document encryption.
    pub field_name: Option<String>,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for Encryption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Encryption")
            .field("doc_id", &String::from_utf8_lossy(&self.doc_id))
            .field("field_name", &self.field_name)
            .field("key", &"<redacted>")
            .finish()
    }
}

impl IpldNode for Encryption {
    const TYPE_NAME: &'static str = ENCRYPTION;

    fn to_value(&self) -> Result<Value> {
        let mut entries = vec![
            ("docID", Value::Bytes(self.doc_id.clone())),
            ("key", Value::Bytes(self.key.clone())),
        ];
        if let Some(field) = &self.field_name {
            entries.push(("fieldName", Value::Text(field.clone())));
        }
        Ok(canonical_map(entries))
    }

    fn from_value(value: &Value, registry: &SchemaRegistry) -> Result<Self> {
        let fields = Fields::new(value, ENCRYPTION, registry)?;
        Ok(Self {
            doc_id: fields.bytes("docID")?,
            field_name: fields.opt_string("fieldName")?,
            key: fields.bytes("key")?,
        })
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignatureHeader {
    /// Signature algorithm, e.g. `ed25519`.
    pub sig_type: String,
    /// Serialized public key of the signer.
    pub identity: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature {
    pub header: SignatureHeader,
    pub value: Vec<u8>,
}

impl IpldNode for Signature {
    const TYPE_NAME: &'static str = SIGNATURE;

    fn to_value(&self) -> Result<Value> {
        let header = canonical_map(vec![
            ("type", Value::Text(self.header.sig_type.clone())),
            ("identity", Value::Bytes(self.header.identity.clone())),
        ]);
        Ok(canonical_map(vec![
            ("header", header),
            ("value", Value::Bytes(self.value.clone())),
        ]))
    }

    fn from_value(value: &Value, registry: &SchemaRegistry) -> Result<Self> {
        let fields = Fields::new(value, SIGNATURE, registry)?;
        let header = Fields::new(fields.required("header")?, SIGNATURE_HEADER, registry)?;
        Ok(Self {
            header: SignatureHeader {
                sig_type: header.string("type")?,
                identity: header.bytes("identity")?,
            },
            value: fields.bytes("value")?,
        })
    }
}

fn delta_to_value(delta: &Delta) -> Value {
    let body = match delta {
        Delta::LWWRegister(d) => canonical_map(vec![
            ("docID", Value::Bytes(d.doc_id.clone())),
            ("fieldName", Value::Text(d.field_name.clone())),
            ("priority", uint_value(d.priority)),
            ("schemaVersionID", Value::Text(d.schema_version_id.clone())),
            ("data", Value::Bytes(d.data.clone())),
        ]),
        Delta::Composite(d) => canonical_map(vec![
            ("docID", Value::Bytes(d.doc_id.clone())),
            ("fieldName", Value::Text(d.field_name.clone())),
            ("priority", uint_value(d.priority)),
            ("schemaVersionID", Value::Text(d.schema_version_id.clone())),
            ("status", uint_value(u64::from(d.status.as_u8()))),
        ]),
        Delta::Counter(d) => canonical_map(vec![
            ("docID", Value::Bytes(d.doc_id.clone())),
            ("fieldName", Value::Text(d.field_name.clone())),
            ("priority", uint_value(d.priority)),
            ("nonce", int_value(d.nonce)),
            ("schemaVersionID", Value::Text(d.schema_version_id.clone())),
            ("data", Value::Bytes(d.data.clone())),
        ]),
        Delta::Collection(d) => canonical_map(vec![
            ("priority", uint_value(d.priority)),
            ("schemaVersionID", Value::Text(d.schema_version_id.clone())),
        ]),
        Delta::CollectionDefinition(d) => canonical_map(vec![
            ("priority", uint_value(d.priority)),
            ("collectionID", Value::Text(d.collection_id.clone())),
            ("definition", Value::Text(d.definition.clone())),
        ]),
        Delta::CollectionSet(d) => canonical_map(vec![
            ("priority", uint_value(d.priority)),
            ("collectionSetID", Value::Text(d.collection_set_id.clone())),
            (
                "collectionIDs",
                Value::Array(d.collection_ids.iter().cloned().map(Value::Text).collect()),
            ),
        ]),
        Delta::FieldDefinition(d) => canonical_map(vec![
            ("priority", uint_value(d.priority)),
            ("collectionID", Value::Text(d.collection_id.clone())),
            ("fieldName", Value::Text(d.field_name.clone())),
            ("definition", Value::Text(d.definition.clone())),
        ]),
    };
    Value::Map(vec![(Value::Text(delta.tag().to_string()), body)])
}

fn delta_from_value(value: &Value, registry: &SchemaRegistry) -> Result<Delta> {
    let not_union = |reason: String| MerkleError::NodeToBlock {
        expected: CRDT_UNION,
        reason,
    };
    let entries = value
        .as_map()
        .ok_or_else(|| not_union("delta is not a map".to_string()))?;
    let (tag, body) = match entries.as_slice() {
        [(tag, body)] => (tag, body),
        _ => return Err(not_union(format!("expected exactly one variant, found {}", entries.len()))),
    };
    let tag = tag
        .as_text()
        .ok_or_else(|| not_union("variant tag is not a string".to_string()))?;
    let member = registry
        .union_member(CRDT_UNION, tag)
        .ok_or_else(|| not_union(format!("unknown variant {tag}")))?;
    let f = Fields::new(body, member, registry)?;

    let delta = match tag {
        "lww" => LWWRegDelta {
            doc_id: f.bytes("docID")?,
            field_name: f.string("fieldName")?,
            priority: f.uint("priority")?,
            schema_version_id: f.string("schemaVersionID")?,
            data: f.bytes("data")?,
        }
        .into(),
        "composite" => {
            let status = u8::try_from(f.uint("status")?)
                .map_err(|_| not_union("status out of range".to_string()))?;
            CompositeDAGDelta {
                doc_id: f.bytes("docID")?,
                field_name: f.string("fieldName")?,
                priority: f.uint("priority")?,
                schema_version_id: f.string("schemaVersionID")?,
                status: DocStatus::from_u8(status)?,
            }
            .into()
        }
        "counter" => CounterDelta {
            doc_id: f.bytes("docID")?,
            field_name: f.string("fieldName")?,
            priority: f.uint("priority")?,
            nonce: f.int("nonce")?,
            schema_version_id: f.string("schemaVersionID")?,
            data: f.bytes("data")?,
        }
        .into(),
        "collection" => CollectionDelta {
            priority: f.uint("priority")?,
            schema_version_id: f.string("schemaVersionID")?,
        }
        .into(),
        "collectionDefinition" => CollectionDefinitionDelta {
            priority: f.uint("priority")?,
            collection_id: f.string("collectionID")?,
            definition: f.string("definition")?,
        }
        .into(),
        "collectionSet" => CollectionSetDelta {
            priority: f.uint("priority")?,
            collection_set_id: f.string("collectionSetID")?,
            collection_ids: f.string_list("collectionIDs")?,
        }
        .into(),
        "fieldDefinition" => FieldDefinitionDelta {
            priority: f.uint("priority")?,
            collection_id: f.string("collectionID")?,
            field_name: f.string("fieldName")?,
            definition: f.string("definition")?,
        }
        .into(),
        other => return Err(not_union(format!("unknown variant {other}"))),
    };
    Ok(delta)
}
