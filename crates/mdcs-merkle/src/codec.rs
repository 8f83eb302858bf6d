//! Deterministic DAG-CBOR encoding on top of `ciborium`.
//!
//! Maps are written with keys sorted by length then bytes, integers use the
//! shortest form, and links are CBOR tag 42 over a `0x00`-prefixed binary CID.
//! Decoding accepts exactly one CBOR item; trailing bytes are corrupt input.

use crate::error::{MerkleError, Result};
use crate::link::{cid_from_bytes, compute_cid, Cid};
use crate::schema::{registry, SchemaRegistry};
use ciborium::value::{Integer, Value};
use std::collections::BTreeMap;

/// CBOR tag carrying a content identifier.
pub const CID_TAG: u64 = 42;

/// A node type with a fixed schema in the registry.
pub trait IpldNode: Sized {
    /// Struct name in the schema registry.
    const TYPE_NAME: &'static str;

    fn to_value(&self) -> Result<Value>;

    fn from_value(value: &Value, registry: &SchemaRegistry) -> Result<Self>;

    fn marshal(&self) -> Result<Vec<u8>> {
        encode_value(Self::TYPE_NAME, &self.to_value()?)
    }

    fn unmarshal(bytes: &[u8]) -> Result<Self> {
        let registry = registry()?;
        let value = decode_value(bytes)?;
        Self::from_value(&value, registry)
    }

    /// Content identifier of the canonical encoding.
    fn generate_link(&self) -> Result<Cid> {
        compute_cid(&self.marshal()?)
    }
}

pub fn encode_value(type_name: &'static str, value: &Value) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::ser::into_writer(value, &mut buf).map_err(|e| MerkleError::Encoding {
        type_name,
        reason: e.to_string(),
    })?;
    Ok(buf)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value> {
    let mut rest = bytes;
    let value: Value = ciborium::de::from_reader(&mut rest).map_err(|e| MerkleError::Decoding(e.to_string()))?;
    if !rest.is_empty() {
        return Err(MerkleError::Decoding(format!("{} trailing bytes", rest.len())));
    }
    Ok(value)
}

/// Build a map with DAG-CBOR canonical key order.
pub fn canonical_map(entries: Vec<(&'static str, Value)>) -> Value {
    let mut entries = entries;
    entries.sort_by(|(a, _), (b, _)| a.len().cmp(&b.len()).then_with(|| a.as_bytes().cmp(b.as_bytes())));
    Value::Map(
        entries
            .into_iter()
            .map(|(k, v)| (Value::Text(k.to_string()), v))
            .collect(),
    )
}

pub fn link_value(cid: &Cid) -> Value {
    let mut bytes = Vec::with_capacity(cid.encoded_len() + 1);
    bytes.push(0x00);
    bytes.extend_from_slice(&cid.to_bytes());
    Value::Tag(CID_TAG, Box::new(Value::Bytes(bytes)))
}

pub fn uint_value(v: u64) -> Value {
    Value::Integer(Integer::from(v))
}

pub fn int_value(v: i64) -> Value {
    Value::Integer(Integer::from(v))
}

/// Typed view over a decoded map, checked against a struct schema.
pub struct Fields<'a> {
    type_name: &'static str,
    entries: BTreeMap<&'a str, &'a Value>,
}

impl<'a> Fields<'a> {
    pub fn new(value: &'a Value, type_name: &'static str, registry: &SchemaRegistry) -> Result<Self> {
        let map = match value {
            Value::Map(map) => map,
            other => {
                return Err(MerkleError::NodeToBlock {
                    expected: type_name,
                    reason: format!("expected a map, found {}", kind_of(other)),
                })
            }
        };
        let mut entries = BTreeMap::new();
        let mut keys = Vec::with_capacity(map.len());
        for (k, v) in map {
            let key = k.as_text().ok_or_else(|| MerkleError::NodeToBlock {
                expected: type_name,
                reason: "map key is not a string".to_string(),
            })?;
            keys.push(key);
            entries.insert(key, v);
        }
        registry.check_keys(type_name, keys)?;
        Ok(Self { type_name, entries })
    }

    fn mismatch(&self, field: &str, want: &str) -> MerkleError {
        MerkleError::NodeToBlock {
            expected: self.type_name,
            reason: format!("field {field} is not {want}"),
        }
    }

    pub fn get(&self, field: &str) -> Option<&'a Value> {
        self.entries.get(field).copied()
    }

    pub fn required(&self, field: &str) -> Result<&'a Value> {
        self.get(field).ok_or_else(|| MerkleError::NodeToBlock {
            expected: self.type_name,
            reason: format!("missing field {field}"),
        })
    }

    pub fn bytes(&self, field: &str) -> Result<Vec<u8>> {
        self.required(field)?
            .as_bytes()
            .cloned()
            .ok_or_else(|| self.mismatch(field, "bytes"))
    }

    pub fn string(&self, field: &str) -> Result<String> {
        self.required(field)?
            .as_text()
            .map(str::to_string)
            .ok_or_else(|| self.mismatch(field, "a string"))
    }

    pub fn opt_string(&self, field: &str) -> Result<Option<String>> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => v
                .as_text()
                .map(|s| Some(s.to_string()))
                .ok_or_else(|| self.mismatch(field, "a string")),
        }
    }

    pub fn uint(&self, field: &str) -> Result<u64> {
        self.required(field)?
            .as_integer()
            .and_then(|i| u64::try_from(i).ok())
            .ok_or_else(|| self.mismatch(field, "an unsigned integer"))
    }

    pub fn int(&self, field: &str) -> Result<i64> {
        self.required(field)?
            .as_integer()
            .and_then(|i| i64::try_from(i).ok())
            .ok_or_else(|| self.mismatch(field, "an integer"))
    }

    pub fn string_list(&self, field: &str) -> Result<Vec<String>> {
        let items = self
            .required(field)?
            .as_array()
            .ok_or_else(|| self.mismatch(field, "a list"))?;
        items
            .iter()
            .map(|v| v.as_text().map(str::to_string).ok_or_else(|| self.mismatch(field, "a list of strings")))
            .collect()
    }

    pub fn link(&self, field: &str) -> Result<Cid> {
        let value = self.required(field)?;
        parse_link(value).map_err(|_| self.mismatch(field, "a link"))
    }

    pub fn opt_link(&self, field: &str) -> Result<Option<Cid>> {
        match self.get(field) {
            None => Ok(None),
            Some(v) => parse_link(v).map(Some).map_err(|_| self.mismatch(field, "a link")),
        }
    }

    /// An optional list; absent yields an empty list.
    pub fn opt_list(&self, field: &str) -> Result<&'a [Value]> {
        match self.get(field) {
            None => Ok(&[]),
            Some(v) => v
                .as_array()
                .map(Vec::as_slice)
                .ok_or_else(|| self.mismatch(field, "a list")),
        }
    }
}

pub fn parse_link(value: &Value) -> Result<Cid> {
    match value {
        Value::Tag(CID_TAG, inner) => match inner.as_ref() {
            Value::Bytes(bytes) if bytes.first() == Some(&0x00) => cid_from_bytes(&bytes[1..]),
            _ => Err(MerkleError::InvalidCid("malformed link payload".to_string())),
        },
        _ => Err(MerkleError::InvalidCid("value is not a link".to_string())),
    }
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Integer(_) => "an integer",
        Value::Bytes(_) => "bytes",
        Value::Float(_) => "a float",
        Value::Text(_) => "a string",
        Value::Bool(_) => "a bool",
        Value::Null => "null",
        Value::Tag(_, _) => "a tag",
        Value::Array(_) => "a list",
        Value::Map(_) => "a map",
        _ => "an unknown value",
    }
}
