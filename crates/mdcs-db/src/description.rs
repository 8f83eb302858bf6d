//! Collection and field descriptions.

use crate::error::{DbError, Result};
use mdcs_core::CounterKind;
use serde::{Deserialize, Serialize};

/// CRDT type backing a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CType {
    LwwRegister,
    /// Increment-only counter.
    PCounter(CounterKind),
    /// Counter accepting negative increments.
    PnCounter(CounterKind),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescription {
    /// Field id used in datastore and headstore keys.
    pub id: String,
    pub name: String,
    pub ctype: CType,
}

impl FieldDescription {
    pub fn new(id: impl Into<String>, name: impl Into<String>, ctype: CType) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ctype,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionDescription {
    pub root_id: u32,
    pub name: String,
    pub schema_version_id: String,
    pub fields: Vec<FieldDescription>,
    /// Also commit a collection-level block for every document commit.
    #[serde(default)]
    pub branchable: bool,
}

impl CollectionDescription {
    pub fn new(root_id: u32, name: impl Into<String>, schema_version_id: impl Into<String>) -> Self {
        Self {
            root_id,
            name: name.into(),
            schema_version_id: schema_version_id.into(),
            fields: Vec::new(),
            branchable: false,
        }
    }

    pub fn with_field(mut self, id: impl Into<String>, name: impl Into<String>, ctype: CType) -> Self {
        self.fields.push(FieldDescription::new(id, name, ctype));
        self
    }

    pub fn branchable(mut self, branchable: bool) -> Self {
        self.branchable = branchable;
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescription> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldDescription> {
        self.field(name).ok_or_else(|| DbError::FieldNotFound {
            collection: self.name.clone(),
            field: name.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_lookup() {
        let users = CollectionDescription::new(1, "Users", "schema-v1")
            .with_field("1", "name", CType::LwwRegister)
            .with_field("2", "points", CType::PCounter(CounterKind::Int));

        assert_eq!(users.field("points").unwrap().id, "2");
        assert!(matches!(
            users.require_field("email"),
            Err(DbError::FieldNotFound { field, .. }) if field == "email"
        ));
    }

    #[test]
    fn test_description_serde() {
        let users = CollectionDescription::new(1, "Users", "schema-v1")
            .with_field("1", "balance", CType::PnCounter(CounterKind::Float))
            .branchable(true);
        let json = serde_json::to_string(&users).unwrap();
        let back: CollectionDescription = serde_json::from_str(&json).unwrap();
        assert_eq!(back, users);
    }
}
