//! Runtime schema table.
//!
//! The table lists the collections an application declares and, optionally,
//! rules for fields of their documents' bodies. Field names are dotted paths,
//! so `address.city` checks a nested field. Untyped mutations are checked
//! against the table when they are queued; typed mutations are additionally
//! constrained at compile time (see [`crate::collection`]).
//!
//! A stored document is checked in two steps: its `_id`/`_meta` layout, then
//! its body. `_id` and `_meta` are never body fields.

use crate::{
    error::Result, CollectionName, DocumentId, Error, KeyPath, MutationAction, MutationType,
    SchemaVersion,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

const RESERVED_FIELDS: [&str; 2] = ["_id", "_meta"];

/// JSON shape a body field must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    /// Any number
    Float,
    Bool,
    /// Epoch milliseconds
    Timestamp,
    Array,
    Object,
    /// Anything, including nested structures
    Json,
}

impl FieldType {
    fn accepts(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Timestamp => value.is_u64(),
            FieldType::Array => value.is_array(),
            FieldType::Object => value.is_object(),
            FieldType::Json => true,
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Array => "Array",
            FieldType::Object => "Object",
            FieldType::Json => "Json",
        };
        f.write_str(name)
    }
}

/// Rule for one body field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    /// Dotted path from the body root
    pub name: String,
    pub field_type: FieldType,
    /// Absent and `null` are both rejected when set
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
        }
    }

    /// Check the field in `body`.
    pub fn validate(&self, body: &Value) -> Result<()> {
        let root = self.name.split('.').next().unwrap_or_default();
        if RESERVED_FIELDS.contains(&root) {
            return Err(Error::InvalidPayload(format!(
                "'{}' is reserved and cannot be a body field",
                self.name
            )));
        }

        match KeyPath::new(self.name.as_str()).resolve(body) {
            None | Some(Value::Null) if self.required => {
                Err(Error::MissingRequiredField(self.name.clone()))
            }
            None | Some(Value::Null) => Ok(()),
            Some(value) if self.field_type.accepts(value) => Ok(()),
            Some(value) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(value).to_string(),
            }),
        }
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A declared collection and its field rules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// A collection that accepts any document body.
    pub fn untyped(name: impl Into<CollectionName>) -> Self {
        Self::new(name, Vec::new())
    }

    /// Check a document body. Stored documents can be passed as is; their
    /// `_id` and `_meta` are not looked at here.
    pub fn validate_body(&self, body: &Value) -> Result<()> {
        if !body.is_object() {
            return Err(Error::InvalidPayload(format!(
                "document body must be an object, got {}",
                json_type_name(body)
            )));
        }

        self.fields.iter().try_for_each(|field| field.validate(body))
    }
}

/// The collections a store holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: SchemaVersion,
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            collections: HashMap::new(),
        }
    }

    /// Declare a collection, replacing an earlier declaration of the same name.
    pub fn add_collection(&mut self, collection: CollectionSchema) -> &mut Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.add_collection(collection);
        self
    }

    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    pub fn declares(&self, name: &str) -> bool {
        self.collections.contains_key(name)
    }

    /// Names of all declared collections, sorted.
    pub fn collection_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.collections.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    fn collection(&self, name: &str) -> Result<&CollectionSchema> {
        self.get_collection(name)
            .ok_or_else(|| Error::CollectionNotFound(name.to_string()))
    }

    /// Check a bare document body destined for `collection_name`.
    pub fn validate_body(&self, collection_name: &str, body: &Value) -> Result<()> {
        self.collection(collection_name)?.validate_body(body)
    }

    /// Check a document in its stored layout and return its `_id`.
    ///
    /// `_id` must be a string and `_meta.collectionName` must name
    /// `collection_name`.
    pub fn validate_document(&self, collection_name: &str, document: &Value) -> Result<DocumentId> {
        let collection = self.collection(collection_name)?;

        let id = match document.get("_id") {
            Some(Value::String(id)) => id.clone(),
            Some(other) => {
                return Err(Error::InvalidPayload(format!(
                    "_id must be a String, got {}",
                    json_type_name(other)
                )))
            }
            None => return Err(Error::MissingRequiredField("_id".into())),
        };

        match document.pointer("/_meta/collectionName") {
            Some(Value::String(stored)) if stored == collection_name => {}
            Some(Value::String(stored)) => {
                return Err(Error::CollectionMismatch {
                    expected: collection_name.to_string(),
                    got: stored.clone(),
                })
            }
            _ => return Err(Error::MissingRequiredField("_meta.collectionName".into())),
        }

        collection.validate_body(document)?;
        Ok(id)
    }

    /// Check a queued mutation: the collection is declared, and creates and
    /// updates carry a valid stored document whose `_id` is the action's.
    pub fn validate_action(&self, action: &MutationAction) -> Result<()> {
        match (action.op, &action.doc) {
            (MutationType::Create | MutationType::Update, Some(doc)) => {
                let id = self.validate_document(&action.collection_name, doc)?;
                if id != action.id {
                    return Err(Error::IdMismatch {
                        expected: action.id.clone(),
                        got: id,
                    });
                }
                Ok(())
            }
            (MutationType::Create | MutationType::Update, None) => Err(Error::InvalidPayload(
                format!("{} of '{}' carries no document", action.op, action.id),
            )),
            (MutationType::Delete, _) => self.collection(&action.collection_name).map(|_| ()),
        }
    }
}
