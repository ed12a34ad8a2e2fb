//! Entity and field definitions
//!
//! An entity is a named record type with ordered fields. Its records live in
//! one of two storage modes:
//! - `Shared`: JSON documents in the common `kdb_records` table
//! - `Dedicated`: a typed table of its own with native constraints

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

use crate::{Error, Result};

/// Physical representation of an entity's records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Rows in the shared document table
    Shared,
    /// Rows in a per-entity typed table
    Dedicated,
}

impl StorageMode {
    /// Get the string representation of the storage mode
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Shared => "shared",
            StorageMode::Dedicated => "dedicated",
        }
    }
}

impl FromStr for StorageMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "shared" => Ok(StorageMode::Shared),
            "dedicated" => Ok(StorageMode::Dedicated),
            _ => Err(Error::storage_mode(s, format!("unknown storage mode '{}'", s))),
        }
    }
}

impl std::fmt::Display for StorageMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Declared field types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Text,
    Int,
    Float,
    Bool,
    Datetime,
    Json,
    Uuid,
}

impl FieldType {
    /// Get the string representation of the field type
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Text => "text",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::Bool => "bool",
            FieldType::Datetime => "datetime",
            FieldType::Json => "json",
            FieldType::Uuid => "uuid",
        }
    }

    /// Column affinity used for dedicated tables
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::Int | FieldType::Bool => "INTEGER",
            FieldType::Float => "REAL",
            FieldType::String
            | FieldType::Text
            | FieldType::Datetime
            | FieldType::Json
            | FieldType::Uuid => "TEXT",
        }
    }

    /// Get all field types
    pub fn all() -> &'static [FieldType] {
        &[
            FieldType::String,
            FieldType::Text,
            FieldType::Int,
            FieldType::Float,
            FieldType::Bool,
            FieldType::Datetime,
            FieldType::Json,
            FieldType::Uuid,
        ]
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "string" | "str" => Ok(FieldType::String),
            "text" => Ok(FieldType::Text),
            "int" | "integer" => Ok(FieldType::Int),
            "float" | "real" => Ok(FieldType::Float),
            "bool" | "boolean" => Ok(FieldType::Bool),
            "datetime" | "timestamp" => Ok(FieldType::Datetime),
            "json" => Ok(FieldType::Json),
            "uuid" => Ok(FieldType::Uuid),
            _ => Err(Error::InvalidFieldType(s.to_string())),
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Requested shape of a new field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            description: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A persisted field definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub id: String,
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
    pub unique: bool,
    pub indexed: bool,
    pub default: Option<Value>,
    pub description: Option<String>,
    /// Declaration order within the entity
    pub position: i64,
}

/// Requested shape of a new entity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySpec {
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
    #[serde(default)]
    pub description: Option<String>,
}

impl EntitySpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn field(mut self, field: FieldSpec) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// A persisted entity definition with its active fields in declaration order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDefinition {
    pub id: String,
    pub name: String,
    pub storage_mode: StorageMode,
    /// Present iff `storage_mode` is `Dedicated`
    pub dedicated_table_name: Option<String>,
    pub description: Option<String>,
    pub fields: Vec<FieldDefinition>,
    pub created_at: String,
    pub created_by: Option<String>,
}

impl EntityDefinition {
    /// Look up a field by name
    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Field names in declaration order
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    pub fn is_dedicated(&self) -> bool {
        self.storage_mode == StorageMode::Dedicated
    }

    /// Look up a field or fail with the list of declared fields
    pub fn require_field(&self, name: &str) -> Result<&FieldDefinition> {
        self.field(name).ok_or_else(|| Error::FieldNotFound {
            field: name.to_string(),
            entity: self.name.clone(),
            available: self.field_names(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_type_parse() {
        assert_eq!("int".parse::<FieldType>().unwrap(), FieldType::Int);
        assert_eq!("Boolean".parse::<FieldType>().unwrap(), FieldType::Bool);
        assert!(matches!(
            "money".parse::<FieldType>(),
            Err(Error::InvalidFieldType(t)) if t == "money"
        ));
        for ty in FieldType::all() {
            assert_eq!(ty.as_str().parse::<FieldType>().unwrap(), *ty);
        }
    }

    #[test]
    fn test_sql_affinity() {
        assert_eq!(FieldType::Bool.sql_type(), "INTEGER");
        assert_eq!(FieldType::Float.sql_type(), "REAL");
        assert_eq!(FieldType::Json.sql_type(), "TEXT");
    }

    #[test]
    fn test_field_spec_builder() {
        let spec = FieldSpec::new("email", FieldType::String)
            .required()
            .unique()
            .with_default("n/a");
        assert!(spec.required && spec.unique && !spec.indexed);
        assert_eq!(spec.default, Some(Value::from("n/a")));
    }

    #[test]
    fn test_storage_mode_serde() {
        let json = serde_json::to_string(&StorageMode::Dedicated).unwrap();
        assert_eq!(json, "\"dedicated\"");
        assert_eq!("SHARED".parse::<StorageMode>().unwrap(), StorageMode::Shared);
    }
}
