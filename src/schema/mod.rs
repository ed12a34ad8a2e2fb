//! Schema metadata - entities, fields and relationships
//!
//! The registry is the single owner of metadata. Other components read it
//! through the registry or the connection-scoped catalog functions; only
//! migrations change an entity's storage mode.

pub(crate) mod catalog;
pub mod entity;
pub mod naming;
pub mod registry;
pub mod relationship;

pub use catalog::ChangelogEntry;
pub use entity::{EntityDefinition, EntitySpec, FieldDefinition, FieldSpec, FieldType, StorageMode};
pub use naming::SYSTEM_FIELDS;
pub use registry::{EntityDescription, RegistryOptions, SchemaRegistry};
pub use relationship::{
    JunctionTable, OnDeleteAction, RelationshipDefinition, RelationshipSpec, RelationshipType,
};
