//! # Hybridb - Hybrid Storage & Relationship Engine
//!
//! Records of an entity live either in one shared, schema-flexible document
//! table or in a dedicated typed table with native constraints. The engine
//! moves entities between the two representations without data loss.
//!
//! Hybridb provides:
//! - A metadata registry for entities, fields, relationships and junction tables
//! - One CRUD contract routed transparently to the shared or dedicated backend
//! - Relationship enforcement (cascade, set-null, restrict, many-to-many links)
//! - Batched, resumable migrations between storage modes
//! - Query metrics and materialization advice

pub mod config;
pub mod db;
pub mod metrics;
pub mod migration;
pub mod relationship;
pub mod schema;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use db::Hybridb;
pub use metrics::{
    AccessWindow, EntityStats, MaterializationAdvisor, MaterializationPolicy,
    MaterializationSuggestion, MetricsCollector, Priority, QueryMetric,
};
pub use migration::{
    MigrationDirection, MigrationEngine, MigrationJob, MigrationProgress, MigrationReport,
    MigrationStep,
};
pub use relationship::{DeleteOptions, DeleteOutcome, RelationshipEnforcer, RestrictViolation};
pub use schema::{
    EntityDefinition, EntitySpec, FieldDefinition, FieldSpec, FieldType, OnDeleteAction,
    RelationshipDefinition, RelationshipSpec, RelationshipType, SchemaRegistry, StorageMode,
};
pub use storage::{Database, Document, Filter, FilterOp, Record, StorageRouter};

/// Result type alias for Hybridb operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Hybridb operations
///
/// Validation errors are raised before any mutation. Messages name the
/// offending entity or relationship and how to proceed.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Entity '{entity}' not found. {}", available_hint("entities", available))]
    EntityNotFound { entity: String, available: Vec<String> },

    #[error("Entity '{0}' already exists. Pick a different name or add fields to the existing entity.")]
    EntityAlreadyExists(String),

    #[error("Field '{field}' not found on '{entity}'. {}", available_hint("fields", available))]
    FieldNotFound {
        field: String,
        entity: String,
        available: Vec<String>,
    },

    #[error("Field '{field}' already exists on '{entity}'.")]
    FieldAlreadyExists { field: String, entity: String },

    #[error("Invalid field type '{0}'. Valid types: string, text, int, float, bool, datetime, json, uuid")]
    InvalidFieldType(String),

    #[error("Invalid {kind} name '{name}': {reason}")]
    InvalidIdentifier {
        kind: &'static str,
        name: String,
        reason: String,
    },

    #[error("Invalid relationship type '{0}'. Valid types: many_to_one, one_to_many, many_to_many, one_to_one")]
    InvalidRelationshipType(String),

    #[error("Invalid on_delete action '{0}'. Valid actions: CASCADE, SET_NULL, RESTRICT, NO_ACTION")]
    InvalidOnDeleteAction(String),

    #[error("Relationship '{relationship}' targets unknown entity '{target}'. {}", available_hint("entities", available))]
    TargetEntityNotFound {
        relationship: String,
        target: String,
        available: Vec<String>,
    },

    #[error("Relationship '{relationship}' already exists on '{entity}'. Use a different name or remove the existing relationship first.")]
    RelationshipAlreadyExists { relationship: String, entity: String },

    #[error("Relationship '{relationship}' not found on '{entity}'. {}", available_hint("relationships", available))]
    RelationshipNotFound {
        relationship: String,
        entity: String,
        available: Vec<String>,
    },

    #[error(
        "Cannot delete {entity} '{id}': {count} related {related_entity} records exist via '{relationship}' ({action}). Delete related records first or retry with force=true."
    )]
    RestrictDelete {
        entity: String,
        id: String,
        related_entity: String,
        relationship: String,
        action: OnDeleteAction,
        count: usize,
    },

    #[error(
        "Cannot delete {entity} '{id}' without cascade: {count} related {related_entity} records reference it via '{relationship}' ({action}). Enable cascade, delete them first, or retry with force=true to detach them."
    )]
    DependentsExist {
        entity: String,
        id: String,
        related_entity: String,
        relationship: String,
        action: OnDeleteAction,
        count: usize,
    },

    #[error("Circular CASCADE relationship detected: {}. Use SET_NULL or RESTRICT on one of the links.", path.join(" -> "))]
    CircularRelationship { path: Vec<String> },

    #[error("Storage mode error on '{entity}': {message}")]
    StorageMode { entity: String, message: String },

    #[error("A {direction} migration of '{entity}' is already {status} ({processed}/{total} records). Resume or abort it before starting another.")]
    MigrationInProgress {
        entity: String,
        direction: String,
        status: String,
        processed: usize,
        total: usize,
    },

    #[error("Migration of '{entity}' ({direction}) failed after {processed}/{total} records: {message}")]
    Migration {
        entity: String,
        direction: String,
        processed: usize,
        total: usize,
        message: String,
    },

    #[error("Cannot link via '{relationship}': {target_entity} record '{id}' does not exist.")]
    LinkTargetNotFound {
        relationship: String,
        target_entity: String,
        id: String,
    },

    #[error("Record '{id}' not found in '{entity}'.")]
    RecordNotFound { entity: String, id: String },

    #[error("Validation failed for '{entity}': {message}")]
    Validation { entity: String, message: String },

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn validation(entity: &str, message: impl Into<String>) -> Self {
        Error::Validation {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    pub(crate) fn storage_mode(entity: &str, message: impl Into<String>) -> Self {
        Error::StorageMode {
            entity: entity.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable name of the error kind
    pub fn code(&self) -> &'static str {
        match self {
            Error::EntityNotFound { .. } => "EntityNotFoundError",
            Error::EntityAlreadyExists(_) => "EntityAlreadyExistsError",
            Error::FieldNotFound { .. } => "FieldNotFoundError",
            Error::FieldAlreadyExists { .. } => "FieldAlreadyExistsError",
            Error::InvalidFieldType(_) => "InvalidFieldTypeError",
            Error::InvalidIdentifier { .. } => "InvalidIdentifierError",
            Error::InvalidRelationshipType(_) => "InvalidRelationshipTypeError",
            Error::InvalidOnDeleteAction(_) => "InvalidOnDeleteActionError",
            Error::TargetEntityNotFound { .. } => "TargetEntityNotFoundError",
            Error::RelationshipAlreadyExists { .. } => "RelationshipAlreadyExistsError",
            Error::RelationshipNotFound { .. } => "RelationshipNotFoundError",
            Error::RestrictDelete { .. } => "RestrictDeleteError",
            Error::DependentsExist { .. } => "DependentsExistError",
            Error::CircularRelationship { .. } => "CircularRelationshipError",
            Error::StorageMode { .. } => "StorageModeError",
            Error::MigrationInProgress { .. } => "MigrationInProgressError",
            Error::Migration { .. } => "MigrationError",
            Error::LinkTargetNotFound { .. } => "LinkTargetNotFoundError",
            Error::RecordNotFound { .. } => "RecordNotFoundError",
            Error::Validation { .. } => "ValidationError",
            Error::Storage(_) => "StorageError",
            Error::Json(_) => "JsonError",
            Error::Io(_) => "IoError",
        }
    }

    /// Render as `{error, message, context}` for agent and CLI consumption
    pub fn to_json(&self) -> serde_json::Value {
        let context = match self {
            Error::RestrictDelete {
                entity,
                id,
                related_entity,
                relationship,
                action,
                count,
            } => serde_json::json!({
                "entity_name": entity,
                "record_id": id,
                "related_entity": related_entity,
                "relationship": relationship,
                "on_delete": action.as_str(),
                "related_count": count,
                "suggestion": "delete related records first or retry with force=true",
            }),
            Error::DependentsExist {
                entity,
                id,
                related_entity,
                relationship,
                action,
                count,
            } => serde_json::json!({
                "entity_name": entity,
                "record_id": id,
                "related_entity": related_entity,
                "relationship": relationship,
                "on_delete": action.as_str(),
                "related_count": count,
                "suggestion": "delete with cascade enabled, or retry with force=true to detach them",
            }),
            Error::Migration {
                entity,
                direction,
                processed,
                total,
                ..
            } => serde_json::json!({
                "entity_name": entity,
                "direction": direction,
                "processed_count": processed,
                "total_count": total,
            }),
            Error::EntityNotFound { entity, available } => serde_json::json!({
                "entity_name": entity,
                "available_entities": available,
            }),
            Error::FieldNotFound {
                field,
                entity,
                available,
            } => serde_json::json!({
                "field_name": field,
                "entity_name": entity,
                "available_fields": available,
            }),
            _ => serde_json::json!({}),
        };
        serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
            "context": context,
        })
    }
}

fn available_hint(kind: &str, available: &[String]) -> String {
    if available.is_empty() {
        format!("No {} defined yet.", kind)
    } else {
        format!("Available {}: {}", kind, available.join(", "))
    }
}

/// Current UTC time as a fixed-width RFC 3339 string (microsecond precision)
///
/// Fixed width keeps lexical and chronological order identical, which the
/// metrics window and migration reconciliation rely on.
pub(crate) fn now_timestamp() -> String {
    timestamp_of(chrono::Utc::now())
}

pub(crate) fn timestamp_of(at: chrono::DateTime<chrono::Utc>) -> String {
    at.to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restrict_message_is_actionable() {
        let err = Error::RestrictDelete {
            entity: "Customer".into(),
            id: "c1".into(),
            related_entity: "Order".into(),
            relationship: "customer".into(),
            action: OnDeleteAction::Restrict,
            count: 12,
        };
        let msg = err.to_string();
        assert!(msg.contains("12 related Order records"));
        assert!(msg.contains("(RESTRICT)"));
        assert!(msg.contains("force=true"));
        assert_eq!(err.to_json()["context"]["related_count"], 12);
        assert_eq!(err.to_json()["context"]["on_delete"], "RESTRICT");
    }

    #[test]
    fn test_dependents_exist_names_the_way_out() {
        let err = Error::DependentsExist {
            entity: "Customer".into(),
            id: "c1".into(),
            related_entity: "Order".into(),
            relationship: "customer".into(),
            action: OnDeleteAction::Cascade,
            count: 2,
        };
        assert!(err.to_string().contains("without cascade"));
        assert!(err.to_string().contains("Enable cascade"));
        assert_eq!(err.code(), "DependentsExistError");
    }

    #[test]
    fn test_not_found_lists_available() {
        let err = Error::EntityNotFound {
            entity: "Contact".into(),
            available: vec!["Customer".into(), "Order".into()],
        };
        assert!(err.to_string().contains("Available entities: Customer, Order"));

        let empty = Error::EntityNotFound {
            entity: "Contact".into(),
            available: vec![],
        };
        assert!(empty.to_string().contains("No entities defined yet"));
    }

    #[test]
    fn test_timestamps_are_fixed_width() {
        let a = now_timestamp();
        let b = now_timestamp();
        assert_eq!(a.len(), b.len());
        assert!(a <= b);
        assert!(a.ends_with('Z'));
    }
}
