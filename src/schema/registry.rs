//! Schema registry - the single owner of entity and relationship metadata

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use super::catalog::{self, Change, ChangelogEntry};
use super::entity::{EntityDefinition, EntitySpec, FieldDefinition, FieldSpec, FieldType, StorageMode};
use super::naming::{
    junction_columns, junction_table_name, snake_case, validate_field_name, validate_identifier,
};
use super::relationship::{
    JunctionTable, OnDeleteAction, RelationshipDefinition, RelationshipSpec, RelationshipType,
};
use crate::relationship::junction;
use crate::storage::backend::backend_for;
use crate::storage::filter::Filter;
use crate::storage::shared::RECORDS_TABLE;
use crate::storage::sqlite::table_exists;
use crate::storage::{dedicated, value, Database};
use crate::{new_id, Error, Result};

/// Registry behavior switches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryOptions {
    /// Refuse relationships that close a cycle of CASCADE deletes
    pub reject_cascade_cycles: bool,
}

/// An entity together with its relationships and current row count
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntityDescription {
    pub entity: EntityDefinition,
    pub outgoing: Vec<RelationshipDefinition>,
    pub incoming: Vec<RelationshipDefinition>,
    pub record_count: usize,
}

/// Entity, field and relationship metadata.
///
/// Every mutation runs in one transaction together with its physical DDL and
/// its changelog entry.
#[derive(Clone)]
pub struct SchemaRegistry {
    db: Database,
    options: RegistryOptions,
}

impl SchemaRegistry {
    pub fn new(db: Database) -> Self {
        Self::with_options(db, RegistryOptions::default())
    }

    pub fn with_options(db: Database, options: RegistryOptions) -> Self {
        Self { db, options }
    }

    /// Underlying database handle
    pub fn database(&self) -> &Database {
        &self.db
    }

    // ========== Entity Operations ==========

    /// Define a new entity. New entities always start in shared storage.
    pub fn define_entity(&self, spec: EntitySpec, actor: Option<&str>) -> Result<EntityDefinition> {
        validate_identifier("entity", &spec.name)?;
        let mut seen = std::collections::HashSet::new();
        for field in &spec.fields {
            validate_field_name(&field.name)?;
            if !seen.insert(field.name.as_str()) {
                return Err(Error::FieldAlreadyExists {
                    field: field.name.clone(),
                    entity: spec.name.clone(),
                });
            }
        }

        let entity = self.db.with_transaction(|tx| {
            if catalog::entity_name_taken(tx, &spec.name)? {
                return Err(Error::EntityAlreadyExists(spec.name.clone()));
            }
            let entity = catalog::insert_entity(tx, &spec, actor)?;
            for field in &entity.fields {
                check_default(&entity.name, field)?;
            }
            catalog::log_change(
                tx,
                Change {
                    operation: "create_entity",
                    entity: Some(&entity.name),
                    new_value: Some(json!({
                        "storage_mode": StorageMode::Shared.as_str(),
                        "fields": entity.fields.iter().map(|f| json!({
                            "name": f.name,
                            "type": f.field_type.as_str(),
                        })).collect::<Vec<_>>(),
                    })),
                    actor,
                    ..Default::default()
                },
            )?;
            Ok(entity)
        })?;

        info!(entity = %entity.name, fields = entity.fields.len(), "Defined entity");
        Ok(entity)
    }

    /// Add a field to an existing entity
    pub fn add_field(
        &self,
        entity: &str,
        spec: FieldSpec,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<FieldDefinition> {
        validate_field_name(&spec.name)?;
        let field = self.db.with_transaction(|tx| {
            let def = catalog::load_entity(tx, entity)?;
            add_field_in(tx, &def, &spec, actor, reason)
        })?;
        info!(%entity, field = %field.name, "Added field");
        Ok(field)
    }

    /// Get an active entity by name
    pub fn get_entity(&self, name: &str) -> Result<EntityDefinition> {
        self.db.with_connection(|conn| catalog::load_entity(conn, name))
    }

    /// Names of all active entities
    pub fn list_entities(&self) -> Result<Vec<String>> {
        self.db.with_connection(catalog::entity_names)
    }

    /// Entity with its relationships and current record count
    pub fn describe_entity(&self, name: &str) -> Result<EntityDescription> {
        self.db.with_connection(|conn| {
            let entity = catalog::load_entity(conn, name)?;
            let outgoing = catalog::outgoing(conn, name)?;
            let incoming = catalog::incoming(conn, name)?;
            let record_count = backend_for(entity.storage_mode).count(conn, &entity, &Filter::new())?;
            Ok(EntityDescription {
                entity,
                outgoing,
                incoming,
                record_count,
            })
        })
    }

    /// Soft-disable an entity and the relationships touching it. Stored
    /// records are left in place.
    pub fn disable_entity(&self, name: &str, actor: Option<&str>, reason: Option<&str>) -> Result<()> {
        self.db.with_transaction(|tx| {
            let entity = catalog::load_entity(tx, name)?;
            if let Some((direction, status, processed, total)) = pending_job(tx, name)? {
                return Err(Error::MigrationInProgress {
                    entity: name.to_string(),
                    direction,
                    status,
                    processed,
                    total,
                });
            }
            catalog::deactivate_entity(tx, &entity.name)?;
            catalog::log_change(
                tx,
                Change {
                    operation: "disable_entity",
                    entity: Some(&entity.name),
                    old_value: Some(json!({"is_active": true})),
                    new_value: Some(json!({"is_active": false})),
                    actor,
                    reason,
                    ..Default::default()
                },
            )
        })?;
        info!(entity = %name, "Disabled entity");
        Ok(())
    }

    // ========== Relationship Operations ==========

    /// Declare a relationship from `spec.source_entity` to `spec.target_entity`.
    ///
    /// Many-to-one and one-to-one keep the foreign key on the source, one-to-many
    /// keeps it on the target, and many-to-many gets a junction table. A missing
    /// foreign key field is created as an indexed uuid field.
    pub fn add_relationship(
        &self,
        spec: RelationshipSpec,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<RelationshipDefinition> {
        validate_identifier("relationship", &spec.name)?;
        if let Some(inverse) = &spec.inverse_name {
            validate_identifier("relationship", inverse)?;
        }

        let rel = self.db.with_transaction(|tx| {
            let source = catalog::load_entity(tx, &spec.source_entity)?;
            let Some(target) = catalog::try_load_entity(tx, &spec.target_entity)? else {
                return Err(Error::TargetEntityNotFound {
                    relationship: spec.name.clone(),
                    target: spec.target_entity.clone(),
                    available: catalog::entity_names(tx)?,
                });
            };
            if catalog::try_load_relationship(tx, &source.name, &spec.name)?.is_some() {
                return Err(Error::RelationshipAlreadyExists {
                    relationship: spec.name.clone(),
                    entity: source.name.clone(),
                });
            }

            let (foreign_key_field, junction) = match spec.relationship_type {
                RelationshipType::ManyToMany => {
                    if spec.foreign_key_field.is_some() {
                        return Err(Error::validation(
                            &source.name,
                            "many_to_many relationships use a junction table and take no foreign_key_field",
                        ));
                    }
                    let table_name = junction_table_name(&source.name, &spec.name);
                    if table_exists(tx, &table_name)? {
                        return Err(Error::validation(
                            &source.name,
                            format!("junction table '{}' already exists", table_name),
                        ));
                    }
                    let (source_fk_column, target_fk_column) = junction_columns(&source.name, &target.name);
                    let junction = JunctionTable {
                        table_name,
                        source_fk_column,
                        target_fk_column,
                    };
                    junction::create_table(tx, &junction)?;
                    (None, Some(junction))
                }
                ty => {
                    let on_source = ty.foreign_key_on_source();
                    let holder = if on_source { &source } else { &target };
                    let field_name = spec.foreign_key_field.clone().unwrap_or_else(|| {
                        if on_source {
                            format!("{}_id", spec.name)
                        } else {
                            format!("{}_id", snake_case(&source.name))
                        }
                    });
                    validate_field_name(&field_name)?;
                    ensure_foreign_key_field(tx, holder, &field_name, &spec, actor, reason)?;
                    (Some(field_name), None)
                }
            };

            let rel = RelationshipDefinition {
                id: new_id(),
                name: spec.name.clone(),
                source_entity: source.name.clone(),
                target_entity: target.name.clone(),
                relationship_type: spec.relationship_type,
                foreign_key_field,
                inverse_name: spec.inverse_name.clone(),
                on_delete: spec.on_delete,
                on_update: spec.on_update,
                description: spec.description.clone(),
                is_active: true,
                junction,
            };
            catalog::insert_relationship(tx, &rel, actor)?;

            if self.options.reject_cascade_cycles && rel.on_delete == OnDeleteAction::Cascade {
                if let Some(parent) = rel.referenced_entity() {
                    if let Some(path) = catalog::cascade_cycle(tx, parent)? {
                        return Err(Error::CircularRelationship { path });
                    }
                }
            }

            catalog::log_change(
                tx,
                Change {
                    operation: "add_relationship",
                    entity: Some(&rel.source_entity),
                    new_value: Some(json!({
                        "name": rel.name,
                        "target_entity": rel.target_entity,
                        "relationship_type": rel.relationship_type.as_str(),
                        "foreign_key_field": rel.foreign_key_field,
                        "on_delete": rel.on_delete.as_str(),
                        "junction_table": rel.junction.as_ref().map(|j| j.table_name.clone()),
                    })),
                    actor,
                    reason,
                    ..Default::default()
                },
            )?;
            Ok(rel)
        })?;

        info!(
            relationship = %rel.name,
            source = %rel.source_entity,
            target = %rel.target_entity,
            kind = %rel.relationship_type,
            "Added relationship"
        );
        Ok(rel)
    }

    /// Soft-remove a relationship. The foreign key field and any junction
    /// table stay in place but are no longer maintained.
    ///
    /// Refused while a dedicated table enforces the relationship with a
    /// native foreign key: the constraint would keep acting on deletes.
    /// Dematerialize the foreign key holder first.
    pub fn remove_relationship(
        &self,
        source: &str,
        name: &str,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.db.with_transaction(|tx| {
            let rel = catalog::load_relationship(tx, source, name)?;
            if let (Some(holder), Some(field)) = (rel.foreign_key_holder(), rel.foreign_key_field.as_deref()) {
                let holder = catalog::load_entity(tx, holder)?;
                if let Some(table) = holder.dedicated_table_name.as_deref() {
                    if dedicated::native_foreign_key(tx, table, field)?.is_some() {
                        return Err(Error::storage_mode(
                            &holder.name,
                            format!(
                                "relationship '{}' is enforced by a native foreign key on '{}.{}'; dematerialize '{}' before removing it",
                                rel.name, table, field, holder.name
                            ),
                        ));
                    }
                }
            }
            catalog::deactivate_relationship(tx, &rel.id)?;
            catalog::log_change(
                tx,
                Change {
                    operation: "remove_relationship",
                    entity: Some(source),
                    old_value: Some(json!({
                        "name": rel.name,
                        "target_entity": rel.target_entity,
                        "relationship_type": rel.relationship_type.as_str(),
                    })),
                    actor,
                    reason,
                    ..Default::default()
                },
            )
        })?;
        info!(%source, relationship = %name, "Removed relationship");
        Ok(())
    }

    /// Get an active relationship by source entity and name
    pub fn get_relationship(&self, source: &str, name: &str) -> Result<RelationshipDefinition> {
        self.db.with_connection(|conn| {
            catalog::load_entity(conn, source)?;
            catalog::load_relationship(conn, source, name)
        })
    }

    /// Active relationships, optionally only those touching `entity`
    pub fn list_relationships(&self, entity: Option<&str>) -> Result<Vec<RelationshipDefinition>> {
        self.db.with_connection(|conn| {
            if let Some(name) = entity {
                catalog::load_entity(conn, name)?;
            }
            catalog::relationships(conn, entity)
        })
    }

    /// Active relationships whose target is `entity`
    pub fn get_incoming_relationships(&self, entity: &str) -> Result<Vec<RelationshipDefinition>> {
        self.db.with_connection(|conn| {
            catalog::load_entity(conn, entity)?;
            catalog::incoming(conn, entity)
        })
    }

    /// A cycle of CASCADE relationships passing through `entity`, if any
    pub fn cascade_cycle(&self, entity: &str) -> Result<Option<Vec<String>>> {
        self.db.with_connection(|conn| {
            catalog::load_entity(conn, entity)?;
            catalog::cascade_cycle(conn, entity)
        })
    }

    /// Most recent schema changes, newest first
    pub fn changelog(&self, entity: Option<&str>, limit: usize) -> Result<Vec<ChangelogEntry>> {
        self.db.with_connection(|conn| catalog::changelog(conn, entity, limit))
    }
}

/// Add a field inside an open transaction, altering the dedicated table
/// when the entity is materialized.
fn add_field_in(
    conn: &rusqlite::Connection,
    entity: &EntityDefinition,
    spec: &FieldSpec,
    actor: Option<&str>,
    reason: Option<&str>,
) -> Result<FieldDefinition> {
    if entity.field(&spec.name).is_some() {
        return Err(Error::FieldAlreadyExists {
            field: spec.name.clone(),
            entity: entity.name.clone(),
        });
    }
    if let Some((direction, status, processed, total)) = pending_job(conn, &entity.name)? {
        return Err(Error::MigrationInProgress {
            entity: entity.name.clone(),
            direction,
            status,
            processed,
            total,
        });
    }

    let field = catalog::insert_field(conn, entity, spec, actor)?;
    check_default(&entity.name, &field)?;

    match (entity.storage_mode, entity.dedicated_table_name.as_deref()) {
        (StorageMode::Dedicated, Some(table)) => {
            dedicated::add_column(conn, table, &field)?;
        }
        _ if field.unique => {
            let path = format!("$.{}", field.name);
            let duplicates: i64 = conn.query_row(
                &format!(
                    "SELECT COUNT(*) FROM (SELECT json_extract(data, ?1) AS v FROM {}
                     WHERE entity_id = ?2 AND v IS NOT NULL GROUP BY v HAVING COUNT(*) > 1)",
                    RECORDS_TABLE
                ),
                rusqlite::params![path, entity.id],
                |row| row.get(0),
            )?;
            if duplicates > 0 {
                return Err(Error::validation(
                    &entity.name,
                    format!("existing records hold duplicate values for unique field '{}'", field.name),
                ));
            }
        }
        _ => {}
    }

    catalog::log_change(
        conn,
        Change {
            operation: "add_field",
            entity: Some(&entity.name),
            field: Some(&field.name),
            new_value: Some(json!({
                "type": field.field_type.as_str(),
                "required": field.required,
                "unique": field.unique,
                "indexed": field.indexed,
                "default": field.default,
            })),
            actor,
            reason,
            ..Default::default()
        },
    )?;
    debug!(entity = %entity.name, field = %field.name, position = field.position, "Field persisted");
    Ok(field)
}

/// Reuse or create the field holding a relationship's foreign key
fn ensure_foreign_key_field(
    conn: &rusqlite::Connection,
    holder: &EntityDefinition,
    field_name: &str,
    spec: &RelationshipSpec,
    actor: Option<&str>,
    reason: Option<&str>,
) -> Result<()> {
    match holder.field(field_name) {
        Some(existing) => {
            if !matches!(existing.field_type, FieldType::Uuid | FieldType::String) {
                return Err(Error::validation(
                    &holder.name,
                    format!(
                        "foreign key field '{}' must be uuid or string, found {}",
                        field_name, existing.field_type
                    ),
                ));
            }
            if existing.required && spec.on_delete == OnDeleteAction::SetNull {
                return Err(Error::validation(
                    &holder.name,
                    format!(
                        "foreign key field '{}' is required and cannot be cleared by SET_NULL; use CASCADE or RESTRICT",
                        field_name
                    ),
                ));
            }
            Ok(())
        }
        None => {
            let mut field = FieldSpec::new(field_name, FieldType::Uuid)
                .indexed()
                .with_description(format!("Foreign key for relationship '{}'", spec.name));
            if spec.relationship_type == RelationshipType::OneToOne {
                field = field.unique();
            }
            add_field_in(conn, holder, &field, actor, reason).map(|_| ())
        }
    }
}

fn check_default(entity: &str, field: &FieldDefinition) -> Result<()> {
    if let Some(default) = &field.default {
        value::coerce(entity, field, default.clone())?;
    }
    Ok(())
}

/// Direction, status and progress of a migration job holding the entity
fn pending_job(
    conn: &rusqlite::Connection,
    entity: &str,
) -> Result<Option<(String, String, usize, usize)>> {
    use rusqlite::OptionalExtension;
    let row = conn
        .query_row(
            "SELECT direction, status, processed_count, total_count FROM kdb_migration_jobs WHERE entity_name = ?1",
            [entity],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)? as usize,
                    row.get::<_, i64>(3)? as usize,
                ))
            },
        )
        .optional()?;
    Ok(row)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> SchemaRegistry {
        SchemaRegistry::new(Database::open_in_memory().unwrap())
    }

    fn customer() -> EntitySpec {
        EntitySpec::new("Customer")
            .field(FieldSpec::new("name", FieldType::String).required())
            .field(FieldSpec::new("email", FieldType::String).unique())
    }

    #[test]
    fn test_define_and_get_entity() {
        let reg = registry();
        let def = reg.define_entity(customer(), Some("agent")).unwrap();
        assert_eq!(def.storage_mode, StorageMode::Shared);
        assert!(def.dedicated_table_name.is_none());

        let loaded = reg.get_entity("Customer").unwrap();
        assert_eq!(loaded.field_names(), vec!["name", "email"]);
        assert_eq!(loaded.fields[1].position, 1);
        assert_eq!(reg.list_entities().unwrap(), vec!["Customer"]);
    }

    #[test]
    fn test_duplicate_entity_rejected() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        let err = reg.define_entity(customer(), None).unwrap_err();
        assert!(matches!(err, Error::EntityAlreadyExists(_)));
    }

    #[test]
    fn test_invalid_names_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.define_entity(EntitySpec::new("bad name"), None),
            Err(Error::InvalidIdentifier { .. })
        ));
        let reserved = EntitySpec::new("Thing").field(FieldSpec::new("id", FieldType::String));
        assert!(matches!(
            reg.define_entity(reserved, None),
            Err(Error::InvalidIdentifier { .. })
        ));
        assert!(reg.list_entities().unwrap().is_empty());
    }

    #[test]
    fn test_add_field_appends_and_logs() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        let field = reg
            .add_field(
                "Customer",
                FieldSpec::new("tier", FieldType::String).with_default("basic"),
                Some("agent"),
                Some("segmenting"),
            )
            .unwrap();
        assert_eq!(field.position, 2);

        let err = reg
            .add_field("Customer", FieldSpec::new("tier", FieldType::Int), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::FieldAlreadyExists { .. }));

        let log = reg.changelog(Some("Customer"), 10).unwrap();
        assert_eq!(log[0].operation, "add_field");
        assert_eq!(log[0].reason.as_deref(), Some("segmenting"));
    }

    #[test]
    fn test_bad_default_rejected_atomically() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        let err = reg
            .add_field(
                "Customer",
                FieldSpec::new("age", FieldType::Int).with_default("old"),
                None,
                None,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
        assert!(reg.get_entity("Customer").unwrap().field("age").is_none());
    }

    #[test]
    fn test_many_to_one_creates_foreign_key() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();

        let rel = reg
            .add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();
        assert_eq!(rel.foreign_key_field.as_deref(), Some("customer_id"));
        assert_eq!(rel.on_delete, OnDeleteAction::SetNull);

        let order = reg.get_entity("Order").unwrap();
        let fk = order.field("customer_id").unwrap();
        assert_eq!(fk.field_type, FieldType::Uuid);
        assert!(fk.indexed);

        let incoming = reg.get_incoming_relationships("Customer").unwrap();
        assert_eq!(incoming.len(), 1);
        assert_eq!(incoming[0].source_entity, "Order");
    }

    #[test]
    fn test_one_to_many_places_key_on_target() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Invoice"), None).unwrap();
        let rel = reg
            .add_relationship(
                RelationshipSpec::new("invoices", "Customer", "Invoice", RelationshipType::OneToMany),
                None,
                None,
            )
            .unwrap();
        assert_eq!(rel.foreign_key_field.as_deref(), Some("customer_id"));
        assert!(reg.get_entity("Invoice").unwrap().field("customer_id").is_some());
        assert!(reg.get_entity("Customer").unwrap().field("customer_id").is_none());
    }

    #[test]
    fn test_relationship_errors() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();

        let err = reg
            .add_relationship(RelationshipSpec::many_to_one("vendor", "Order", "Vendor"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::TargetEntityNotFound { .. }));

        let err = reg
            .add_relationship(RelationshipSpec::many_to_one("customer", "Ghost", "Customer"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));

        reg.add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();
        let err = reg
            .add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap_err();
        assert!(matches!(err, Error::RelationshipAlreadyExists { .. }));
    }

    #[test]
    fn test_many_to_many_creates_junction() {
        let reg = registry();
        reg.define_entity(EntitySpec::new("Student"), None).unwrap();
        reg.define_entity(EntitySpec::new("Course"), None).unwrap();
        let rel = reg
            .add_relationship(RelationshipSpec::many_to_many("courses", "Student", "Course"), None, None)
            .unwrap();
        let junction = rel.junction.unwrap();
        assert_eq!(junction.table_name, "jt_student_courses");
        assert_eq!(junction.source_fk_column, "student_id");
        assert_eq!(junction.target_fk_column, "course_id");
        reg.database()
            .with_connection(|conn| {
                assert!(table_exists(conn, "jt_student_courses")?);
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_remove_relationship_allows_redefinition() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();
        reg.add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();
        reg.remove_relationship("Order", "customer", None, Some("rework"))
            .unwrap();
        assert!(reg.list_relationships(Some("Order")).unwrap().is_empty());

        // existing customer_id field is reused
        let rel = reg
            .add_relationship(
                RelationshipSpec::many_to_one("customer", "Order", "Customer")
                    .foreign_key("customer_id")
                    .on_delete(OnDeleteAction::Restrict),
                None,
                None,
            )
            .unwrap();
        assert_eq!(rel.on_delete, OnDeleteAction::Restrict);
    }

    #[test]
    fn test_remove_natively_enforced_relationship_refused() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();
        reg.add_relationship(
            RelationshipSpec::many_to_one("customer", "Order", "Customer").on_delete(OnDeleteAction::Cascade),
            None,
            None,
        )
        .unwrap();
        let engine = crate::migration::MigrationEngine::new(&reg);
        engine.materialize("Customer", 10, None, None, |_| {}).unwrap();
        engine.materialize("Order", 10, None, None, |_| {}).unwrap();

        let err = reg
            .remove_relationship("Order", "customer", None, None)
            .unwrap_err();
        assert!(matches!(err, Error::StorageMode { .. }));
        assert!(err.to_string().contains("dematerialize 'Order'"));
        assert_eq!(reg.list_relationships(Some("Order")).unwrap().len(), 1);

        // Once the holder is back in shared mode no native constraint remains
        engine.dematerialize("Order", 10, None, None, |_| {}).unwrap();
        reg.remove_relationship("Order", "customer", None, None).unwrap();
        assert!(reg.list_relationships(Some("Order")).unwrap().is_empty());
    }

    #[test]
    fn test_remove_without_native_constraint_allowed_when_dedicated() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();
        reg.add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();
        // Order materialized while Customer is shared: no native foreign key
        crate::migration::MigrationEngine::new(&reg)
            .materialize("Order", 10, None, None, |_| {})
            .unwrap();
        reg.remove_relationship("Order", "customer", None, None).unwrap();
        assert!(reg.list_relationships(Some("Order")).unwrap().is_empty());
    }

    #[test]
    fn test_cascade_cycle_detection() {
        let db = Database::open_in_memory().unwrap();
        let strict = SchemaRegistry::with_options(
            db,
            RegistryOptions {
                reject_cascade_cycles: true,
            },
        );
        strict.define_entity(EntitySpec::new("A"), None).unwrap();
        strict.define_entity(EntitySpec::new("B"), None).unwrap();
        strict
            .add_relationship(
                RelationshipSpec::many_to_one("a", "B", "A").on_delete(OnDeleteAction::Cascade),
                None,
                None,
            )
            .unwrap();
        let err = strict
            .add_relationship(
                RelationshipSpec::many_to_one("b", "A", "B").on_delete(OnDeleteAction::Cascade),
                None,
                None,
            )
            .unwrap_err();
        match err {
            Error::CircularRelationship { path } => assert_eq!(path, vec!["B", "A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
        // rolled back: no b_id field was left behind
        assert!(strict.get_entity("A").unwrap().field("b_id").is_none());
    }

    #[test]
    fn test_cycles_allowed_by_default() {
        let reg = registry();
        reg.define_entity(EntitySpec::new("Employee"), None).unwrap();
        reg.add_relationship(
            RelationshipSpec::many_to_one("manager", "Employee", "Employee")
                .on_delete(OnDeleteAction::Cascade),
            None,
            None,
        )
        .unwrap();
        let cycle = reg.cascade_cycle("Employee").unwrap().unwrap();
        assert_eq!(cycle, vec!["Employee", "Employee"]);
    }

    #[test]
    fn test_describe_and_disable() {
        let reg = registry();
        reg.define_entity(customer(), None).unwrap();
        reg.define_entity(EntitySpec::new("Order"), None).unwrap();
        reg.add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();

        let desc = reg.describe_entity("Customer").unwrap();
        assert_eq!(desc.record_count, 0);
        assert_eq!(desc.incoming.len(), 1);

        reg.disable_entity("Order", None, Some("obsolete")).unwrap();
        assert_eq!(reg.list_entities().unwrap(), vec!["Customer"]);
        assert!(reg.get_incoming_relationships("Customer").unwrap().is_empty());
        assert!(matches!(
            reg.get_entity("Order"),
            Err(Error::EntityNotFound { .. })
        ));
    }
}
