//! Connection-scoped metadata queries
//!
//! These functions read and write the `kdb_*` metadata tables on a
//! connection the caller already holds, so registry, router, enforcer and
//! migration code can combine them inside one transaction.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::{EntityDefinition, EntitySpec, FieldDefinition, FieldSpec, StorageMode};
use super::relationship::{JunctionTable, OnDeleteAction, RelationshipDefinition};
use crate::storage::dedicated::ForeignKeyConstraint;
use crate::{new_id, now_timestamp, Error, Result};

/// An entry of the append-only schema changelog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangelogEntry {
    pub id: String,
    pub timestamp: String,
    pub operation: String,
    pub entity_name: Option<String>,
    pub field_name: Option<String>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub created_by: Option<String>,
    pub reason: Option<String>,
}

/// Builder for a changelog row
#[derive(Debug, Default)]
pub(crate) struct Change<'a> {
    pub operation: &'a str,
    pub entity: Option<&'a str>,
    pub field: Option<&'a str>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub actor: Option<&'a str>,
    pub reason: Option<&'a str>,
}

/// A relationship whose deletion semantics apply when a parent row goes away
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Dependent {
    pub relationship: String,
    pub child_entity: String,
    pub foreign_key_field: String,
    pub on_delete: OnDeleteAction,
}

/// A junction table side that references an entity
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct JunctionSide {
    pub relationship: String,
    pub table_name: String,
    pub column: String,
}

// ========== Entity Operations ==========

/// Names of all active entities, sorted
pub(crate) fn entity_names(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT name FROM kdb_entity_definitions WHERE is_active = 1 ORDER BY name")?;
    let names = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
}

fn row_to_entity(row: &Row) -> rusqlite::Result<EntityDefinition> {
    let mode: String = row.get(2)?;
    Ok(EntityDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        storage_mode: if mode == "dedicated" {
            StorageMode::Dedicated
        } else {
            StorageMode::Shared
        },
        dedicated_table_name: row.get(3)?,
        description: row.get(4)?,
        fields: Vec::new(),
        created_at: row.get(5)?,
        created_by: row.get(6)?,
    })
}

/// Load an active entity with its fields, if it exists
pub(crate) fn try_load_entity(conn: &Connection, name: &str) -> Result<Option<EntityDefinition>> {
    let entity = conn
        .query_row(
            "SELECT id, name, storage_mode, dedicated_table_name, description, created_at, created_by
             FROM kdb_entity_definitions WHERE name = ?1 AND is_active = 1",
            [name],
            row_to_entity,
        )
        .optional()?;
    match entity {
        Some(mut entity) => {
            entity.fields = load_fields(conn, &entity.id)?;
            Ok(Some(entity))
        }
        None => Ok(None),
    }
}

/// Load an active entity or fail listing the available ones
pub(crate) fn load_entity(conn: &Connection, name: &str) -> Result<EntityDefinition> {
    match try_load_entity(conn, name)? {
        Some(entity) => Ok(entity),
        None => Err(Error::EntityNotFound {
            entity: name.to_string(),
            available: entity_names(conn)?,
        }),
    }
}

/// Whether any entity row (active or disabled) uses the name
pub(crate) fn entity_name_taken(conn: &Connection, name: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM kdb_entity_definitions WHERE name = ?1 COLLATE NOCASE",
            [name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

fn load_fields(conn: &Connection, entity_id: &str) -> Result<Vec<FieldDefinition>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, field_type, is_required, is_unique, is_indexed, default_value, description, position
         FROM kdb_field_definitions WHERE entity_id = ?1 AND is_active = 1 ORDER BY position",
    )?;
    let rows = stmt
        .query_map([entity_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, i64>(8)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, name, ty, required, unique, indexed, default, description, position)| {
                Ok(FieldDefinition {
                    id,
                    name,
                    field_type: ty.parse()?,
                    required,
                    unique,
                    indexed,
                    default: default.map(|d| serde_json::from_str(&d)).transpose()?,
                    description,
                    position,
                })
            },
        )
        .collect()
}

/// Insert a new shared-mode entity and its fields
pub(crate) fn insert_entity(
    conn: &Connection,
    spec: &EntitySpec,
    actor: Option<&str>,
) -> Result<EntityDefinition> {
    let now = now_timestamp();
    let id = new_id();
    conn.execute(
        "INSERT INTO kdb_entity_definitions (id, name, storage_mode, description, created_at, updated_at, created_by)
         VALUES (?1, ?2, 'shared', ?3, ?4, ?4, ?5)",
        params![id, spec.name, spec.description, now, actor],
    )?;
    let mut entity = EntityDefinition {
        id,
        name: spec.name.clone(),
        storage_mode: StorageMode::Shared,
        dedicated_table_name: None,
        description: spec.description.clone(),
        fields: Vec::new(),
        created_at: now,
        created_by: actor.map(str::to_string),
    };
    for field in &spec.fields {
        let def = insert_field(conn, &entity, field, actor)?;
        entity.fields.push(def);
    }
    Ok(entity)
}

/// Append a field definition after the entity's last field
pub(crate) fn insert_field(
    conn: &Connection,
    entity: &EntityDefinition,
    spec: &FieldSpec,
    actor: Option<&str>,
) -> Result<FieldDefinition> {
    let position: i64 = conn.query_row(
        "SELECT COALESCE(MAX(position) + 1, 0) FROM kdb_field_definitions WHERE entity_id = ?1",
        [&entity.id],
        |row| row.get(0),
    )?;
    let id = new_id();
    let default = spec.default.as_ref().map(serde_json::to_string).transpose()?;
    conn.execute(
        "INSERT INTO kdb_field_definitions
            (id, entity_id, name, field_type, is_required, is_unique, is_indexed, default_value, description, position, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            id,
            entity.id,
            spec.name,
            spec.field_type.as_str(),
            spec.required,
            spec.unique,
            spec.indexed,
            default,
            spec.description,
            position,
            now_timestamp(),
            actor,
        ],
    )?;
    Ok(FieldDefinition {
        id,
        name: spec.name.clone(),
        field_type: spec.field_type,
        required: spec.required,
        unique: spec.unique,
        indexed: spec.indexed,
        default: spec.default.clone(),
        description: spec.description.clone(),
        position,
    })
}

/// Flip an entity's storage mode. Only migrations call this.
pub(crate) fn set_storage_mode(
    conn: &Connection,
    entity: &str,
    mode: StorageMode,
    dedicated_table: Option<&str>,
) -> Result<()> {
    conn.execute(
        "UPDATE kdb_entity_definitions SET storage_mode = ?1, dedicated_table_name = ?2, updated_at = ?3
         WHERE name = ?4 AND is_active = 1",
        params![mode.as_str(), dedicated_table, now_timestamp(), entity],
    )?;
    Ok(())
}

pub(crate) fn deactivate_entity(conn: &Connection, entity: &str) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        "UPDATE kdb_entity_definitions SET is_active = 0, updated_at = ?1 WHERE name = ?2",
        params![now, entity],
    )?;
    conn.execute(
        "UPDATE kdb_relationship_definitions SET is_active = 0
         WHERE source_entity = ?1 OR target_entity = ?1",
        [entity],
    )?;
    Ok(())
}

/// Table names of every active dedicated entity
pub(crate) fn dedicated_tables(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT dedicated_table_name FROM kdb_entity_definitions
         WHERE is_active = 1 AND storage_mode = 'dedicated' AND dedicated_table_name IS NOT NULL",
    )?;
    let tables = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(tables)
}

// ========== Relationship Operations ==========

const RELATIONSHIP_COLUMNS: &str = "r.id, r.name, r.source_entity, r.target_entity, r.relationship_type,
    r.foreign_key_field, r.inverse_name, r.on_delete, r.on_update, r.description, r.is_active,
    j.table_name, j.source_fk_column, j.target_fk_column";

fn row_to_relationship(row: &Row) -> rusqlite::Result<RawRelationship> {
    Ok(RawRelationship {
        id: row.get(0)?,
        name: row.get(1)?,
        source_entity: row.get(2)?,
        target_entity: row.get(3)?,
        relationship_type: row.get(4)?,
        foreign_key_field: row.get(5)?,
        inverse_name: row.get(6)?,
        on_delete: row.get(7)?,
        on_update: row.get(8)?,
        description: row.get(9)?,
        is_active: row.get(10)?,
        junction_table: row.get(11)?,
        junction_source: row.get(12)?,
        junction_target: row.get(13)?,
    })
}

struct RawRelationship {
    id: String,
    name: String,
    source_entity: String,
    target_entity: String,
    relationship_type: String,
    foreign_key_field: Option<String>,
    inverse_name: Option<String>,
    on_delete: String,
    on_update: String,
    description: Option<String>,
    is_active: bool,
    junction_table: Option<String>,
    junction_source: Option<String>,
    junction_target: Option<String>,
}

impl RawRelationship {
    fn into_definition(self) -> Result<RelationshipDefinition> {
        let junction = match (self.junction_table, self.junction_source, self.junction_target) {
            (Some(table_name), Some(source_fk_column), Some(target_fk_column)) => Some(JunctionTable {
                table_name,
                source_fk_column,
                target_fk_column,
            }),
            _ => None,
        };
        Ok(RelationshipDefinition {
            id: self.id,
            name: self.name,
            source_entity: self.source_entity,
            target_entity: self.target_entity,
            relationship_type: self.relationship_type.parse()?,
            foreign_key_field: self.foreign_key_field,
            inverse_name: self.inverse_name,
            on_delete: self.on_delete.parse()?,
            on_update: self.on_update.parse()?,
            description: self.description,
            is_active: self.is_active,
            junction,
        })
    }
}

fn query_relationships(
    conn: &Connection,
    condition: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<Vec<RelationshipDefinition>> {
    let sql = format!(
        "SELECT {} FROM kdb_relationship_definitions r
         LEFT JOIN kdb_junction_tables j ON j.relationship_id = r.id
         WHERE r.is_active = 1 AND {} ORDER BY r.source_entity, r.name",
        RELATIONSHIP_COLUMNS, condition
    );
    let mut stmt = conn.prepare(&sql)?;
    let raw = stmt
        .query_map(params, row_to_relationship)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    raw.into_iter().map(RawRelationship::into_definition).collect()
}

/// All active relationships, optionally only those touching `entity`
pub(crate) fn relationships(conn: &Connection, entity: Option<&str>) -> Result<Vec<RelationshipDefinition>> {
    match entity {
        Some(name) => query_relationships(
            conn,
            "(r.source_entity = ?1 OR r.target_entity = ?1)",
            &[&name],
        ),
        None => query_relationships(conn, "1 = 1", &[]),
    }
}

/// Active relationships whose source is `entity`
pub(crate) fn outgoing(conn: &Connection, entity: &str) -> Result<Vec<RelationshipDefinition>> {
    query_relationships(conn, "r.source_entity = ?1", &[&entity])
}

/// Active relationships whose target is `entity`
pub(crate) fn incoming(conn: &Connection, entity: &str) -> Result<Vec<RelationshipDefinition>> {
    query_relationships(conn, "r.target_entity = ?1", &[&entity])
}

pub(crate) fn try_load_relationship(
    conn: &Connection,
    source: &str,
    name: &str,
) -> Result<Option<RelationshipDefinition>> {
    Ok(query_relationships(conn, "r.source_entity = ?1 AND r.name = ?2", &[&source, &name])?
        .into_iter()
        .next())
}

pub(crate) fn load_relationship(conn: &Connection, source: &str, name: &str) -> Result<RelationshipDefinition> {
    match try_load_relationship(conn, source, name)? {
        Some(rel) => Ok(rel),
        None => Err(Error::RelationshipNotFound {
            relationship: name.to_string(),
            entity: source.to_string(),
            available: outgoing(conn, source)?.into_iter().map(|r| r.name).collect(),
        }),
    }
}

pub(crate) fn insert_relationship(
    conn: &Connection,
    rel: &RelationshipDefinition,
    actor: Option<&str>,
) -> Result<()> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO kdb_relationship_definitions
            (id, name, source_entity, target_entity, relationship_type, foreign_key_field, inverse_name,
             on_delete, on_update, description, is_active, created_at, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1, ?11, ?12)",
        params![
            rel.id,
            rel.name,
            rel.source_entity,
            rel.target_entity,
            rel.relationship_type.as_str(),
            rel.foreign_key_field,
            rel.inverse_name,
            rel.on_delete.as_str(),
            rel.on_update.as_str(),
            rel.description,
            now,
            actor,
        ],
    )?;
    if let Some(junction) = &rel.junction {
        conn.execute(
            "INSERT INTO kdb_junction_tables (id, relationship_id, table_name, source_fk_column, target_fk_column, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_id(),
                rel.id,
                junction.table_name,
                junction.source_fk_column,
                junction.target_fk_column,
                now,
            ],
        )?;
    }
    Ok(())
}

pub(crate) fn deactivate_relationship(conn: &Connection, id: &str) -> Result<()> {
    conn.execute(
        "UPDATE kdb_relationship_definitions SET is_active = 0 WHERE id = ?1",
        [id],
    )?;
    Ok(())
}

/// Relationships whose foreign keys point at rows of `entity`
pub(crate) fn dependents_of(conn: &Connection, entity: &str) -> Result<Vec<Dependent>> {
    let mut dependents = Vec::new();
    for rel in relationships(conn, Some(entity))? {
        if rel.referenced_entity() != Some(entity) {
            continue;
        }
        let (Some(holder), Some(field)) = (rel.foreign_key_holder(), rel.foreign_key_field.as_ref()) else {
            continue;
        };
        dependents.push(Dependent {
            relationship: rel.name.clone(),
            child_entity: holder.to_string(),
            foreign_key_field: field.clone(),
            on_delete: rel.on_delete,
        });
    }
    Ok(dependents)
}

/// Foreign key fields stored on `entity`, with the entity each refers to
pub(crate) fn foreign_keys_held_by(
    conn: &Connection,
    entity: &str,
) -> Result<Vec<(RelationshipDefinition, String)>> {
    let mut held = Vec::new();
    for rel in relationships(conn, Some(entity))? {
        if rel.foreign_key_holder() != Some(entity) {
            continue;
        }
        if let Some(referenced) = rel.referenced_entity() {
            let referenced = referenced.to_string();
            held.push((rel, referenced));
        }
    }
    Ok(held)
}

/// Native constraints a dedicated table for `entity` should declare:
/// one per held foreign key whose referenced entity is already dedicated.
pub(crate) fn native_foreign_keys(conn: &Connection, entity: &str) -> Result<Vec<ForeignKeyConstraint>> {
    let mut constraints = Vec::new();
    for (rel, referenced) in foreign_keys_held_by(conn, entity)? {
        let Some(column) = rel.foreign_key_field.clone() else {
            continue;
        };
        // Self references would point at a table being built; skip them
        if referenced == entity {
            continue;
        }
        let Some(target) = try_load_entity(conn, &referenced)? else {
            continue;
        };
        if let (StorageMode::Dedicated, Some(table)) = (target.storage_mode, target.dedicated_table_name) {
            constraints.push(ForeignKeyConstraint {
                column,
                referenced_table: table,
                on_delete: rel.on_delete,
            });
        }
    }
    Ok(constraints)
}

/// Junction table sides that reference rows of `entity`
pub(crate) fn junctions_touching(conn: &Connection, entity: &str) -> Result<Vec<JunctionSide>> {
    let mut sides = Vec::new();
    for rel in relationships(conn, Some(entity))? {
        let Some(junction) = &rel.junction else {
            continue;
        };
        if rel.source_entity == entity {
            sides.push(JunctionSide {
                relationship: rel.name.clone(),
                table_name: junction.table_name.clone(),
                column: junction.source_fk_column.clone(),
            });
        }
        if rel.target_entity == entity {
            sides.push(JunctionSide {
                relationship: rel.name.clone(),
                table_name: junction.table_name.clone(),
                column: junction.target_fk_column.clone(),
            });
        }
    }
    Ok(sides)
}

/// Find a cycle of CASCADE edges (parent to dependent) through `start`
pub(crate) fn cascade_cycle(conn: &Connection, start: &str) -> Result<Option<Vec<String>>> {
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for rel in relationships(conn, None)? {
        if rel.on_delete != OnDeleteAction::Cascade {
            continue;
        }
        if let (Some(parent), Some(child)) = (rel.referenced_entity(), rel.foreign_key_holder()) {
            edges.entry(parent.to_string()).or_default().push(child.to_string());
        }
    }

    // Depth-first search with an explicit stack of (node, path)
    let mut stack = vec![(start.to_string(), vec![start.to_string()])];
    let mut visited = HashSet::new();
    while let Some((node, path)) = stack.pop() {
        for next in edges.get(&node).into_iter().flatten() {
            if next == start {
                let mut cycle = path.clone();
                cycle.push(start.to_string());
                return Ok(Some(cycle));
            }
            if visited.insert(next.clone()) {
                let mut extended = path.clone();
                extended.push(next.clone());
                stack.push((next.clone(), extended));
            }
        }
    }
    Ok(None)
}

// ========== Changelog Operations ==========

pub(crate) fn log_change(conn: &Connection, change: Change<'_>) -> Result<()> {
    let old = change.old_value.map(|v| serde_json::to_string(&v)).transpose()?;
    let new = change.new_value.map(|v| serde_json::to_string(&v)).transpose()?;
    conn.execute(
        "INSERT INTO kdb_schema_changelog
            (id, timestamp, operation, entity_name, field_name, old_value, new_value, created_by, reason)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            new_id(),
            now_timestamp(),
            change.operation,
            change.entity,
            change.field,
            old,
            new,
            change.actor,
            change.reason,
        ],
    )?;
    Ok(())
}

pub(crate) fn changelog(conn: &Connection, entity: Option<&str>, limit: usize) -> Result<Vec<ChangelogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT id, timestamp, operation, entity_name, field_name, old_value, new_value, created_by, reason
         FROM kdb_schema_changelog
         WHERE ?1 IS NULL OR entity_name = ?1
         ORDER BY timestamp DESC, rowid DESC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![entity, limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let parse = |v: Option<String>| -> Result<Option<Value>> {
        Ok(v.map(|s| serde_json::from_str(&s)).transpose()?)
    };
    rows.into_iter()
        .map(|(id, timestamp, operation, entity_name, field_name, old, new, created_by, reason)| {
            Ok(ChangelogEntry {
                id,
                timestamp,
                operation,
                entity_name,
                field_name,
                old_value: parse(old)?,
                new_value: parse(new)?,
                created_by,
                reason,
            })
        })
        .collect()
}
