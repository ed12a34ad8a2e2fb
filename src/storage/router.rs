//! Storage router - one CRUD contract over both storage modes
//!
//! Callers never see where an entity's records live. Each operation reads
//! the entity's current mode from the registry inside the same transaction
//! it uses for the data, so a concurrent migration flip is never observed
//! half-way.

use std::time::Instant;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::backend::{backend_for, RecordBackend};
use super::dedicated::DedicatedBackend;
use super::filter::{Filter, FilterOp};
use super::shared::SharedBackend;
use super::sqlite::table_exists;
use super::value::{coerce, Document, Record};
use crate::metrics::{MetricsCollector, QueryMetric};
use crate::relationship::{DeleteOptions, DeleteOutcome, RelationshipEnforcer};
use crate::schema::catalog;
use crate::schema::{EntityDefinition, SchemaRegistry, StorageMode, SYSTEM_FIELDS};
use crate::{new_id, now_timestamp, Error, Result};

/// Physical row counts of an entity in each representation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowCounts {
    pub entity: String,
    pub storage_mode: StorageMode,
    pub shared: usize,
    /// `None` when no dedicated table exists
    pub dedicated: Option<usize>,
}

/// Routes record operations to the backend matching each entity's mode
pub struct StorageRouter<'a> {
    registry: &'a SchemaRegistry,
    metrics: Option<&'a MetricsCollector>,
}

impl<'a> StorageRouter<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    /// Record query metrics for reads
    pub fn with_metrics(mut self, metrics: &'a MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========== Writes ==========

    /// Insert a record and return its generated id
    pub fn insert(&self, entity: &str, fields: Document, actor: Option<&str>) -> Result<String> {
        let id = self.registry.database().with_transaction(|tx| {
            let def = catalog::load_entity(tx, entity)?;
            insert_in(tx, &def, fields, actor)
        })?;
        debug!(%entity, %id, "Inserted record");
        Ok(id)
    }

    /// Insert several records in one transaction. Any failure inserts none.
    pub fn insert_many(&self, entity: &str, records: Vec<Document>, actor: Option<&str>) -> Result<Vec<String>> {
        let ids = self.registry.database().with_transaction(|tx| {
            let def = catalog::load_entity(tx, entity)?;
            records
                .into_iter()
                .map(|fields| insert_in(tx, &def, fields, actor))
                .collect::<Result<Vec<_>>>()
        })?;
        info!(%entity, count = ids.len(), "Inserted records");
        Ok(ids)
    }

    /// Apply a partial update and return the stored record
    pub fn update(&self, entity: &str, id: &str, patch: Document) -> Result<Record> {
        let record = self.registry.database().with_transaction(|tx| {
            let def = catalog::load_entity(tx, entity)?;
            let backend = backend_for(def.storage_mode);
            let Some(mut record) = backend.get(tx, &def, id)? else {
                return Err(Error::RecordNotFound {
                    entity: entity.to_string(),
                    id: id.to_string(),
                });
            };

            let patch = normalize_patch(&def, patch)?;
            for (name, value) in &patch {
                record.fields.insert(name.clone(), value.clone());
            }
            check_required(&def, &record.fields)?;
            check_constraints(tx, &def, &record.id, &patch)?;

            record.updated_at = now_timestamp();
            backend.update(tx, &def, &record)?;
            Ok(record)
        })?;
        debug!(%entity, %id, "Updated record");
        Ok(record)
    }

    /// Delete a record, applying relationship semantics to its dependents
    pub fn delete(&self, entity: &str, id: &str, options: DeleteOptions) -> Result<DeleteOutcome> {
        RelationshipEnforcer::new(self.registry).delete(entity, id, options)
    }

    // ========== Reads ==========

    /// Get a record by id
    pub fn get(&self, entity: &str, id: &str) -> Result<Option<Record>> {
        let start = Instant::now();
        let (record, table) = self.registry.database().with_connection(|conn| {
            let def = catalog::load_entity(conn, entity)?;
            let backend = backend_for(def.storage_mode);
            Ok((backend.get(conn, &def, id)?, backend.table_name(&def)?))
        })?;
        self.record_query(entity, "get", start, usize::from(record.is_some()), table);
        Ok(record)
    }

    /// Find records matching a filter
    pub fn find(&self, entity: &str, filter: &Filter) -> Result<Vec<Record>> {
        let start = Instant::now();
        let (records, table) = self.registry.database().with_connection(|conn| {
            let def = catalog::load_entity(conn, entity)?;
            let backend = backend_for(def.storage_mode);
            Ok((backend.find(conn, &def, filter)?, backend.table_name(&def)?))
        })?;
        self.record_query(entity, "find", start, records.len(), table);
        Ok(records)
    }

    /// Count records matching a filter
    pub fn count(&self, entity: &str, filter: &Filter) -> Result<usize> {
        let start = Instant::now();
        let (count, table) = self.registry.database().with_connection(|conn| {
            let def = catalog::load_entity(conn, entity)?;
            let backend = backend_for(def.storage_mode);
            Ok((backend.count(conn, &def, filter)?, backend.table_name(&def)?))
        })?;
        self.record_query(entity, "count", start, count, table);
        Ok(count)
    }

    /// Rows held in each representation. Both are non-zero only while a
    /// migration is in flight.
    pub fn row_counts(&self, entity: &str) -> Result<RowCounts> {
        self.registry.database().with_connection(|conn| {
            let def = catalog::load_entity(conn, entity)?;
            let shared = SharedBackend.count(conn, &def, &Filter::new())?;

            let table = def
                .dedicated_table_name
                .clone()
                .unwrap_or_else(|| crate::schema::naming::dedicated_table_name(&def.name));
            let dedicated = if table_exists(conn, &table)? {
                let mut staged = def.clone();
                staged.dedicated_table_name = Some(table);
                Some(DedicatedBackend.count(conn, &staged, &Filter::new())?)
            } else {
                None
            };

            Ok(RowCounts {
                entity: def.name.clone(),
                storage_mode: def.storage_mode,
                shared,
                dedicated,
            })
        })
    }

    fn record_query(&self, entity: &str, query_type: &str, start: Instant, rows: usize, table: String) {
        if let Some(metrics) = self.metrics {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            let metric = QueryMetric::new(entity, query_type, elapsed, rows).with_tables(vec![table]);
            metrics.record_best_effort(&metric);
        }
    }
}

/// Validate, complete and store one record inside an open transaction
fn insert_in(conn: &Connection, entity: &EntityDefinition, fields: Document, actor: Option<&str>) -> Result<String> {
    let mut given = normalize_patch(entity, fields)?;

    let mut complete = Document::new();
    for field in &entity.fields {
        let value = match given.remove(&field.name) {
            Some(v) => v,
            None => match &field.default {
                Some(default) => coerce(&entity.name, field, default.clone())?,
                None => Value::Null,
            },
        };
        complete.insert(field.name.clone(), value);
    }
    check_required(entity, &complete)?;

    let now = now_timestamp();
    let record = Record {
        id: new_id(),
        fields: complete,
        created_at: now.clone(),
        updated_at: now,
        created_by: actor.map(str::to_string),
    };
    check_constraints(conn, entity, &record.id, &record.fields)?;
    backend_for(entity.storage_mode).insert(conn, entity, &record)?;
    Ok(record.id)
}

/// Reject system and undeclared keys, coerce the rest to declared types
fn normalize_patch(entity: &EntityDefinition, patch: Document) -> Result<Document> {
    let mut out = Document::new();
    for (name, value) in patch {
        if SYSTEM_FIELDS.contains(&name.as_str()) {
            return Err(Error::validation(
                &entity.name,
                format!("'{}' is a system field managed by the engine", name),
            ));
        }
        let field = entity.require_field(&name)?;
        let value = coerce(&entity.name, field, value)?;
        out.insert(name, value);
    }
    Ok(out)
}

fn check_required(entity: &EntityDefinition, fields: &Document) -> Result<()> {
    for field in entity.fields.iter().filter(|f| f.required) {
        if fields.get(&field.name).is_none_or(Value::is_null) {
            return Err(Error::validation(
                &entity.name,
                format!("field '{}' is required", field.name),
            ));
        }
    }
    Ok(())
}

/// Enforce uniqueness and foreign key existence for the given field values
fn check_constraints(conn: &Connection, entity: &EntityDefinition, id: &str, values: &Document) -> Result<()> {
    let backend = backend_for(entity.storage_mode);
    for field in entity.fields.iter().filter(|f| f.unique) {
        let Some(value) = values.get(&field.name).filter(|v| !v.is_null()) else {
            continue;
        };
        let filter = Filter::new()
            .eq(field.name.clone(), value.clone())
            .where_op("id", FilterOp::Ne, id);
        if backend.count(conn, entity, &filter)? > 0 {
            return Err(Error::validation(
                &entity.name,
                format!("value {} for unique field '{}' already exists", value, field.name),
            ));
        }
    }

    for (rel, referenced) in catalog::foreign_keys_held_by(conn, &entity.name)? {
        let Some(fk) = rel.foreign_key_field.as_deref() else {
            continue;
        };
        let Some(target_id) = values.get(fk).and_then(Value::as_str) else {
            continue;
        };
        let target = catalog::load_entity(conn, &referenced)?;
        // a row may reference itself only once it exists; allow it on insert
        if target.name == entity.name && target_id == id {
            continue;
        }
        if backend_for(target.storage_mode).get(conn, &target, target_id)?.is_none() {
            return Err(Error::validation(
                &entity.name,
                format!(
                    "field '{}' references {} record '{}' which does not exist",
                    fk, referenced, target_id
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySpec, FieldSpec, FieldType, RelationshipSpec};
    use crate::storage::Database;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        value.as_object().cloned().unwrap_or_default()
    }

    fn setup() -> SchemaRegistry {
        let registry = SchemaRegistry::new(Database::open_in_memory().unwrap());
        registry
            .define_entity(
                EntitySpec::new("Customer")
                    .field(FieldSpec::new("name", FieldType::String).required())
                    .field(FieldSpec::new("email", FieldType::String).unique())
                    .field(FieldSpec::new("tier", FieldType::String).with_default("basic")),
                None,
            )
            .unwrap();
        registry
            .define_entity(
                EntitySpec::new("Order").field(FieldSpec::new("total", FieldType::Float)),
                None,
            )
            .unwrap();
        registry
            .add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();
        registry
    }

    #[test]
    fn test_insert_fills_defaults_and_system_fields() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        let id = router
            .insert("Customer", doc(json!({"name": "Acme"})), Some("agent"))
            .unwrap();
        let record = router.get("Customer", &id).unwrap().unwrap();
        assert_eq!(record.get_str("tier"), Some("basic"));
        assert_eq!(record.get("email"), Some(&Value::Null));
        assert_eq!(record.created_by.as_deref(), Some("agent"));
        assert_eq!(record.created_at, record.updated_at);
        assert!(uuid::Uuid::parse_str(&record.id).is_ok());
    }

    #[test]
    fn test_insert_validation() {
        let registry = setup();
        let router = StorageRouter::new(&registry);

        let err = router.insert("Customer", doc(json!({"email": "x@y"})), None).unwrap_err();
        assert!(err.to_string().contains("'name' is required"));

        let err = router
            .insert("Customer", doc(json!({"name": "A", "phone": "1"})), None)
            .unwrap_err();
        assert!(matches!(err, Error::FieldNotFound { .. }));

        let err = router
            .insert("Customer", doc(json!({"name": "A", "id": "mine"})), None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = router.insert("Ghost", Document::new(), None).unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
    }

    #[test]
    fn test_unique_enforced_in_shared_mode() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        router
            .insert("Customer", doc(json!({"name": "A", "email": "a@x.io"})), None)
            .unwrap();
        let err = router
            .insert("Customer", doc(json!({"name": "B", "email": "a@x.io"})), None)
            .unwrap_err();
        assert!(err.to_string().contains("unique field 'email'"));
    }

    #[test]
    fn test_insert_many_is_atomic() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        let err = router.insert_many(
            "Customer",
            vec![
                doc(json!({"name": "A", "email": "dup@x.io"})),
                doc(json!({"name": "B", "email": "dup@x.io"})),
            ],
            None,
        );
        assert!(err.is_err());
        assert_eq!(router.count("Customer", &Filter::new()).unwrap(), 0);

        let ids = router
            .insert_many("Customer", vec![doc(json!({"name": "A"})), doc(json!({"name": "B"}))], None)
            .unwrap();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn test_foreign_key_must_exist() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        let missing = uuid::Uuid::new_v4().to_string();
        let err = router
            .insert("Order", doc(json!({"total": 5, "customer_id": missing})), None)
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));

        let customer = router.insert("Customer", doc(json!({"name": "A"})), None).unwrap();
        let order = router
            .insert("Order", doc(json!({"total": 5, "customer_id": customer})), None)
            .unwrap();
        let stored = router.get("Order", &order).unwrap().unwrap();
        assert_eq!(stored.get("total"), Some(&json!(5.0)));
    }

    #[test]
    fn test_update_merges_patch() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        let id = router
            .insert("Customer", doc(json!({"name": "A", "email": "a@x.io"})), None)
            .unwrap();
        let updated = router
            .update("Customer", &id, doc(json!({"tier": "gold"})))
            .unwrap();
        assert_eq!(updated.get_str("tier"), Some("gold"));
        assert_eq!(updated.get_str("email"), Some("a@x.io"));
        assert!(updated.updated_at >= updated.created_at);

        // keeping its own unique value is not a conflict
        router
            .update("Customer", &id, doc(json!({"email": "a@x.io"})))
            .unwrap();

        let err = router
            .update("Customer", &id, doc(json!({"name": null})))
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));

        let err = router
            .update("Customer", "nope", doc(json!({"tier": "x"})))
            .unwrap_err();
        assert!(matches!(err, Error::RecordNotFound { .. }));
    }

    #[test]
    fn test_find_and_count_with_filters() {
        let registry = setup();
        let router = StorageRouter::new(&registry);
        for (name, tier) in [("A", "gold"), ("B", "basic"), ("C", "gold")] {
            router
                .insert("Customer", doc(json!({"name": name, "tier": tier})), None)
                .unwrap();
        }
        let gold = router
            .find("Customer", &Filter::new().eq("tier", "gold").order_by("name"))
            .unwrap();
        assert_eq!(
            gold.iter().filter_map(|r| r.get_str("name")).collect::<Vec<_>>(),
            ["A", "C"]
        );
        assert_eq!(router.count("Customer", &Filter::new()).unwrap(), 3);

        let counts = router.row_counts("Customer").unwrap();
        assert_eq!(counts.shared, 3);
        assert_eq!(counts.dedicated, None);
    }
}
