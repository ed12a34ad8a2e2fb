//! Dedicated typed-table storage
//!
//! A materialized entity owns one table named `ent_{snake_name}` with the
//! system columns followed by one typed column per field. Unique fields get
//! unique indexes and foreign keys to other dedicated tables are declared
//! natively.

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use tracing::debug;

use super::backend::{RecordBackend, CHUNK_SIZE};
use super::filter::{self, Filter};
use super::sqlite::{placeholders, quote_ident, table_exists};
use super::value::{from_sql, to_sql, Document, Record};
use crate::schema::{EntityDefinition, FieldDefinition, OnDeleteAction, StorageMode};
use crate::{Error, Result};

/// A native foreign key declared on a dedicated table
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ForeignKeyConstraint {
    pub column: String,
    pub referenced_table: String,
    pub on_delete: OnDeleteAction,
}

/// Backend over per-entity dedicated tables
pub(crate) struct DedicatedBackend;

impl DedicatedBackend {
    fn table(entity: &EntityDefinition) -> Result<&str> {
        entity.dedicated_table_name.as_deref().ok_or_else(|| {
            Error::storage_mode(&entity.name, "entity has no dedicated table")
        })
    }

    fn select_list(entity: &EntityDefinition) -> String {
        let mut cols = vec![
            "\"id\"".to_string(),
            "\"created_at\"".to_string(),
            "\"updated_at\"".to_string(),
            "\"created_by\"".to_string(),
        ];
        cols.extend(entity.fields.iter().map(|f| quote_ident(&f.name)));
        cols.join(", ")
    }

    fn row_to_record(entity: &EntityDefinition, row: &Row) -> Result<Record> {
        let mut fields = Document::new();
        for (i, field) in entity.fields.iter().enumerate() {
            let value = from_sql(row.get_ref(4 + i)?, field.field_type)?;
            fields.insert(field.name.clone(), value);
        }
        Ok(Record {
            id: row.get(0)?,
            fields,
            created_at: row.get(1)?,
            updated_at: row.get(2)?,
            created_by: row.get(3)?,
        })
    }

    fn insert_sql(entity: &EntityDefinition, table: &str) -> String {
        format!(
            "INSERT INTO {} ({}) VALUES ({})",
            quote_ident(table),
            Self::select_list(entity),
            placeholders(4 + entity.fields.len())
        )
    }

    fn row_params(entity: &EntityDefinition, record: &Record) -> Result<Vec<SqlValue>> {
        let mut params = vec![
            SqlValue::Text(record.id.clone()),
            SqlValue::Text(record.created_at.clone()),
            SqlValue::Text(record.updated_at.clone()),
            record.created_by.clone().map(SqlValue::Text).unwrap_or(SqlValue::Null),
        ];
        for field in &entity.fields {
            let value = record.fields.get(&field.name).unwrap_or(&serde_json::Value::Null);
            params.push(to_sql(value, field.field_type)?);
        }
        Ok(params)
    }

    fn query(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        sql: &str,
        params: Vec<SqlValue>,
    ) -> Result<Vec<Record>> {
        let mut stmt = conn.prepare(sql)?;
        let mut rows = stmt.query(params_from_iter(params))?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            records.push(Self::row_to_record(entity, row)?);
        }
        Ok(records)
    }
}

impl RecordBackend for DedicatedBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::Dedicated
    }

    fn table_name(&self, entity: &EntityDefinition) -> Result<String> {
        Self::table(entity).map(str::to_string)
    }

    fn insert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()> {
        let sql = Self::insert_sql(entity, Self::table(entity)?);
        conn.execute(&sql, params_from_iter(Self::row_params(entity, record)?))?;
        Ok(())
    }

    fn upsert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()> {
        let mut assignments = vec![
            "\"created_at\" = excluded.\"created_at\"".to_string(),
            "\"updated_at\" = excluded.\"updated_at\"".to_string(),
            "\"created_by\" = excluded.\"created_by\"".to_string(),
        ];
        for field in &entity.fields {
            let col = quote_ident(&field.name);
            assignments.push(format!("{} = excluded.{}", col, col));
        }
        let sql = format!(
            "{} ON CONFLICT(\"id\") DO UPDATE SET {}",
            Self::insert_sql(entity, Self::table(entity)?),
            assignments.join(", ")
        );
        conn.execute(&sql, params_from_iter(Self::row_params(entity, record)?))?;
        Ok(())
    }

    fn get(&self, conn: &Connection, entity: &EntityDefinition, id: &str) -> Result<Option<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE \"id\" = ?",
            Self::select_list(entity),
            quote_ident(Self::table(entity)?)
        );
        let mut records = self.query(conn, entity, &sql, vec![SqlValue::Text(id.to_string())])?;
        Ok(records.pop())
    }

    fn find(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<Vec<Record>> {
        let (clause, tail) = filter::compile(entity, filter, &quote_ident)?;
        let mut sql = format!(
            "SELECT {} FROM {}",
            Self::select_list(entity),
            quote_ident(Self::table(entity)?)
        );
        if !clause.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause.sql);
        }
        sql.push_str(&tail);
        self.query(conn, entity, &sql, clause.params)
    }

    fn count(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<usize> {
        let (clause, _) = filter::compile(entity, filter, &quote_ident)?;
        let mut sql = format!("SELECT COUNT(*) FROM {}", quote_ident(Self::table(entity)?));
        if !clause.sql.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clause.sql);
        }
        let n: i64 = conn.query_row(&sql, params_from_iter(clause.params), |row| row.get(0))?;
        Ok(n as usize)
    }

    fn update(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<bool> {
        let mut assignments = vec!["\"updated_at\" = ?".to_string()];
        let mut params = vec![SqlValue::Text(record.updated_at.clone())];
        for field in &entity.fields {
            assignments.push(format!("{} = ?", quote_ident(&field.name)));
            let value = record.fields.get(&field.name).unwrap_or(&serde_json::Value::Null);
            params.push(to_sql(value, field.field_type)?);
        }
        params.push(SqlValue::Text(record.id.clone()));
        let sql = format!(
            "UPDATE {} SET {} WHERE \"id\" = ?",
            quote_ident(Self::table(entity)?),
            assignments.join(", ")
        );
        Ok(conn.execute(&sql, params_from_iter(params))? > 0)
    }

    fn delete(&self, conn: &Connection, entity: &EntityDefinition, ids: &[String]) -> Result<usize> {
        let table = quote_ident(Self::table(entity)?);
        let mut deleted = 0;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!("DELETE FROM {} WHERE \"id\" IN ({})", table, placeholders(chunk.len()));
            deleted += conn.execute(&sql, params_from_iter(chunk))?;
        }
        Ok(deleted)
    }

    fn clear_field(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        field: &str,
        ids: &[String],
        updated_at: &str,
    ) -> Result<usize> {
        let table = quote_ident(Self::table(entity)?);
        let mut cleared = 0;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "UPDATE {} SET {} = NULL, \"updated_at\" = ? WHERE \"id\" IN ({})",
                table,
                quote_ident(field),
                placeholders(chunk.len())
            );
            let params = std::iter::once(updated_at).chain(chunk.iter().map(String::as_str));
            cleared += conn.execute(&sql, params_from_iter(params))?;
        }
        Ok(cleared)
    }
}

// ========== DDL ==========

fn column_ddl(field: &FieldDefinition, with_not_null: bool) -> String {
    let mut ddl = format!("{} {}", quote_ident(&field.name), field.field_type.sql_type());
    if with_not_null && field.required {
        ddl.push_str(" NOT NULL");
    }
    ddl
}

/// Create a dedicated table for `entity` named `table`.
///
/// Fails with a storage-mode error when the table already exists.
pub(crate) fn create_table(
    conn: &Connection,
    entity: &EntityDefinition,
    table: &str,
    foreign_keys: &[ForeignKeyConstraint],
) -> Result<()> {
    if table_exists(conn, table)? {
        return Err(Error::storage_mode(
            &entity.name,
            format!("table '{}' already exists; abort the stale migration or drop it", table),
        ));
    }

    let mut columns = vec![
        "\"id\" TEXT PRIMARY KEY".to_string(),
        "\"created_at\" TEXT NOT NULL".to_string(),
        "\"updated_at\" TEXT NOT NULL".to_string(),
        "\"created_by\" TEXT".to_string(),
    ];
    columns.extend(entity.fields.iter().map(|f| column_ddl(f, true)));
    for fk in foreign_keys {
        columns.push(format!(
            "FOREIGN KEY ({}) REFERENCES {}(\"id\") ON DELETE {}",
            quote_ident(&fk.column),
            quote_ident(&fk.referenced_table),
            fk.on_delete.sql_clause()
        ));
    }

    let sql = format!("CREATE TABLE {} (\n    {}\n)", quote_ident(table), columns.join(",\n    "));
    debug!(%table, "Creating dedicated table");
    conn.execute(&sql, [])?;

    for field in &entity.fields {
        create_field_index(conn, table, field)?;
    }
    conn.execute(
        &format!(
            "CREATE INDEX {} ON {}(\"updated_at\")",
            quote_ident(&format!("idx_{}_updated_at", table)),
            quote_ident(table)
        ),
        [],
    )?;
    Ok(())
}

/// Create the unique or plain index a field asks for (no-op otherwise)
pub(crate) fn create_field_index(conn: &Connection, table: &str, field: &FieldDefinition) -> Result<()> {
    let kind = if field.unique {
        "UNIQUE INDEX"
    } else if field.indexed {
        "INDEX"
    } else {
        return Ok(());
    };
    let sql = format!(
        "CREATE {} {} ON {}({})",
        kind,
        quote_ident(&format!("idx_{}_{}", table, field.name)),
        quote_ident(table),
        quote_ident(&field.name)
    );
    conn.execute(&sql, [])?;
    Ok(())
}

/// Add a column for a new field. Never adds NOT NULL: existing rows have no value.
pub(crate) fn add_column(conn: &Connection, table: &str, field: &FieldDefinition) -> Result<()> {
    let sql = format!("ALTER TABLE {} ADD COLUMN {}", quote_ident(table), column_ddl(field, false));
    conn.execute(&sql, [])?;
    create_field_index(conn, table, field)
}

pub(crate) fn drop_table(conn: &Connection, table: &str) -> Result<()> {
    conn.execute(&format!("DROP TABLE IF EXISTS {}", quote_ident(table)), [])?;
    Ok(())
}

/// Table referenced by a native foreign key declared on `table.column`, if any
pub(crate) fn native_foreign_key(conn: &Connection, table: &str, column: &str) -> Result<Option<String>> {
    if !table_exists(conn, table)? {
        return Ok(None);
    }
    let mut stmt = conn.prepare("SELECT \"table\" FROM pragma_foreign_key_list(?1) WHERE \"from\" = ?2")?;
    let mut rows = stmt.query([table, column])?;
    match rows.next()? {
        Some(row) => Ok(Some(row.get(0)?)),
        None => Ok(None),
    }
}

/// Tables declaring a native foreign key into `table`
pub(crate) fn tables_referencing(conn: &Connection, table: &str, candidates: &[String]) -> Result<Vec<String>> {
    let mut referencing = Vec::new();
    for candidate in candidates {
        if candidate == table || !table_exists(conn, candidate)? {
            continue;
        }
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM pragma_foreign_key_list(?1) WHERE \"table\" = ?2",
            [candidate.as_str(), table],
            |row| row.get(0),
        )?;
        if n > 0 {
            referencing.push(candidate.clone());
        }
    }
    Ok(referencing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldType;
    use crate::storage::Database;
    use serde_json::json;

    fn field(name: &str, ty: FieldType) -> FieldDefinition {
        FieldDefinition {
            id: name.into(),
            name: name.into(),
            field_type: ty,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            description: None,
            position: 0,
        }
    }

    fn entity(name: &str, table: &str, fields: Vec<FieldDefinition>) -> EntityDefinition {
        EntityDefinition {
            id: format!("id-{}", name),
            name: name.into(),
            storage_mode: StorageMode::Dedicated,
            dedicated_table_name: Some(table.into()),
            description: None,
            fields,
            created_at: "t".into(),
            created_by: None,
        }
    }

    fn record(id: &str, fields: serde_json::Value) -> Record {
        Record {
            id: id.into(),
            fields: fields.as_object().cloned().unwrap_or_default(),
            created_at: "2024-01-01T00:00:00.000000Z".into(),
            updated_at: "2024-01-01T00:00:00.000000Z".into(),
            created_by: None,
        }
    }

    #[test]
    fn test_typed_round_trip() {
        let db = Database::open_in_memory().unwrap();
        let mut email = field("email", FieldType::String);
        email.unique = true;
        let e = entity(
            "Customer",
            "ent_customer",
            vec![
                email,
                field("score", FieldType::Float),
                field("active", FieldType::Bool),
                field("tags", FieldType::Json),
            ],
        );
        db.with_connection(|conn| {
            create_table(conn, &e, "ent_customer", &[])?;
            let r = record(
                "c1",
                json!({"email": "a@x.io", "score": 4.5, "active": true, "tags": ["vip"]}),
            );
            DedicatedBackend.insert(conn, &e, &r)?;
            let got = DedicatedBackend.get(conn, &e, "c1")?.unwrap();
            assert_eq!(got, r);

            // unique index enforced natively
            let dup = record("c2", json!({"email": "a@x.io", "score": null, "active": null, "tags": null}));
            assert!(DedicatedBackend.insert(conn, &e, &dup).is_err());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_create_table_refuses_existing() {
        let db = Database::open_in_memory().unwrap();
        let e = entity("Tag", "ent_tag", vec![field("label", FieldType::String)]);
        db.with_connection(|conn| {
            create_table(conn, &e, "ent_tag", &[])?;
            let err = create_table(conn, &e, "ent_tag", &[]).unwrap_err();
            assert!(matches!(err, Error::StorageMode { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_add_column_is_nullable() {
        let db = Database::open_in_memory().unwrap();
        let mut e = entity("Tag", "ent_tag", vec![field("label", FieldType::String)]);
        db.with_connection(|conn| {
            create_table(conn, &e, "ent_tag", &[])?;
            DedicatedBackend.insert(conn, &e, &record("t1", json!({"label": "x"})))?;

            let mut weight = field("weight", FieldType::Int);
            weight.required = true;
            add_column(conn, "ent_tag", &weight)?;
            e.fields.push(weight);

            let got = DedicatedBackend.get(conn, &e, "t1")?.unwrap();
            assert_eq!(got.get("weight"), Some(&serde_json::Value::Null));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_native_foreign_keys_detected() {
        let db = Database::open_in_memory().unwrap();
        let parent = entity("Customer", "ent_customer", vec![field("name", FieldType::String)]);
        let child = entity("Order", "ent_order", vec![field("customer_id", FieldType::Uuid)]);
        db.with_connection(|conn| {
            create_table(conn, &parent, "ent_customer", &[])?;
            create_table(
                conn,
                &child,
                "ent_order",
                &[ForeignKeyConstraint {
                    column: "customer_id".into(),
                    referenced_table: "ent_customer".into(),
                    on_delete: OnDeleteAction::Cascade,
                }],
            )?;
            let refs = tables_referencing(
                conn,
                "ent_customer",
                &["ent_customer".to_string(), "ent_order".to_string()],
            )?;
            assert_eq!(refs, vec!["ent_order".to_string()]);
            assert_eq!(
                native_foreign_key(conn, "ent_order", "customer_id")?,
                Some("ent_customer".to_string())
            );
            assert_eq!(native_foreign_key(conn, "ent_customer", "name")?, None);
            assert_eq!(native_foreign_key(conn, "ent_missing", "customer_id")?, None);
            Ok(())
        })
        .unwrap();
    }
}
