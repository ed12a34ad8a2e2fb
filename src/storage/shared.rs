//! Shared document storage
//!
//! Every shared entity's records live in `kdb_records`, one JSON object per
//! row in the `data` column, partitioned by `entity_id`.

use rusqlite::{params_from_iter, Connection, Row};
use rusqlite::types::Value as SqlValue;

use super::backend::{RecordBackend, CHUNK_SIZE};
use super::filter::{self, Filter};
use super::sqlite::placeholders;
use super::value::{complete_fields, Document, Record};
use crate::schema::{EntityDefinition, StorageMode, SYSTEM_FIELDS};
use crate::Result;

pub(crate) const RECORDS_TABLE: &str = "kdb_records";

/// Backend over the shared `kdb_records` table
pub(crate) struct SharedBackend;

impl SharedBackend {
    /// SQL expression reading a field from the document (system fields are columns)
    fn column(field: &str) -> String {
        if SYSTEM_FIELDS.contains(&field) {
            format!("\"{}\"", field)
        } else {
            format!("json_extract(data, '$.{}')", field)
        }
    }

    fn row_to_record(row: &Row) -> rusqlite::Result<(Record, String)> {
        let data: String = row.get(1)?;
        let record = Record {
            id: row.get(0)?,
            fields: Document::new(),
            created_at: row.get(2)?,
            updated_at: row.get(3)?,
            created_by: row.get(4)?,
        };
        Ok((record, data))
    }

    fn decode(entity: &EntityDefinition, (mut record, data): (Record, String)) -> Result<Record> {
        let raw: Document = serde_json::from_str(&data)?;
        record.fields = complete_fields(entity, raw);
        Ok(record)
    }

    fn encode(record: &Record) -> Result<String> {
        // Nulls are stored explicitly so filters on absent and null fields agree
        Ok(serde_json::to_string(&record.fields)?)
    }
}

impl RecordBackend for SharedBackend {
    fn mode(&self) -> StorageMode {
        StorageMode::Shared
    }

    fn table_name(&self, _entity: &EntityDefinition) -> Result<String> {
        Ok(RECORDS_TABLE.to_string())
    }

    fn insert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()> {
        conn.execute(
            "INSERT INTO kdb_records (id, entity_id, data, created_at, updated_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![
                record.id,
                entity.id,
                Self::encode(record)?,
                record.created_at,
                record.updated_at,
                record.created_by,
            ],
        )?;
        Ok(())
    }

    fn upsert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()> {
        conn.execute(
            "INSERT INTO kdb_records (id, entity_id, data, created_at, updated_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
                data = excluded.data,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                created_by = excluded.created_by",
            rusqlite::params![
                record.id,
                entity.id,
                Self::encode(record)?,
                record.created_at,
                record.updated_at,
                record.created_by,
            ],
        )?;
        Ok(())
    }

    fn get(&self, conn: &Connection, entity: &EntityDefinition, id: &str) -> Result<Option<Record>> {
        let mut stmt = conn.prepare(
            "SELECT id, data, created_at, updated_at, created_by FROM kdb_records
             WHERE entity_id = ?1 AND id = ?2",
        )?;
        let mut rows = stmt.query_map(rusqlite::params![entity.id, id], Self::row_to_record)?;
        match rows.next() {
            Some(row) => Ok(Some(Self::decode(entity, row?)?)),
            None => Ok(None),
        }
    }

    fn find(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<Vec<Record>> {
        let (clause, tail) = filter::compile(entity, filter, &Self::column)?;
        let mut sql = String::from(
            "SELECT id, data, created_at, updated_at, created_by FROM kdb_records WHERE entity_id = ?",
        );
        if !clause.sql.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&clause.sql);
        }
        sql.push_str(&tail);

        let mut params = vec![SqlValue::Text(entity.id.clone())];
        params.extend(clause.params);

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(params), Self::row_to_record)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(|r| Self::decode(entity, r)).collect()
    }

    fn count(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<usize> {
        let (clause, _) = filter::compile(entity, filter, &Self::column)?;
        let mut sql = String::from("SELECT COUNT(*) FROM kdb_records WHERE entity_id = ?");
        if !clause.sql.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&clause.sql);
        }
        let mut params = vec![SqlValue::Text(entity.id.clone())];
        params.extend(clause.params);
        let n: i64 = conn.query_row(&sql, params_from_iter(params), |row| row.get(0))?;
        Ok(n as usize)
    }

    fn update(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<bool> {
        let changed = conn.execute(
            "UPDATE kdb_records SET data = ?1, updated_at = ?2 WHERE entity_id = ?3 AND id = ?4",
            rusqlite::params![Self::encode(record)?, record.updated_at, entity.id, record.id],
        )?;
        Ok(changed > 0)
    }

    fn delete(&self, conn: &Connection, entity: &EntityDefinition, ids: &[String]) -> Result<usize> {
        let mut deleted = 0;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "DELETE FROM kdb_records WHERE entity_id = ? AND id IN ({})",
                placeholders(chunk.len())
            );
            let params = std::iter::once(entity.id.as_str()).chain(chunk.iter().map(String::as_str));
            deleted += conn.execute(&sql, params_from_iter(params))?;
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
        let mut cleared = 0;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let sql = format!(
                "UPDATE kdb_records SET data = json_set(data, '$.{}', NULL), updated_at = ?
                 WHERE entity_id = ? AND id IN ({})",
                field,
                placeholders(chunk.len())
            );
            let params = [updated_at, entity.id.as_str()]
                .into_iter()
                .chain(chunk.iter().map(String::as_str));
            cleared += conn.execute(&sql, params_from_iter(params))?;
        }
        Ok(cleared)
    }
}

/// Delete every shared row of an entity
pub(crate) fn delete_all(conn: &Connection, entity: &EntityDefinition) -> Result<usize> {
    Ok(conn.execute("DELETE FROM kdb_records WHERE entity_id = ?1", [&entity.id])?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{FieldDefinition, FieldType};
    use crate::storage::filter::FilterOp;
    use crate::storage::Database;
    use serde_json::json;

    fn entity() -> EntityDefinition {
        let field = |name: &str, ty: FieldType, position: i64| FieldDefinition {
            id: name.into(),
            name: name.into(),
            field_type: ty,
            required: false,
            unique: false,
            indexed: false,
            default: None,
            description: None,
            position,
        };
        EntityDefinition {
            id: "ent-1".into(),
            name: "Contact".into(),
            storage_mode: StorageMode::Shared,
            dedicated_table_name: None,
            description: None,
            fields: vec![
                field("name", FieldType::String, 0),
                field("age", FieldType::Int, 1),
                field("vip", FieldType::Bool, 2),
            ],
            created_at: "t".into(),
            created_by: None,
        }
    }

    fn record(id: &str, name: &str, age: i64, vip: bool) -> Record {
        let mut fields = Document::new();
        fields.insert("name".into(), json!(name));
        fields.insert("age".into(), json!(age));
        fields.insert("vip".into(), json!(vip));
        Record {
            id: id.into(),
            fields,
            created_at: "2024-01-01T00:00:00.000000Z".into(),
            updated_at: "2024-01-01T00:00:00.000000Z".into(),
            created_by: Some("test".into()),
        }
    }

    fn seed(conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO kdb_entity_definitions (id, name, created_at, updated_at) VALUES ('ent-1', 'Contact', 't', 't')",
            [],
        )?;
        let backend = SharedBackend;
        let e = entity();
        backend.insert(conn, &e, &record("a", "Ann", 30, true))?;
        backend.insert(conn, &e, &record("b", "Bob", 45, false))?;
        backend.insert(conn, &e, &record("c", "Cid", 22, true))?;
        Ok(())
    }

    #[test]
    fn test_insert_and_get() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            seed(conn)?;
            let got = SharedBackend.get(conn, &entity(), "b")?.unwrap();
            assert_eq!(got.get_str("name"), Some("Bob"));
            assert_eq!(got.get("vip"), Some(&json!(false)));
            assert!(SharedBackend.get(conn, &entity(), "zzz")?.is_none());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_find_with_typed_filters() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            seed(conn)?;
            let e = entity();
            let vips = SharedBackend.find(conn, &e, &Filter::new().eq("vip", true))?;
            assert_eq!(vips.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["a", "c"]);

            let older = Filter::new().where_op("age", FilterOp::Gte, 30).order_by_desc("age");
            let rows = SharedBackend.find(conn, &e, &older)?;
            assert_eq!(rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["b", "a"]);

            assert_eq!(SharedBackend.count(conn, &e, &Filter::new())?, 3);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_clear_field_and_delete() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            seed(conn)?;
            let e = entity();
            let cleared = SharedBackend.clear_field(conn, &e, "name", &["a".into()], "t2")?;
            assert_eq!(cleared, 1);
            let a = SharedBackend.get(conn, &e, "a")?.unwrap();
            assert_eq!(a.get("name"), Some(&serde_json::Value::Null));
            assert_eq!(a.updated_at, "t2");

            assert_eq!(SharedBackend.delete(conn, &e, &["a".into(), "b".into()])?, 2);
            assert_eq!(SharedBackend.count(conn, &e, &Filter::new())?, 1);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_scan_after_pages_by_id() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            seed(conn)?;
            let e = entity();
            let first = SharedBackend.scan_after(conn, &e, None, 2)?;
            assert_eq!(first.len(), 2);
            let rest = SharedBackend.scan_after(conn, &e, Some(&first[1].id), 2)?;
            assert_eq!(rest.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(), ["c"]);
            Ok(())
        })
        .unwrap();
    }
}
