//! The storage contract both representations implement

use std::collections::HashSet;

use rusqlite::Connection;
use serde_json::Value;

use super::dedicated::DedicatedBackend;
use super::filter::{Filter, FilterOp};
use super::shared::SharedBackend;
use super::value::Record;
use crate::schema::{EntityDefinition, StorageMode};
use crate::Result;

/// Maximum number of bound values in one `IN (...)` list
pub(crate) const CHUNK_SIZE: usize = 500;

/// Record operations over one physical representation.
///
/// Every method runs on the connection it is given so callers can compose
/// several calls, across both backends, inside one transaction.
pub(crate) trait RecordBackend: Send + Sync {
    fn mode(&self) -> StorageMode;

    /// Physical table holding the entity's rows
    fn table_name(&self, entity: &EntityDefinition) -> Result<String>;

    fn insert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()>;

    /// Insert, or overwrite every column of the row with the same id
    fn upsert(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<()>;

    fn get(&self, conn: &Connection, entity: &EntityDefinition, id: &str) -> Result<Option<Record>>;

    fn find(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<Vec<Record>>;

    fn count(&self, conn: &Connection, entity: &EntityDefinition, filter: &Filter) -> Result<usize>;

    /// Replace the stored fields and `updated_at` of an existing row
    fn update(&self, conn: &Connection, entity: &EntityDefinition, record: &Record) -> Result<bool>;

    fn delete(&self, conn: &Connection, entity: &EntityDefinition, ids: &[String]) -> Result<usize>;

    /// Set `field` to null on the given rows
    fn clear_field(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        field: &str,
        ids: &[String],
        updated_at: &str,
    ) -> Result<usize>;

    /// Ids among `ids` that exist for this entity
    fn existing_ids(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        ids: &[String],
    ) -> Result<HashSet<String>> {
        let mut found = HashSet::new();
        for chunk in ids.chunks(CHUNK_SIZE) {
            let filter = Filter::new().where_op("id", FilterOp::In, Value::from(chunk.to_vec()));
            for record in self.find(conn, entity, &filter)? {
                found.insert(record.id);
            }
        }
        Ok(found)
    }

    /// Ids of rows whose `field` holds `target_id`
    fn ids_referencing(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        field: &str,
        target_id: &str,
    ) -> Result<Vec<String>> {
        let filter = Filter::new().eq(field, target_id);
        Ok(self
            .find(conn, entity, &filter)?
            .into_iter()
            .map(|r| r.id)
            .collect())
    }

    /// Next batch of rows ordered by id, strictly after `cursor`
    fn scan_after(
        &self,
        conn: &Connection,
        entity: &EntityDefinition,
        cursor: Option<&str>,
        limit: usize,
    ) -> Result<Vec<Record>> {
        let mut filter = Filter::new().order_by("id").limit(limit);
        if let Some(after) = cursor {
            filter = filter.where_op("id", FilterOp::Gt, after);
        }
        self.find(conn, entity, &filter)
    }
}

static SHARED: SharedBackend = SharedBackend;
static DEDICATED: DedicatedBackend = DedicatedBackend;

/// Backend serving the given storage mode
pub(crate) fn backend_for(mode: StorageMode) -> &'static dyn RecordBackend {
    match mode {
        StorageMode::Shared => &SHARED,
        StorageMode::Dedicated => &DEDICATED,
    }
}
