//! Junction table storage for many-to-many relationships

use rusqlite::{params_from_iter, Connection};

use crate::now_timestamp;
use crate::schema::JunctionTable;
use crate::storage::backend::CHUNK_SIZE;
use crate::storage::sqlite::{placeholders, quote_ident};
use crate::{new_id, Result};

/// Create the physical junction table with a unique (source, target) pair
pub(crate) fn create_table(conn: &Connection, junction: &JunctionTable) -> Result<()> {
    let table = quote_ident(&junction.table_name);
    let source = quote_ident(&junction.source_fk_column);
    let target = quote_ident(&junction.target_fk_column);
    conn.execute(
        &format!(
            "CREATE TABLE {table} (
                \"id\" TEXT PRIMARY KEY,
                {source} TEXT NOT NULL,
                {target} TEXT NOT NULL,
                \"created_at\" TEXT NOT NULL,
                UNIQUE({source}, {target})
            )"
        ),
        [],
    )?;
    conn.execute(
        &format!(
            "CREATE INDEX {} ON {table}({target})",
            quote_ident(&format!("idx_{}_target", junction.table_name))
        ),
        [],
    )?;
    Ok(())
}

/// Insert (source, target) pairs, ignoring pairs already present.
/// Returns the number of new pairs.
pub(crate) fn insert_pairs(
    conn: &Connection,
    junction: &JunctionTable,
    source_id: &str,
    target_ids: &[String],
) -> Result<usize> {
    let now = now_timestamp();
    let mut inserted = 0;
    // four bound values per row
    for chunk in target_ids.chunks(CHUNK_SIZE / 4) {
        let rows = vec!["(?, ?, ?, ?)"; chunk.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO {} (\"id\", {}, {}, \"created_at\") VALUES {}",
            quote_ident(&junction.table_name),
            quote_ident(&junction.source_fk_column),
            quote_ident(&junction.target_fk_column),
            rows
        );
        let mut params = Vec::with_capacity(chunk.len() * 4);
        for target_id in chunk {
            params.push(new_id());
            params.push(source_id.to_string());
            params.push(target_id.clone());
            params.push(now.clone());
        }
        inserted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(inserted)
}

/// Remove (source, target) pairs. Returns the number removed.
pub(crate) fn delete_pairs(
    conn: &Connection,
    junction: &JunctionTable,
    source_id: &str,
    target_ids: &[String],
) -> Result<usize> {
    let mut deleted = 0;
    for chunk in target_ids.chunks(CHUNK_SIZE) {
        let sql = format!(
            "DELETE FROM {} WHERE {} = ? AND {} IN ({})",
            quote_ident(&junction.table_name),
            quote_ident(&junction.source_fk_column),
            quote_ident(&junction.target_fk_column),
            placeholders(chunk.len())
        );
        let params = std::iter::once(source_id).chain(chunk.iter().map(String::as_str));
        deleted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(deleted)
}

/// Remove every pair whose `column` holds one of `ids`
pub(crate) fn delete_by_column(conn: &Connection, table: &str, column: &str, ids: &[String]) -> Result<usize> {
    let mut deleted = 0;
    for chunk in ids.chunks(CHUNK_SIZE) {
        let sql = format!(
            "DELETE FROM {} WHERE {} IN ({})",
            quote_ident(table),
            quote_ident(column),
            placeholders(chunk.len())
        );
        deleted += conn.execute(&sql, params_from_iter(chunk))?;
    }
    Ok(deleted)
}

/// Target ids linked to `source_id`, in link order
pub(crate) fn linked_ids(conn: &Connection, junction: &JunctionTable, source_id: &str) -> Result<Vec<String>> {
    let sql = format!(
        "SELECT {target} FROM {} WHERE {} = ?1 ORDER BY \"created_at\", rowid",
        quote_ident(&junction.table_name),
        quote_ident(&junction.source_fk_column),
        target = quote_ident(&junction.target_fk_column),
    );
    let mut stmt = conn.prepare(&sql)?;
    let ids = stmt
        .query_map([source_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Database;

    fn junction() -> JunctionTable {
        JunctionTable {
            table_name: "jt_student_courses".into(),
            source_fk_column: "student_id".into(),
            target_fk_column: "course_id".into(),
        }
    }

    #[test]
    fn test_insert_is_idempotent() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let jt = junction();
            create_table(conn, &jt)?;
            assert_eq!(insert_pairs(conn, &jt, "s1", &["c1".into(), "c2".into()])?, 2);
            assert_eq!(insert_pairs(conn, &jt, "s1", &["c1".into()])?, 0);
            assert_eq!(linked_ids(conn, &jt, "s1")?, vec!["c1", "c2"]);
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_delete_pairs_and_by_column() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let jt = junction();
            create_table(conn, &jt)?;
            insert_pairs(conn, &jt, "s1", &["c1".into(), "c2".into()])?;
            insert_pairs(conn, &jt, "s2", &["c1".into()])?;

            assert_eq!(delete_pairs(conn, &jt, "s1", &["c2".into(), "c9".into()])?, 1);
            assert_eq!(delete_by_column(conn, &jt.table_name, "course_id", &["c1".into()])?, 2);
            assert!(linked_ids(conn, &jt, "s1")?.is_empty());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_bulk_insert_spans_chunks() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            let jt = junction();
            create_table(conn, &jt)?;
            let targets: Vec<String> = (0..300).map(|i| format!("c{:03}", i)).collect();
            assert_eq!(insert_pairs(conn, &jt, "s1", &targets)?, 300);
            assert_eq!(linked_ids(conn, &jt, "s1")?.len(), 300);
            Ok(())
        })
        .unwrap();
    }
}
