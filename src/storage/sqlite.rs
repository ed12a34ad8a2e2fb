//! SQLite connection management

use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::schema;
use crate::Result;

/// Connection pragmas applied when a database is opened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SqliteOptions {
    /// Enforce native foreign keys on dedicated tables
    pub foreign_keys: bool,
    /// WAL journal mode (ignored for in-memory databases)
    pub wal_mode: bool,
    pub busy_timeout_ms: u64,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            foreign_keys: true,
            wal_mode: true,
            busy_timeout_ms: 5000,
        }
    }
}

/// Thread-safe handle to the single SQLite database holding metadata,
/// shared records, dedicated tables, junction tables and metrics.
///
/// Cloning shares the underlying connection. The mutex is not reentrant:
/// code running inside `with_connection` or `with_transaction` must use the
/// connection it was handed and never call back into a `Database` method.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open a database file (creates if doesn't exist)
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &SqliteOptions::default())
    }

    /// Open a database file with explicit pragmas
    pub fn open_with(path: &Path, options: &SqliteOptions) -> Result<Self> {
        info!(path = %path.display(), "Opening database");
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        Self::initialize(conn, options, true)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::initialize(conn, &SqliteOptions::default(), false)
    }

    fn initialize(conn: Connection, options: &SqliteOptions, on_disk: bool) -> Result<Self> {
        debug!(?options, "Configuring SQLite pragmas");
        if options.wal_mode && on_disk {
            // journal_mode returns a row, so it cannot go through execute
            let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
            conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        }
        if options.foreign_keys {
            conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        }
        conn.busy_timeout(std::time::Duration::from_millis(options.busy_timeout_ms))?;

        for stmt in schema::all_schema_statements() {
            conn.execute(stmt, [])?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Execute a closure with the connection (autocommit)
    pub fn with_connection<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    /// Execute a closure inside one transaction.
    ///
    /// Commits when the closure returns `Ok`; any error rolls back every
    /// statement the closure issued.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Get database statistics
    pub fn stats(&self) -> Result<DbStats> {
        self.with_connection(|conn| {
            let count = |sql: &str| -> Result<usize> {
                let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
                Ok(n as usize)
            };
            Ok(DbStats {
                entities: count("SELECT COUNT(*) FROM kdb_entity_definitions WHERE is_active = 1")?,
                dedicated_entities: count(
                    "SELECT COUNT(*) FROM kdb_entity_definitions WHERE is_active = 1 AND storage_mode = 'dedicated'",
                )?,
                relationships: count("SELECT COUNT(*) FROM kdb_relationship_definitions WHERE is_active = 1")?,
                shared_records: count("SELECT COUNT(*) FROM kdb_records")?,
                metrics: count("SELECT COUNT(*) FROM kdb_query_metrics")?,
                migration_jobs: count("SELECT COUNT(*) FROM kdb_migration_jobs")?,
            })
        })
    }
}

// ========== Connection Helpers ==========

/// Check whether a physical table exists
pub(crate) fn table_exists(conn: &Connection, table: &str) -> Result<bool> {
    let found: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?;
    Ok(found.is_some())
}

/// Quote an identifier for interpolation into SQL
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Comma-separated `?` placeholders
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Database statistics
#[derive(Debug, Clone, Serialize)]
pub struct DbStats {
    pub entities: usize,
    pub dedicated_entities: usize,
    pub relationships: usize,
    pub shared_records: usize,
    pub metrics: usize,
    pub migration_jobs: usize,
}

impl std::fmt::Display for DbStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database Statistics:")?;
        writeln!(f, "  Entities: {} ({} dedicated)", self.entities, self.dedicated_entities)?;
        writeln!(f, "  Relationships: {}", self.relationships)?;
        writeln!(f, "  Shared records: {}", self.shared_records)?;
        writeln!(f, "  Query metrics: {}", self.metrics)?;
        writeln!(f, "  Migration jobs: {}", self.migration_jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_schema_applied() {
        let db = Database::open_in_memory().unwrap();
        db.with_connection(|conn| {
            for table in [
                "kdb_entity_definitions",
                "kdb_field_definitions",
                "kdb_relationship_definitions",
                "kdb_junction_tables",
                "kdb_schema_changelog",
                "kdb_records",
                "kdb_query_metrics",
                "kdb_migration_jobs",
            ] {
                assert!(table_exists(conn, table)?, "missing {}", table);
            }
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_foreign_keys_enabled() {
        let db = Database::open_in_memory().unwrap();
        let on: i64 = db
            .with_connection(|conn| Ok(conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(on, 1);
    }

    #[test]
    fn test_file_database_uses_wal() {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("nested").join("test.db")).unwrap();
        let mode: String = db
            .with_connection(|conn| Ok(conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let db = Database::open_in_memory().unwrap();
        let result: Result<()> = db.with_transaction(|tx| {
            tx.execute(
                "INSERT INTO kdb_schema_changelog (id, timestamp, operation) VALUES ('x', 't', 'op')",
                [],
            )?;
            Err(crate::Error::validation("Test", "boom"))
        });
        assert!(result.is_err());

        let stats_rows: i64 = db
            .with_connection(|conn| {
                Ok(conn.query_row("SELECT COUNT(*) FROM kdb_schema_changelog", [], |row| row.get(0))?)
            })
            .unwrap();
        assert_eq!(stats_rows, 0);
    }

    #[test]
    fn test_stats_display() {
        let db = Database::open_in_memory().unwrap();
        let stats = db.stats().unwrap();
        assert_eq!(stats.entities, 0);
        assert!(stats.to_string().contains("Entities: 0"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("name"), "\"name\"");
        assert_eq!(quote_ident("a\"b"), "\"a\"\"b\"");
        assert_eq!(placeholders(3), "?, ?, ?");
    }
}
