//! Metadata and shared-storage table definitions
//!
//! Every table created here is prefixed `kdb_`. Dedicated entity tables
//! (`ent_*`) and junction tables (`jt_*`) are created at runtime.

/// Entity definitions. `storage_mode` is `shared` or `dedicated`.
pub const CREATE_ENTITY_DEFINITIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_entity_definitions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    storage_mode TEXT NOT NULL DEFAULT 'shared',
    dedicated_table_name TEXT,
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by TEXT
)
"#;

/// Field definitions, ordered by `position` within an entity
pub const CREATE_FIELD_DEFINITIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_field_definitions (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES kdb_entity_definitions(id),
    name TEXT NOT NULL,
    field_type TEXT NOT NULL,
    is_required INTEGER NOT NULL DEFAULT 0,
    is_unique INTEGER NOT NULL DEFAULT 0,
    is_indexed INTEGER NOT NULL DEFAULT 0,
    default_value TEXT,
    description TEXT,
    position INTEGER NOT NULL,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    created_by TEXT,
    UNIQUE(entity_id, name)
)
"#;

/// Relationship definitions. Entities are referenced by name; names are
/// unique and never reused.
pub const CREATE_RELATIONSHIP_DEFINITIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_relationship_definitions (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    source_entity TEXT NOT NULL,
    target_entity TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    foreign_key_field TEXT,
    inverse_name TEXT,
    on_delete TEXT NOT NULL DEFAULT 'SET_NULL',
    on_update TEXT NOT NULL DEFAULT 'CASCADE',
    description TEXT,
    is_active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    created_by TEXT
)
"#;

/// Junction tables backing many-to-many relationships
pub const CREATE_JUNCTION_TABLES_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_junction_tables (
    id TEXT PRIMARY KEY,
    relationship_id TEXT NOT NULL UNIQUE REFERENCES kdb_relationship_definitions(id),
    table_name TEXT NOT NULL UNIQUE,
    source_fk_column TEXT NOT NULL,
    target_fk_column TEXT NOT NULL,
    created_at TEXT NOT NULL
)
"#;

/// Append-only audit log of schema changes
pub const CREATE_SCHEMA_CHANGELOG_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_schema_changelog (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    operation TEXT NOT NULL,
    entity_name TEXT,
    field_name TEXT,
    old_value TEXT,
    new_value TEXT,
    created_by TEXT,
    reason TEXT
)
"#;

/// Shared document storage. `data` holds a JSON object keyed by field name.
pub const CREATE_RECORDS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_records (
    id TEXT PRIMARY KEY,
    entity_id TEXT NOT NULL REFERENCES kdb_entity_definitions(id),
    data TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    created_by TEXT
)
"#;

/// Query metrics feeding the materialization advisor
pub const CREATE_QUERY_METRICS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_query_metrics (
    id TEXT PRIMARY KEY,
    entity_name TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    query_type TEXT NOT NULL,
    execution_time_ms REAL NOT NULL,
    row_count INTEGER NOT NULL,
    has_join INTEGER NOT NULL DEFAULT 0,
    tables_accessed TEXT NOT NULL DEFAULT '[]',
    created_by TEXT
)
"#;

/// Persisted migration jobs, at most one per entity
pub const CREATE_MIGRATION_JOBS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS kdb_migration_jobs (
    entity_name TEXT PRIMARY KEY,
    direction TEXT NOT NULL,
    batch_size INTEGER NOT NULL,
    processed_count INTEGER NOT NULL DEFAULT 0,
    total_count INTEGER NOT NULL DEFAULT 0,
    batches INTEGER NOT NULL DEFAULT 0,
    cursor TEXT,
    status TEXT NOT NULL,
    target_table TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    error TEXT,
    actor TEXT,
    reason TEXT
)
"#;

/// SQL to create indexes
pub const CREATE_INDEXES: &[&str] = &[
    "CREATE INDEX IF NOT EXISTS idx_kdb_fields_entity ON kdb_field_definitions(entity_id)",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_kdb_relationships_name ON kdb_relationship_definitions(source_entity, name) WHERE is_active = 1",
    "CREATE INDEX IF NOT EXISTS idx_kdb_relationships_target ON kdb_relationship_definitions(target_entity)",
    "CREATE INDEX IF NOT EXISTS idx_kdb_records_entity ON kdb_records(entity_id, id)",
    "CREATE INDEX IF NOT EXISTS idx_kdb_records_updated ON kdb_records(entity_id, updated_at)",
    "CREATE INDEX IF NOT EXISTS idx_kdb_changelog_entity ON kdb_schema_changelog(entity_name, timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_kdb_metrics_entity_time ON kdb_query_metrics(entity_name, timestamp)",
];

/// All schema creation statements
pub fn all_schema_statements() -> Vec<&'static str> {
    let mut stmts = vec![
        CREATE_ENTITY_DEFINITIONS_TABLE,
        CREATE_FIELD_DEFINITIONS_TABLE,
        CREATE_RELATIONSHIP_DEFINITIONS_TABLE,
        CREATE_JUNCTION_TABLES_TABLE,
        CREATE_SCHEMA_CHANGELOG_TABLE,
        CREATE_RECORDS_TABLE,
        CREATE_QUERY_METRICS_TABLE,
        CREATE_MIGRATION_JOBS_TABLE,
    ];
    stmts.extend(CREATE_INDEXES.iter().copied());
    stmts
}
