//! Batched materialize/dematerialize

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{JobStatus, MigrationDirection, MigrationJob, MigrationProgress, MigrationReport, MigrationStep};
use crate::schema::catalog::{self, Change};
use crate::schema::naming::dedicated_table_name;
use crate::schema::{EntityDefinition, SchemaRegistry, StorageMode};
use crate::storage::backend::{backend_for, CHUNK_SIZE};
use crate::storage::{dedicated, shared, Filter, FilterOp};
use crate::{now_timestamp, Error, Result};

const JOB_COLUMNS: &str = "entity_name, direction, batch_size, processed_count, total_count, batches, cursor,
    status, target_table, started_at, updated_at, error, actor, reason";

/// Drives migration jobs for the entities of one registry
pub struct MigrationEngine<'a> {
    registry: &'a SchemaRegistry,
}

impl<'a> MigrationEngine<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self { registry }
    }

    // ========== Convenience ==========

    /// Move a shared entity into its own table, reporting every batch
    pub fn materialize<F>(
        &self,
        entity: &str,
        batch_size: usize,
        reason: Option<&str>,
        actor: Option<&str>,
        on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&MigrationProgress),
    {
        let job = self.begin_materialize(entity, batch_size, reason, actor)?;
        self.run(&job, on_progress)
    }

    /// Move a dedicated entity back into shared storage, reporting every batch
    pub fn dematerialize<F>(
        &self,
        entity: &str,
        batch_size: usize,
        reason: Option<&str>,
        actor: Option<&str>,
        on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&MigrationProgress),
    {
        let job = self.begin_dematerialize(entity, batch_size, reason, actor)?;
        self.run(&job, on_progress)
    }

    /// Step a job until it completes
    pub fn run<F>(&self, job: &MigrationJob, mut on_progress: F) -> Result<MigrationReport>
    where
        F: FnMut(&MigrationProgress),
    {
        loop {
            match self.step(job)? {
                MigrationStep::Batch(progress) => on_progress(&progress),
                MigrationStep::Completed(report) => return Ok(report),
            }
        }
    }

    // ========== Job Lifecycle ==========

    pub fn begin_materialize(
        &self,
        entity: &str,
        batch_size: usize,
        reason: Option<&str>,
        actor: Option<&str>,
    ) -> Result<MigrationJob> {
        self.begin(entity, MigrationDirection::ToDedicated, batch_size, reason, actor)
    }

    pub fn begin_dematerialize(
        &self,
        entity: &str,
        batch_size: usize,
        reason: Option<&str>,
        actor: Option<&str>,
    ) -> Result<MigrationJob> {
        self.begin(entity, MigrationDirection::ToShared, batch_size, reason, actor)
    }

    fn begin(
        &self,
        entity: &str,
        direction: MigrationDirection,
        batch_size: usize,
        reason: Option<&str>,
        actor: Option<&str>,
    ) -> Result<MigrationJob> {
        if batch_size == 0 {
            return Err(Error::validation(entity, "batch_size must be at least 1"));
        }

        let job = self.registry.database().with_transaction(|tx| {
            let def = catalog::load_entity(tx, entity)?;
            if let Some(existing) = load_job(tx, &def.name)? {
                return Err(in_progress(&existing));
            }
            if def.storage_mode != direction.source_mode() {
                return Err(Error::storage_mode(
                    &def.name,
                    format!(
                        "cannot {} an entity that is already {}",
                        direction.operation(),
                        def.storage_mode
                    ),
                ));
            }

            let target_table = match direction {
                MigrationDirection::ToDedicated => {
                    let table = dedicated_table_name(&def.name);
                    let foreign_keys = catalog::native_foreign_keys(tx, &def.name)?;
                    dedicated::create_table(tx, &def, &table, &foreign_keys)?;
                    table
                }
                MigrationDirection::ToShared => {
                    let table = dedicated_table_of(&def)?;
                    check_unreferenced(tx, &def, &table)?;
                    let stale = backend_for(StorageMode::Shared).count(tx, &def, &Filter::new())?;
                    if stale > 0 {
                        return Err(Error::storage_mode(
                            &def.name,
                            format!("{} stale shared rows exist; remove them before dematerializing", stale),
                        ));
                    }
                    table
                }
            };

            let total = backend_for(def.storage_mode).count(tx, &def, &Filter::new())?;
            let now = now_timestamp();
            let job = MigrationJob {
                entity_name: def.name.clone(),
                direction,
                batch_size,
                processed_count: 0,
                total_count: total,
                batches: 0,
                cursor: None,
                status: JobStatus::Running,
                target_table: Some(target_table),
                started_at: now.clone(),
                updated_at: now,
                error: None,
                actor: actor.map(str::to_string),
                reason: reason.map(str::to_string),
            };
            insert_job(tx, &job)?;
            Ok(job)
        })?;

        info!(
            entity = %job.entity_name,
            direction = %job.direction,
            total = job.total_count,
            batch_size,
            "Started migration"
        );
        Ok(job)
    }

    /// Copy the next batch, or finish the migration when nothing is left.
    ///
    /// Each call commits independently; callers wanting cancellation stop
    /// calling and later `resume` or `abort`.
    pub fn step(&self, job: &MigrationJob) -> Result<MigrationStep> {
        let db = self.registry.database();
        let entity = job.entity_name.as_str();

        let current = db
            .with_connection(|conn| load_job(conn, entity))?
            .ok_or_else(|| Error::storage_mode(entity, "no migration in progress"))?;
        if current.is_failed() {
            return Err(failure(
                &current,
                format!(
                    "job failed earlier ({}); resume or abort it",
                    current.error.as_deref().unwrap_or("unknown error")
                ),
            ));
        }

        let copied = db.with_transaction(|tx| copy_batch(tx, &current));
        match copied {
            Ok(Some(progress)) => {
                debug!(
                    %entity,
                    processed = progress.processed,
                    total = progress.total,
                    batch = progress.batch,
                    "Migrated batch"
                );
                Ok(MigrationStep::Batch(progress))
            }
            Ok(None) => match db.with_transaction(|tx| finalize(tx, &current)) {
                Ok(report) => {
                    info!(
                        %entity,
                        direction = %report.direction,
                        records = report.records_migrated,
                        batches = report.batches,
                        duration_ms = report.duration_ms,
                        "Migration completed"
                    );
                    Ok(MigrationStep::Completed(report))
                }
                Err(e) => Err(self.fail(&current, e)),
            },
            Err(e) => Err(self.fail(&current, e)),
        }
    }

    /// Persisted job for an entity, if any
    pub fn status(&self, entity: &str) -> Result<Option<MigrationJob>> {
        self.registry
            .database()
            .with_connection(|conn| load_job(conn, entity))
    }

    /// Every persisted job
    pub fn list_jobs(&self) -> Result<Vec<MigrationJob>> {
        self.registry.database().with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM kdb_migration_jobs ORDER BY started_at",
                JOB_COLUMNS
            ))?;
            let raw = stmt
                .query_map([], row_to_job)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            raw.into_iter().map(RawJob::into_job).collect()
        })
    }

    /// Reactivate a failed job from its last committed batch
    pub fn resume(&self, entity: &str) -> Result<MigrationJob> {
        let job = self.registry.database().with_connection(|conn| {
            let mut job = load_job(conn, entity)?
                .ok_or_else(|| Error::storage_mode(entity, "no migration to resume"))?;
            if job.status == JobStatus::Running {
                return Ok(job);
            }
            job.status = JobStatus::Running;
            job.error = None;
            job.updated_at = now_timestamp();
            conn.execute(
                "UPDATE kdb_migration_jobs SET status = ?1, error = NULL, updated_at = ?2 WHERE entity_name = ?3",
                params![job.status.as_str(), job.updated_at, job.entity_name],
            )?;
            Ok(job)
        })?;
        info!(%entity, processed = job.processed_count, total = job.total_count, "Resumed migration");
        Ok(job)
    }

    /// Discard copied data and the job. The entity stays in its original mode.
    pub fn abort(&self, entity: &str, actor: Option<&str>, reason: Option<&str>) -> Result<MigrationJob> {
        let job = self.registry.database().with_transaction(|tx| {
            let job = load_job(tx, entity)?
                .ok_or_else(|| Error::storage_mode(entity, "no migration to abort"))?;
            discard(tx, &job)?;
            catalog::log_change(
                tx,
                Change {
                    operation: "abort_migration",
                    entity: Some(&job.entity_name),
                    old_value: Some(json!({
                        "direction": job.direction,
                        "processed_count": job.processed_count,
                        "total_count": job.total_count,
                    })),
                    actor,
                    reason,
                    ..Default::default()
                },
            )?;
            Ok(job)
        })?;
        info!(%entity, direction = %job.direction, processed = job.processed_count, "Aborted migration");
        Ok(job)
    }

    /// Record a failure on the job and convert it into a migration error.
    /// A job that committed nothing is discarded entirely.
    fn fail(&self, job: &MigrationJob, cause: Error) -> Error {
        let message = cause.to_string();
        warn!(
            entity = %job.entity_name,
            processed = job.processed_count,
            total = job.total_count,
            error = %message,
            "Migration failed"
        );

        let cleanup = self.registry.database().with_transaction(|tx| {
            if job.processed_count == 0 {
                discard(tx, job)
            } else {
                tx.execute(
                    "UPDATE kdb_migration_jobs SET status = ?1, error = ?2, updated_at = ?3 WHERE entity_name = ?4",
                    params![JobStatus::Failed.as_str(), message, now_timestamp(), job.entity_name],
                )?;
                Ok(())
            }
        });
        if let Err(e) = cleanup {
            warn!(entity = %job.entity_name, error = %e, "Failed to record migration failure");
        }

        match cause {
            Error::Migration { .. } => cause,
            _ => failure(job, message),
        }
    }
}

// ========== Batch Operations ==========

/// Source definition and the definition the target backend writes with
fn sides(def: &EntityDefinition, job: &MigrationJob) -> (EntityDefinition, EntityDefinition) {
    let mut target = def.clone();
    target.storage_mode = job.direction.target_mode();
    if job.direction == MigrationDirection::ToDedicated {
        target.dedicated_table_name = job.target_table.clone();
    }
    (def.clone(), target)
}

fn copy_batch(conn: &Connection, job: &MigrationJob) -> Result<Option<MigrationProgress>> {
    let def = catalog::load_entity(conn, &job.entity_name)?;
    let (source_def, target_def) = sides(&def, job);
    let source = backend_for(job.direction.source_mode());
    let target = backend_for(job.direction.target_mode());

    let rows = source.scan_after(conn, &source_def, job.cursor.as_deref(), job.batch_size)?;
    let Some(last) = rows.last() else {
        return Ok(None);
    };
    for record in &rows {
        target.insert(conn, &target_def, record)?;
    }

    let processed = job.processed_count + rows.len();
    let total = source.count(conn, &source_def, &Filter::new())?.max(processed);
    let batches = job.batches + 1;
    conn.execute(
        "UPDATE kdb_migration_jobs
         SET processed_count = ?1, total_count = ?2, batches = ?3, cursor = ?4, updated_at = ?5
         WHERE entity_name = ?6",
        params![
            processed as i64,
            total as i64,
            batches as i64,
            last.id,
            now_timestamp(),
            job.entity_name
        ],
    )?;

    Ok(Some(MigrationProgress {
        entity: job.entity_name.clone(),
        direction: job.direction,
        processed,
        total,
        batch: batches,
        total_batches: total.div_ceil(job.batch_size),
    }))
}

/// Reconcile, verify, flip the mode and drop the old representation
fn finalize(conn: &Connection, job: &MigrationJob) -> Result<MigrationReport> {
    let def = catalog::load_entity(conn, &job.entity_name)?;
    let (source_def, target_def) = sides(&def, job);
    let source = backend_for(job.direction.source_mode());
    let target = backend_for(job.direction.target_mode());

    // Rows written since the job started
    let changed = Filter::new().where_op("updated_at", FilterOp::Gte, job.started_at.as_str());
    for record in source.find(conn, &source_def, &changed)? {
        target.upsert(conn, &target_def, &record)?;
    }

    // Rows deleted at the source since they were copied
    let mut cursor: Option<String> = None;
    loop {
        let batch = target.scan_after(conn, &target_def, cursor.as_deref(), CHUNK_SIZE)?;
        let Some(last) = batch.last() else {
            break;
        };
        cursor = Some(last.id.clone());
        let ids: Vec<String> = batch.into_iter().map(|r| r.id).collect();
        let present: HashSet<String> = source.existing_ids(conn, &source_def, &ids)?;
        let gone: Vec<String> = ids.into_iter().filter(|id| !present.contains(id)).collect();
        if !gone.is_empty() {
            target.delete(conn, &target_def, &gone)?;
        }
    }

    let source_count = source.count(conn, &source_def, &Filter::new())?;
    let target_count = target.count(conn, &target_def, &Filter::new())?;
    if source_count != target_count {
        return Err(failure(
            job,
            format!(
                "row count mismatch after copy: {} at the source, {} at the target",
                source_count, target_count
            ),
        ));
    }

    let table = job.target_table.clone();
    match job.direction {
        MigrationDirection::ToDedicated => {
            catalog::set_storage_mode(conn, &def.name, StorageMode::Dedicated, table.as_deref())?;
            shared::delete_all(conn, &def)?;
        }
        MigrationDirection::ToShared => {
            let table = dedicated_table_of(&def)?;
            check_unreferenced(conn, &def, &table)?;
            catalog::set_storage_mode(conn, &def.name, StorageMode::Shared, None)?;
            dedicated::drop_table(conn, &table)?;
        }
    }

    catalog::log_change(
        conn,
        Change {
            operation: job.direction.operation(),
            entity: Some(&def.name),
            old_value: Some(json!({ "storage_mode": def.storage_mode })),
            new_value: Some(json!({
                "storage_mode": job.direction.target_mode(),
                "dedicated_table_name": match job.direction {
                    MigrationDirection::ToDedicated => table.clone(),
                    MigrationDirection::ToShared => None,
                },
                "records_migrated": target_count,
                "batches": job.batches,
            })),
            actor: job.actor.as_deref(),
            reason: job.reason.as_deref(),
            ..Default::default()
        },
    )?;
    conn.execute("DELETE FROM kdb_migration_jobs WHERE entity_name = ?1", [&job.entity_name])?;

    Ok(MigrationReport {
        entity: def.name.clone(),
        direction: job.direction,
        records_migrated: target_count,
        batches: job.batches,
        table_name: table,
        duration_ms: elapsed_ms(&job.started_at),
    })
}

/// Remove everything a job copied, then the job itself
fn discard(conn: &Connection, job: &MigrationJob) -> Result<()> {
    match job.direction {
        MigrationDirection::ToDedicated => {
            if let Some(table) = &job.target_table {
                dedicated::drop_table(conn, table)?;
            }
        }
        MigrationDirection::ToShared => {
            if let Some(def) = catalog::try_load_entity(conn, &job.entity_name)? {
                shared::delete_all(conn, &def)?;
            }
        }
    }
    conn.execute("DELETE FROM kdb_migration_jobs WHERE entity_name = ?1", [&job.entity_name])?;
    Ok(())
}

fn dedicated_table_of(def: &EntityDefinition) -> Result<String> {
    def.dedicated_table_name
        .clone()
        .ok_or_else(|| Error::storage_mode(&def.name, "dedicated entity has no table name"))
}

/// Dropping a table other tables reference would fire their native actions
fn check_unreferenced(conn: &Connection, def: &EntityDefinition, table: &str) -> Result<()> {
    let referencing = dedicated::tables_referencing(conn, table, &catalog::dedicated_tables(conn)?)?;
    if referencing.is_empty() {
        return Ok(());
    }
    Err(Error::storage_mode(
        &def.name,
        format!(
            "tables {} hold foreign keys to '{}'; dematerialize them first",
            referencing.join(", "),
            table
        ),
    ))
}

fn elapsed_ms(started_at: &str) -> i64 {
    DateTime::parse_from_rfc3339(started_at)
        .map(|start| (Utc::now() - start.with_timezone(&Utc)).num_milliseconds())
        .unwrap_or(0)
}

fn failure(job: &MigrationJob, message: String) -> Error {
    Error::Migration {
        entity: job.entity_name.clone(),
        direction: job.direction.to_string(),
        processed: job.processed_count,
        total: job.total_count,
        message,
    }
}

fn in_progress(job: &MigrationJob) -> Error {
    Error::MigrationInProgress {
        entity: job.entity_name.clone(),
        direction: job.direction.to_string(),
        status: job.status.to_string(),
        processed: job.processed_count,
        total: job.total_count,
    }
}

// ========== Job Rows ==========

struct RawJob {
    entity_name: String,
    direction: String,
    batch_size: i64,
    processed_count: i64,
    total_count: i64,
    batches: i64,
    cursor: Option<String>,
    status: String,
    target_table: Option<String>,
    started_at: String,
    updated_at: String,
    error: Option<String>,
    actor: Option<String>,
    reason: Option<String>,
}

impl RawJob {
    fn into_job(self) -> Result<MigrationJob> {
        Ok(MigrationJob {
            entity_name: self.entity_name,
            direction: self.direction.parse()?,
            batch_size: self.batch_size as usize,
            processed_count: self.processed_count as usize,
            total_count: self.total_count as usize,
            batches: self.batches as usize,
            cursor: self.cursor,
            status: self.status.parse()?,
            target_table: self.target_table,
            started_at: self.started_at,
            updated_at: self.updated_at,
            error: self.error,
            actor: self.actor,
            reason: self.reason,
        })
    }
}

fn row_to_job(row: &Row) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        entity_name: row.get(0)?,
        direction: row.get(1)?,
        batch_size: row.get(2)?,
        processed_count: row.get(3)?,
        total_count: row.get(4)?,
        batches: row.get(5)?,
        cursor: row.get(6)?,
        status: row.get(7)?,
        target_table: row.get(8)?,
        started_at: row.get(9)?,
        updated_at: row.get(10)?,
        error: row.get(11)?,
        actor: row.get(12)?,
        reason: row.get(13)?,
    })
}

fn load_job(conn: &Connection, entity: &str) -> Result<Option<MigrationJob>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM kdb_migration_jobs WHERE entity_name = ?1", JOB_COLUMNS),
            [entity],
            row_to_job,
        )
        .optional()?;
    raw.map(RawJob::into_job).transpose()
}

fn insert_job(conn: &Connection, job: &MigrationJob) -> Result<()> {
    conn.execute(
        &format!(
            "INSERT INTO kdb_migration_jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            JOB_COLUMNS
        ),
        params![
            job.entity_name,
            job.direction.as_str(),
            job.batch_size as i64,
            job.processed_count as i64,
            job.total_count as i64,
            job.batches as i64,
            job.cursor,
            job.status.as_str(),
            job.target_table,
            job.started_at,
            job.updated_at,
            job.error,
            job.actor,
            job.reason,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySpec, FieldSpec, FieldType};
    use crate::storage::{Database, Document, StorageRouter};
    use serde_json::Value;

    fn registry_with_customers(n: usize) -> SchemaRegistry {
        let registry = SchemaRegistry::new(Database::open_in_memory().unwrap());
        registry
            .define_entity(
                EntitySpec::new("Customer")
                    .field(FieldSpec::new("name", FieldType::String).required())
                    .field(FieldSpec::new("tier", FieldType::Int)),
                None,
            )
            .unwrap();
        let router = StorageRouter::new(&registry);
        for i in 0..n {
            router
                .insert("Customer", doc(&format!("c{}", i), i as i64), None)
                .unwrap();
        }
        registry
    }

    fn doc(name: &str, tier: i64) -> Document {
        let mut d = Document::new();
        d.insert("name".into(), Value::from(name));
        d.insert("tier".into(), Value::from(tier));
        d
    }

    fn names(registry: &SchemaRegistry) -> Vec<String> {
        let mut names: Vec<String> = StorageRouter::new(registry)
            .find("Customer", &Filter::new())
            .unwrap()
            .iter()
            .map(|r| r.get_str("name").unwrap_or_default().to_string())
            .collect();
        names.sort();
        names
    }

    /// Null out the required field of the row copied last
    fn corrupt_last_row(registry: &SchemaRegistry) {
        registry
            .database()
            .with_connection(|conn| {
                conn.execute(
                    "UPDATE kdb_records SET data = json_set(data, '$.name', NULL)
                     WHERE id = (SELECT MAX(id) FROM kdb_records)",
                    [],
                )?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn test_materialize_reports_every_batch() {
        let registry = registry_with_customers(7);
        let engine = MigrationEngine::new(&registry);

        let mut seen = Vec::new();
        let report = engine
            .materialize("Customer", 3, Some("hot entity"), Some("tester"), |p| {
                seen.push(p.processed)
            })
            .unwrap();

        assert_eq!(seen, vec![3, 6, 7]);
        assert_eq!(report.records_migrated, 7);
        assert_eq!(report.batches, 3);
        assert_eq!(report.table_name.as_deref(), Some("ent_customer"));

        let def = registry.get_entity("Customer").unwrap();
        assert_eq!(def.storage_mode, StorageMode::Dedicated);
        let router = StorageRouter::new(&registry);
        assert_eq!(router.count("Customer", &Filter::new()).unwrap(), 7);
        let counts = router.row_counts("Customer").unwrap();
        assert_eq!(counts.shared, 0);
        assert_eq!(counts.dedicated, Some(7));
        assert!(engine.status("Customer").unwrap().is_none());

        let log = registry.changelog(Some("Customer"), 1).unwrap();
        assert_eq!(log[0].operation, "materialize");
        assert_eq!(log[0].reason.as_deref(), Some("hot entity"));
    }

    #[test]
    fn test_round_trip_preserves_values() {
        let registry = registry_with_customers(5);
        let before = names(&registry);
        let engine = MigrationEngine::new(&registry);

        engine.materialize("Customer", 2, None, None, |_| {}).unwrap();
        assert_eq!(names(&registry), before);

        engine.dematerialize("Customer", 2, None, None, |_| {}).unwrap();
        assert_eq!(names(&registry), before);

        let def = registry.get_entity("Customer").unwrap();
        assert_eq!(def.storage_mode, StorageMode::Shared);
        assert!(def.dedicated_table_name.is_none());
        let exists = registry
            .database()
            .with_connection(|conn| crate::storage::sqlite::table_exists(conn, "ent_customer"))
            .unwrap();
        assert!(!exists);
    }

    #[test]
    fn test_wrong_mode_and_exclusivity() {
        let registry = registry_with_customers(2);
        let engine = MigrationEngine::new(&registry);

        let err = engine.begin_dematerialize("Customer", 10, None, None).unwrap_err();
        assert!(matches!(err, Error::StorageMode { .. }));

        let job = engine.begin_materialize("Customer", 10, None, None).unwrap();
        let err = engine.begin_materialize("Customer", 10, None, None).unwrap_err();
        assert!(matches!(err, Error::MigrationInProgress { .. }));

        engine.run(&job, |_| {}).unwrap();
        let err = engine.begin_materialize("Customer", 10, None, None).unwrap_err();
        assert!(matches!(err, Error::StorageMode { .. }));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let registry = registry_with_customers(1);
        let err = MigrationEngine::new(&registry)
            .begin_materialize("Customer", 0, None, None)
            .unwrap_err();
        assert!(matches!(err, Error::Validation { .. }));
    }

    #[test]
    fn test_writes_between_batches_are_reconciled() {
        let registry = registry_with_customers(4);
        let engine = MigrationEngine::new(&registry);
        let router = StorageRouter::new(&registry);

        let job = engine.begin_materialize("Customer", 2, None, None).unwrap();
        assert!(matches!(engine.step(&job).unwrap(), MigrationStep::Batch(_)));

        // Writes still land in shared storage mid-migration
        let added = router.insert("Customer", doc("late", 9), None).unwrap();
        let victim = router.find("Customer", &Filter::new().eq("name", "c0")).unwrap()[0].id.clone();
        let renamed = router.find("Customer", &Filter::new().eq("name", "c1")).unwrap()[0].id.clone();
        router
            .update("Customer", &renamed, doc("c1-renamed", 1))
            .unwrap();
        router
            .delete("Customer", &victim, crate::relationship::DeleteOptions::default())
            .unwrap();

        let report = engine.run(&job, |_| {}).unwrap();
        assert_eq!(report.records_migrated, 4);

        assert!(router.get("Customer", &added).unwrap().is_some());
        assert!(router.get("Customer", &victim).unwrap().is_none());
        let record = router.get("Customer", &renamed).unwrap().unwrap();
        assert_eq!(record.get_str("name"), Some("c1-renamed"));
    }

    #[test]
    fn test_failure_before_any_batch_leaves_no_trace() {
        let registry = registry_with_customers(3);
        corrupt_last_row(&registry);
        let engine = MigrationEngine::new(&registry);

        let err = engine.materialize("Customer", 10, None, None, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Migration { processed: 0, .. }));

        assert!(engine.status("Customer").unwrap().is_none());
        let counts = StorageRouter::new(&registry).row_counts("Customer").unwrap();
        assert_eq!(counts.storage_mode, StorageMode::Shared);
        assert_eq!(counts.shared, 3);
        assert_eq!(counts.dedicated, None);
    }

    #[test]
    fn test_partial_failure_is_detectable_and_resumable() {
        let registry = registry_with_customers(7);
        corrupt_last_row(&registry);
        let engine = MigrationEngine::new(&registry);

        let err = engine.materialize("Customer", 3, None, None, |_| {}).unwrap_err();
        assert!(matches!(err, Error::Migration { processed: 6, total: 7, .. }));

        let job = engine.status("Customer").unwrap().unwrap();
        assert!(job.is_failed());
        assert_eq!(job.processed_count, 6);
        let counts = StorageRouter::new(&registry).row_counts("Customer").unwrap();
        assert_eq!(counts.storage_mode, StorageMode::Shared);
        assert_eq!((counts.shared, counts.dedicated), (7, Some(6)));

        // A failed job refuses to step until resumed
        assert!(matches!(engine.step(&job).unwrap_err(), Error::Migration { .. }));

        registry
            .database()
            .with_connection(|conn| {
                conn.execute("UPDATE kdb_records SET data = json_set(data, '$.name', 'fixed') WHERE json_extract(data, '$.name') IS NULL", [])?;
                Ok(())
            })
            .unwrap();
        let job = engine.resume("Customer").unwrap();
        let report = engine.run(&job, |_| {}).unwrap();
        assert_eq!(report.records_migrated, 7);
        assert_eq!(registry.get_entity("Customer").unwrap().storage_mode, StorageMode::Dedicated);
    }

    #[test]
    fn test_abort_discards_copied_rows() {
        let registry = registry_with_customers(5);
        let engine = MigrationEngine::new(&registry);

        let job = engine.begin_materialize("Customer", 2, None, None).unwrap();
        engine.step(&job).unwrap();
        engine.abort("Customer", Some("tester"), Some("changed my mind")).unwrap();

        assert!(engine.status("Customer").unwrap().is_none());
        let counts = StorageRouter::new(&registry).row_counts("Customer").unwrap();
        assert_eq!(counts.storage_mode, StorageMode::Shared);
        assert_eq!(counts.dedicated, None);
        assert_eq!(counts.shared, 5);
        assert_eq!(registry.changelog(Some("Customer"), 1).unwrap()[0].operation, "abort_migration");

        // A fresh migration can start afterwards
        engine.materialize("Customer", 2, None, None, |_| {}).unwrap();
    }

    #[test]
    fn test_dematerialize_refused_while_referenced() {
        use crate::schema::RelationshipSpec;

        let registry = registry_with_customers(1);
        registry
            .define_entity(EntitySpec::new("Order").field(FieldSpec::new("total", FieldType::Float)), None)
            .unwrap();
        registry
            .add_relationship(RelationshipSpec::many_to_one("customer", "Order", "Customer"), None, None)
            .unwrap();

        let engine = MigrationEngine::new(&registry);
        engine.materialize("Customer", 10, None, None, |_| {}).unwrap();
        engine.materialize("Order", 10, None, None, |_| {}).unwrap();

        let err = engine.begin_dematerialize("Customer", 10, None, None).unwrap_err();
        assert!(matches!(err, Error::StorageMode { .. }));

        engine.dematerialize("Order", 10, None, None, |_| {}).unwrap();
        engine.dematerialize("Customer", 10, None, None, |_| {}).unwrap();
    }
}
