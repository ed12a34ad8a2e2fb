use crate::{emit_success, OutputMode};
use hybridb::config::{self, HybridbConfig};
use hybridb::migration::MigrationJob;
use hybridb::ui::{self, Icons, ProgressManager, ProgressMessage};
use hybridb::{
    DeleteOptions, DeleteOutcome, Document, EntitySpec, FieldSpec, FieldType, Filter, FilterOp,
    Hybridb, MigrationDirection, MigrationEngine, OnDeleteAction, RelationshipSpec,
    RelationshipType,
};
use owo_colors::OwoColorize;
use serde_json::{json, Value};
use std::path::Path;
use std::time::Instant;

// ========== Argument Parsing ==========

/// `name:type[:required][:unique][:indexed]`
pub fn parse_field_spec(spec: &str) -> anyhow::Result<FieldSpec> {
    let mut parts = spec.split(':');
    let name = parts.next().unwrap_or_default().trim();
    let Some(type_name) = parts.next() else {
        anyhow::bail!("field '{}' needs a type, e.g. {}:string", spec, name);
    };
    let field_type: FieldType = type_name.trim().parse()?;

    let mut field = FieldSpec::new(name, field_type);
    for flag in parts {
        field = match flag.trim() {
            "required" => field.required(),
            "unique" => field.unique(),
            "indexed" => field.indexed(),
            other => anyhow::bail!("unknown field flag '{}' (expected required, unique or indexed)", other),
        };
    }
    Ok(field)
}

/// `field<op>value` where op is one of `>=`, `<=`, `!=`, `=`, `>`, `<` or `~`
/// (contains). Values parse as JSON, falling back to a plain string.
pub fn parse_condition(condition: &str) -> anyhow::Result<(String, FilterOp, Value)> {
    const OPERATORS: [(&str, FilterOp); 7] = [
        (">=", FilterOp::Gte),
        ("<=", FilterOp::Lte),
        ("!=", FilterOp::Ne),
        ("=", FilterOp::Eq),
        (">", FilterOp::Gt),
        ("<", FilterOp::Lt),
        ("~", FilterOp::Contains),
    ];

    let found = OPERATORS
        .iter()
        .filter_map(|(token, op)| condition.find(token).map(|pos| (pos, *token, *op)))
        .min_by_key(|(pos, token, _)| (*pos, std::cmp::Reverse(token.len())));
    let Some((pos, token, op)) = found else {
        anyhow::bail!("condition '{}' has no operator (use =, !=, >, >=, <, <= or ~)", condition);
    };

    let field = condition[..pos].trim();
    let raw = condition[pos + token.len()..].trim();
    if field.is_empty() {
        anyhow::bail!("condition '{}' has no field", condition);
    }
    let value = match op {
        FilterOp::Contains => Value::String(raw.to_string()),
        _ => parse_value(raw),
    };
    Ok((field.to_string(), op, value))
}

fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_document(data: &str) -> anyhow::Result<Document> {
    match serde_json::from_str::<Value>(data)? {
        Value::Object(map) => Ok(map),
        other => anyhow::bail!("expected a JSON object, got {}", other),
    }
}

#[allow(clippy::too_many_arguments)]
pub fn relationship_spec(
    name: &str,
    source: &str,
    target: &str,
    relationship_type: &str,
    on_delete: &str,
    foreign_key: Option<String>,
    inverse: Option<String>,
    description: Option<String>,
) -> anyhow::Result<RelationshipSpec> {
    let relationship_type: RelationshipType = relationship_type.parse()?;
    let on_delete: OnDeleteAction = on_delete.parse()?;
    let mut spec = RelationshipSpec::new(name, source, target, relationship_type).on_delete(on_delete);
    if let Some(field) = foreign_key {
        spec = spec.foreign_key(field);
    }
    if let Some(inverse) = inverse {
        spec = spec.inverse(inverse);
    }
    if let Some(description) = description {
        spec = spec.with_description(description);
    }
    Ok(spec)
}

// ========== Setup ==========

pub fn run_init(mode: OutputMode, config_path: &Path, cfg: HybridbConfig, force: bool) -> anyhow::Result<()> {
    let mut cfg = cfg;
    if cfg.database.is_none() {
        cfg.database = Some(config::default_database_path().to_string_lossy().to_string());
    }
    config::write_config(config_path, &cfg, force)?;
    config::ensure_db_dir(&cfg.database_path())?;
    Hybridb::open(&cfg)?;

    if mode.is_human() {
        ui::header("Initialized hybridb");
        ui::info("Config", &config_path.display().to_string());
        ui::info("Database", &cfg.database_path().display().to_string());
    }
    emit_success(
        mode,
        "init",
        json!({
            "config": config_path.display().to_string(),
            "database": cfg.database_path().display().to_string(),
        }),
    )
}

// ========== Schema ==========

pub fn run_define_entity(
    mode: OutputMode,
    db: &Hybridb,
    name: &str,
    fields: &[String],
    description: Option<String>,
    actor: Option<&str>,
) -> anyhow::Result<()> {
    let mut spec = EntitySpec::new(name);
    for field in fields {
        spec = spec.field(parse_field_spec(field)?);
    }
    if let Some(description) = description {
        spec = spec.with_description(description);
    }
    let entity = db.registry().define_entity(spec, actor)?;

    if mode.is_human() {
        ui::success(&format!("Defined entity {} ({} fields)", entity.name, entity.fields.len()));
        let table = ui::fields_table(&entity);
        if !table.is_empty() {
            println!("{}", table);
        }
    }
    emit_success(mode, "entity.define", serde_json::to_value(&entity)?)
}

pub fn run_list_entities(mode: OutputMode, db: &Hybridb) -> anyhow::Result<()> {
    let entities = db
        .registry()
        .list_entities()?
        .iter()
        .map(|name| db.registry().get_entity(name))
        .collect::<hybridb::Result<Vec<_>>>()?;

    if mode.is_human() {
        if entities.is_empty() {
            println!("{} No entities defined.", Icons::INFO);
        } else {
            println!("{}", ui::entities_table(&entities));
        }
    }
    emit_success(mode, "entity.list", serde_json::to_value(&entities)?)
}

pub fn run_describe_entity(mode: OutputMode, db: &Hybridb, name: &str) -> anyhow::Result<()> {
    let description = db.registry().describe_entity(name)?;

    if mode.is_human() {
        let entity = &description.entity;
        ui::header(&entity.name);
        ui::status(
            Icons::DATABASE,
            "Storage",
            &entity.storage_mode.style(ui::theme().mode(entity.storage_mode)).to_string(),
        );
        if let Some(table) = &entity.dedicated_table_name {
            ui::status(Icons::PACKAGE, "Table", table);
        }
        ui::status(Icons::STATS, "Records", &description.record_count.to_string());
        if let Some(text) = &entity.description {
            ui::status(Icons::INFO, "Description", text);
        }
        ui::section("Fields");
        println!("{}", ui::fields_table(entity));
        if !description.outgoing.is_empty() {
            ui::section("Relationships");
            println!("{}", ui::relationships_table(&description.outgoing));
        }
        if !description.incoming.is_empty() {
            ui::section("Referenced by");
            println!("{}", ui::relationships_table(&description.incoming));
        }
    }
    emit_success(mode, "entity.describe", serde_json::to_value(&description)?)
}

pub fn run_disable_entity(
    mode: OutputMode,
    db: &Hybridb,
    name: &str,
    actor: Option<&str>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    db.registry().disable_entity(name, actor, reason)?;
    if mode.is_human() {
        ui::success(&format!("Disabled entity {}", name));
    }
    emit_success(mode, "entity.disable", json!({ "entity": name }))
}

#[allow(clippy::too_many_arguments)]
pub fn run_add_field(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    spec: &str,
    default: Option<&str>,
    description: Option<String>,
    actor: Option<&str>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let mut field = parse_field_spec(spec)?;
    if let Some(default) = default {
        field = field.with_default(parse_value(default));
    }
    if let Some(description) = description {
        field = field.with_description(description);
    }
    let field = db.registry().add_field(entity, field, actor, reason)?;

    if mode.is_human() {
        ui::success(&format!("Added field {}.{} ({})", entity, field.name, field.field_type));
    }
    emit_success(mode, "field.add", serde_json::to_value(&field)?)
}

pub fn run_add_relationship(
    mode: OutputMode,
    db: &Hybridb,
    spec: RelationshipSpec,
    actor: Option<&str>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let relationship = db.registry().add_relationship(spec, actor, reason)?;
    if mode.is_human() {
        ui::success(&format!(
            "Added {} {} -> {} ({}, on delete {})",
            relationship.name,
            relationship.source_entity,
            relationship.target_entity,
            relationship.relationship_type,
            relationship.on_delete
        ));
    }
    emit_success(mode, "rel.add", serde_json::to_value(&relationship)?)
}

pub fn run_remove_relationship(
    mode: OutputMode,
    db: &Hybridb,
    source: &str,
    name: &str,
    actor: Option<&str>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    db.registry().remove_relationship(source, name, actor, reason)?;
    if mode.is_human() {
        ui::success(&format!("Removed relationship {}.{}", source, name));
    }
    emit_success(mode, "rel.remove", json!({ "source_entity": source, "name": name }))
}

pub fn run_list_relationships(mode: OutputMode, db: &Hybridb, entity: Option<&str>) -> anyhow::Result<()> {
    let relationships = db.registry().list_relationships(entity)?;
    if mode.is_human() {
        if relationships.is_empty() {
            println!("{} No relationships defined.", Icons::INFO);
        } else {
            println!("{}", ui::relationships_table(&relationships));
        }
    }
    emit_success(mode, "rel.list", serde_json::to_value(&relationships)?)
}

// ========== Records ==========

pub fn run_insert(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    data: &str,
    actor: Option<&str>,
) -> anyhow::Result<()> {
    let id = db.router().insert(entity, parse_document(data)?, actor)?;
    if mode.is_human() {
        ui::record_created(entity, &id);
    }
    emit_success(mode, "insert", json!({ "entity": entity, "id": id }))
}

pub fn run_get(mode: OutputMode, db: &Hybridb, entity: &str, id: &str) -> anyhow::Result<()> {
    let Some(record) = db.router().get(entity, id)? else {
        return Err(hybridb::Error::RecordNotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
        .into());
    };
    if mode.is_human() {
        println!("{}", serde_json::to_string_pretty(&record.to_json())?);
    }
    emit_success(mode, "get", record.to_json())
}

pub fn run_find(mode: OutputMode, db: &Hybridb, entity: &str, filter: &Filter) -> anyhow::Result<()> {
    let start = Instant::now();
    let records = db.router().find(entity, filter)?;

    if mode.is_human() {
        let def = db.registry().get_entity(entity)?;
        if records.is_empty() {
            println!("{} No records found.", Icons::INFO);
        } else {
            println!("{}", ui::records_table(&def, &records));
        }
        ui::timing(&format!("{} records in {:.1?}", records.len(), start.elapsed()));
    }
    let rows: Vec<Value> = records.iter().map(|r| r.to_json()).collect();
    emit_success(mode, "find", json!({ "entity": entity, "records": rows }))
}

pub fn run_count(mode: OutputMode, db: &Hybridb, entity: &str, filter: &Filter) -> anyhow::Result<()> {
    let count = db.router().count(entity, filter)?;
    if mode.is_human() {
        println!("{}", count);
    }
    emit_success(mode, "count", json!({ "entity": entity, "count": count }))
}

pub fn run_update(mode: OutputMode, db: &Hybridb, entity: &str, id: &str, data: &str) -> anyhow::Result<()> {
    let record = db.router().update(entity, id, parse_document(data)?)?;
    if mode.is_human() {
        ui::record_updated(entity, &record.id);
    }
    emit_success(mode, "update", record.to_json())
}

pub fn run_delete(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    id: &str,
    options: DeleteOptions,
) -> anyhow::Result<()> {
    match db.router().delete(entity, id, options)? {
        DeleteOutcome::Deleted(report) => {
            if mode.is_human() {
                for (name, count) in &report.deleted {
                    ui::record_deleted(name, *count);
                }
                for (name, count) in &report.nullified {
                    ui::summary_row(&format!("{} cleared", name), &count.to_string());
                }
                if report.unlinked > 0 {
                    ui::summary_row("links removed", &report.unlinked.to_string());
                }
            }
            emit_success(mode, "delete", serde_json::to_value(&report)?)
        }
        DeleteOutcome::NotFound => Err(hybridb::Error::RecordNotFound {
            entity: entity.to_string(),
            id: id.to_string(),
        }
        .into()),
        DeleteOutcome::Blocked(violation) => Err(violation.into_error().into()),
    }
}

// ========== Links ==========

pub fn run_link(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    relationship: &str,
    source_id: &str,
    target_ids: &[String],
) -> anyhow::Result<()> {
    let added = db.enforcer().link_many(entity, relationship, source_id, target_ids)?;
    if mode.is_human() {
        ui::success(&format!(
            "{} {} new link(s), {} already present",
            Icons::LINK,
            added,
            target_ids.len().saturating_sub(added)
        ));
    }
    emit_success(mode, "link", json!({ "added": added }))
}

pub fn run_unlink(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    relationship: &str,
    source_id: &str,
    target_ids: &[String],
) -> anyhow::Result<()> {
    let removed = db.enforcer().unlink_many(entity, relationship, source_id, target_ids)?;
    if mode.is_human() {
        ui::success(&format!("Removed {} link(s)", removed));
    }
    emit_success(mode, "unlink", json!({ "removed": removed }))
}

pub fn run_linked(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    relationship: &str,
    source_id: &str,
) -> anyhow::Result<()> {
    let records = db.enforcer().get_linked_records(entity, relationship, source_id)?;
    if mode.is_human() {
        let rel = db.registry().get_relationship(entity, relationship)?;
        let target = db.registry().get_entity(&rel.target_entity)?;
        if records.is_empty() {
            println!("{} No linked records.", Icons::INFO);
        } else {
            println!("{}", ui::records_table(&target, &records));
        }
    }
    let rows: Vec<Value> = records.iter().map(|r| r.to_json()).collect();
    emit_success(mode, "linked", json!({ "records": rows }))
}

// ========== Storage Lifecycle ==========

pub fn run_migrate(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    direction: MigrationDirection,
    batch_size: Option<usize>,
    reason: Option<&str>,
    actor: Option<&str>,
) -> anyhow::Result<()> {
    let engine = db.migrations();
    let batch_size = batch_size.unwrap_or(db.default_batch_size());
    let job = match direction {
        MigrationDirection::ToDedicated => engine.begin_materialize(entity, batch_size, reason, actor)?,
        MigrationDirection::ToShared => engine.begin_dematerialize(entity, batch_size, reason, actor)?,
    };
    drive(mode, &engine, &job)
}

/// Run a job to completion behind a progress bar
fn drive(mode: OutputMode, engine: &MigrationEngine<'_>, job: &MigrationJob) -> anyhow::Result<()> {
    if !mode.is_human() {
        let report = engine.run(job, |_| {})?;
        return emit_success(mode, job.direction.operation(), serde_json::to_value(&report)?);
    }

    ui::phase(&format!("{} {}", job.direction.operation(), job.entity_name));
    let start = Instant::now();
    let (progress, tx) = ProgressManager::new(job.total_count);
    tx.send(ProgressMessage::Started {
        entity: job.entity_name.clone(),
        direction: job.direction,
        total: job.total_count,
    })
    .ok();

    let result = engine.run(job, |p| {
        tx.send(ProgressMessage::Batch(p.clone())).ok();
    });
    match result {
        Ok(report) => {
            tx.send(ProgressMessage::Finished).ok();
            drop(tx);
            progress.finish_with_summary(start.elapsed(), report.records_migrated, report.batches);
            ui::success(&report.to_string());
            Ok(())
        }
        Err(e) => {
            tx.send(ProgressMessage::Error(e.to_string())).ok();
            drop(tx);
            progress.join();
            Err(e.into())
        }
    }
}

pub fn run_migration_status(mode: OutputMode, db: &Hybridb, entity: Option<&str>) -> anyhow::Result<()> {
    let engine = db.migrations();
    let jobs = match entity {
        Some(name) => engine.status(name)?.into_iter().collect(),
        None => engine.list_jobs()?,
    };

    if mode.is_human() {
        if jobs.is_empty() {
            println!("{} No migrations in progress.", Icons::INFO);
        }
        for job in &jobs {
            let progress = job.progress();
            let icon = if job.is_failed() { Icons::CROSS } else { Icons::HOURGLASS };
            println!(
                "{} {} {} {}/{} ({:.0}%) {}",
                icon,
                job.entity_name,
                job.direction,
                progress.processed,
                progress.total,
                progress.percentage(),
                job.status
            );
            if let Some(error) = &job.error {
                ui::warn(error);
            }
            let counts = db.router().row_counts(&job.entity_name)?;
            ui::summary_row(
                "rows",
                &format!(
                    "shared {}, dedicated {}",
                    counts.shared,
                    counts.dedicated.map(|n| n.to_string()).unwrap_or_else(|| "-".into())
                ),
            );
        }
    }
    emit_success(mode, "migration.status", serde_json::to_value(&jobs)?)
}

pub fn run_migration_resume(mode: OutputMode, db: &Hybridb, entity: &str) -> anyhow::Result<()> {
    let engine = db.migrations();
    let job = engine.resume(entity)?;
    drive(mode, &engine, &job)
}

pub fn run_migration_abort(
    mode: OutputMode,
    db: &Hybridb,
    entity: &str,
    actor: Option<&str>,
    reason: Option<&str>,
) -> anyhow::Result<()> {
    let job = db.migrations().abort(entity, actor, reason)?;
    if mode.is_human() {
        ui::success(&format!(
            "Aborted {} of {} after {}/{} records",
            job.direction.operation(),
            job.entity_name,
            job.processed_count,
            job.total_count
        ));
    }
    emit_success(mode, "migration.abort", serde_json::to_value(&job)?)
}

// ========== Intelligence ==========

pub fn run_stats(mode: OutputMode, db: &Hybridb, entity: Option<&str>) -> anyhow::Result<()> {
    match entity {
        Some(name) => {
            let stats = db.entity_stats(name)?;
            if mode.is_human() {
                ui::header(&stats.entity_name);
                let rows = [
                    ("Storage", stats.storage_mode.to_string()),
                    ("Records", stats.record_count.to_string()),
                    ("Queries", stats.total_queries.to_string()),
                    ("Avg time", format!("{:.1} ms", stats.avg_execution_time_ms)),
                    ("Max time", format!("{:.1} ms", stats.max_execution_time_ms)),
                    ("Rows returned", stats.total_rows_returned.to_string()),
                    ("Joins", stats.join_count.to_string()),
                    (
                        "Last window",
                        format!(
                            "{} queries, {} joins ({}h)",
                            stats.window.query_count, stats.window.join_count, stats.window_hours
                        ),
                    ),
                ];
                let pairs: Vec<(&str, &str)> = rows.iter().map(|(k, v)| (*k, v.as_str())).collect();
                println!("{}", ui::stats_table(&pairs));
                if let Some(suggestion) = &stats.suggestion {
                    println!("{} {}", Icons::BRAIN, suggestion);
                }
            }
            emit_success(mode, "stats", serde_json::to_value(&stats)?)
        }
        None => {
            let stats = db.database().stats()?;
            if mode.is_human() {
                println!("{}", stats);
            }
            emit_success(mode, "stats", serde_json::to_value(&stats)?)
        }
    }
}

pub fn run_suggest(mode: OutputMode, db: &Hybridb, entity: Option<&str>) -> anyhow::Result<()> {
    let suggestions = match entity {
        Some(name) => db.evaluate_suggestions(name, None)?,
        None if mode.is_human() => {
            let spinner = ui::Spinner::new("Evaluating access patterns...");
            let all = db.suggest_all()?;
            spinner.finish_with_message(&format!("Evaluated {} entities", db.registry().list_entities()?.len()));
            all
        }
        None => db.suggest_all()?,
    };

    if mode.is_human() {
        if suggestions.is_empty() {
            println!("{} No materialization suggestions.", Icons::BRAIN);
        } else {
            println!("{}", ui::suggestions_table(&suggestions));
        }
    }
    emit_success(mode, "suggest", serde_json::to_value(&suggestions)?)
}

pub fn run_metrics_cleanup(mode: OutputMode, db: &Hybridb, retention_days: Option<u32>) -> anyhow::Result<()> {
    let deleted = db.metrics().cleanup(retention_days)?;
    if mode.is_human() {
        ui::success(&format!("Deleted {} expired metrics", deleted));
    }
    emit_success(mode, "metrics.cleanup", json!({ "deleted": deleted }))
}

pub fn run_changelog(mode: OutputMode, db: &Hybridb, entity: Option<&str>, limit: usize) -> anyhow::Result<()> {
    let entries = db.registry().changelog(entity, limit)?;
    if mode.is_human() {
        for entry in &entries {
            let target = match (&entry.entity_name, &entry.field_name) {
                (Some(e), Some(f)) => format!("{}.{}", e, f),
                (Some(e), None) => e.clone(),
                _ => String::new(),
            };
            println!(
                "{} {} {}{}",
                ui::muted(&entry.timestamp),
                entry.operation.style(ui::theme().header.clone()),
                target,
                entry
                    .created_by
                    .as_ref()
                    .map(|a| ui::dim(&format!(" by {}", a)))
                    .unwrap_or_default()
            );
            if let Some(reason) = &entry.reason {
                ui::summary_row("reason", reason);
            }
        }
    }
    emit_success(mode, "changelog", serde_json::to_value(&entries)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_field_spec() {
        let field = parse_field_spec("email:string:required:unique").unwrap();
        assert_eq!(field.name, "email");
        assert_eq!(field.field_type, FieldType::String);
        assert!(field.required);
        assert!(field.unique);
        assert!(!field.indexed);

        assert!(parse_field_spec("email").is_err());
        assert!(parse_field_spec("email:blob").is_err());
        assert!(parse_field_spec("email:string:primary").is_err());
    }

    #[test]
    fn test_parse_condition() {
        let (field, op, value) = parse_condition("total>=10").unwrap();
        assert_eq!((field.as_str(), op, value), ("total", FilterOp::Gte, json!(10)));

        let (_, op, value) = parse_condition("status = open").unwrap();
        assert_eq!((op, value), (FilterOp::Eq, json!("open")));

        let (_, op, _) = parse_condition("status!=closed").unwrap();
        assert_eq!(op, FilterOp::Ne);

        let (_, op, value) = parse_condition("name~12").unwrap();
        assert_eq!((op, value), (FilterOp::Contains, json!("12")));

        assert!(parse_condition("status").is_err());
        assert!(parse_condition("=open").is_err());
    }
}
