//! Referential actions on delete and many-to-many link maintenance
//!
//! A delete runs in two phases inside one transaction:
//! 1. Plan (read-only): walk dependents breadth-first with a work-list and a
//!    visited set of `(entity, id)`, collecting rows to delete, foreign keys
//!    to clear and RESTRICT violations.
//! 2. Execute: clear foreign keys, remove junction rows, then delete rows in
//!    reverse discovery order so dependents go before the rows they reference.
//!
//! A blocking dependent found during planning returns before any mutation.
//! Because every backend shares one SQLite connection, a cascade crossing
//! shared and dedicated entities commits or rolls back as a unit.
//!
//! The plan never leaves a row referencing a deleted row: every dependent is
//! deleted, cleared or reported as blocking. Native foreign keys on dedicated
//! tables therefore never fire, and a delete behaves the same in both modes.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Instant;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::junction;
use crate::metrics::{MetricsCollector, QueryMetric};
use crate::schema::catalog::{self, Dependent, JunctionSide};
use crate::schema::{EntityDefinition, JunctionTable, OnDeleteAction, RelationshipType, SchemaRegistry};
use crate::storage::backend::backend_for;
use crate::storage::filter::{Filter, FilterOp};
use crate::storage::Record;
use crate::{now_timestamp, Error, Result};

/// Delete behavior switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteOptions {
    /// Apply each relationship's on_delete action. When false no action is
    /// applied: the row (and its junction rows) is removed only if nothing
    /// references it, and any dependent blocks the delete.
    pub cascade: bool,
    /// Detach blocking dependents by clearing their foreign key instead of
    /// refusing the delete. Never deletes additional rows.
    pub force: bool,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self {
            cascade: true,
            force: false,
        }
    }
}

impl DeleteOptions {
    pub fn forced() -> Self {
        Self {
            cascade: true,
            force: true,
        }
    }

    pub fn without_cascade() -> Self {
        Self {
            cascade: false,
            force: false,
        }
    }
}

/// What a successful delete changed
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeleteReport {
    pub entity: String,
    pub id: String,
    /// Rows deleted per entity, the requested row included
    pub deleted: BTreeMap<String, usize>,
    /// Rows whose foreign key was cleared, per entity
    pub nullified: BTreeMap<String, usize>,
    /// Junction rows removed
    pub unlinked: usize,
}

impl DeleteReport {
    pub fn total_deleted(&self) -> usize {
        self.deleted.values().sum()
    }
}

/// Dependents that blocked a delete.
///
/// `action` is the relationship's on_delete action: RESTRICT and NO_ACTION
/// always block, CASCADE and SET_NULL block only when cascade is disabled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestrictViolation {
    pub entity: String,
    pub id: String,
    pub related_entity: String,
    pub relationship: String,
    pub action: OnDeleteAction,
    pub count: usize,
}

impl RestrictViolation {
    pub fn into_error(self) -> Error {
        match self.action {
            OnDeleteAction::Restrict | OnDeleteAction::NoAction => Error::RestrictDelete {
                entity: self.entity,
                id: self.id,
                related_entity: self.related_entity,
                relationship: self.relationship,
                action: self.action,
                count: self.count,
            },
            OnDeleteAction::Cascade | OnDeleteAction::SetNull => Error::DependentsExist {
                entity: self.entity,
                id: self.id,
                related_entity: self.related_entity,
                relationship: self.relationship,
                action: self.action,
                count: self.count,
            },
        }
    }
}

/// Result of a delete request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DeleteOutcome {
    Deleted(DeleteReport),
    NotFound,
    /// Nothing was changed
    Blocked(RestrictViolation),
}

impl DeleteOutcome {
    pub fn is_deleted(&self) -> bool {
        matches!(self, DeleteOutcome::Deleted(_))
    }

    /// `true` if deleted, `false` if the record did not exist, and a
    /// `RestrictDelete` or `DependentsExist` error if blocked
    pub fn into_result(self) -> Result<bool> {
        match self {
            DeleteOutcome::Deleted(_) => Ok(true),
            DeleteOutcome::NotFound => Ok(false),
            DeleteOutcome::Blocked(violation) => Err(violation.into_error()),
        }
    }
}

struct ClearForeignKey {
    entity: String,
    field: String,
    ids: Vec<String>,
}

/// Dependents the plan neither deletes nor clears
struct Blocking {
    parent: String,
    parent_id: String,
    relationship: String,
    action: OnDeleteAction,
    child: String,
    field: String,
    ids: Vec<String>,
}

struct DeletePlan {
    /// Rows in discovery order; the requested row is first
    order: Vec<(String, String)>,
    clear: Vec<ClearForeignKey>,
    violation: Option<RestrictViolation>,
}

/// Memoizes entity definitions and relationship lookups during one plan
struct PlanCache<'c> {
    conn: &'c Connection,
    entities: HashMap<String, EntityDefinition>,
    dependents: HashMap<String, Vec<Dependent>>,
    junctions: HashMap<String, Vec<JunctionSide>>,
}

impl<'c> PlanCache<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            entities: HashMap::new(),
            dependents: HashMap::new(),
            junctions: HashMap::new(),
        }
    }

    fn entity(&mut self, name: &str) -> Result<&EntityDefinition> {
        if !self.entities.contains_key(name) {
            let def = catalog::load_entity(self.conn, name)?;
            self.entities.insert(name.to_string(), def);
        }
        self.entities
            .get(name)
            .ok_or_else(|| Error::validation(name, "entity definition vanished during delete"))
    }

    fn dependents(&mut self, name: &str) -> Result<Vec<Dependent>> {
        if let Some(deps) = self.dependents.get(name) {
            return Ok(deps.clone());
        }
        let deps = catalog::dependents_of(self.conn, name)?;
        self.dependents.insert(name.to_string(), deps.clone());
        Ok(deps)
    }

    fn junctions(&mut self, name: &str) -> Result<Vec<JunctionSide>> {
        if let Some(sides) = self.junctions.get(name) {
            return Ok(sides.clone());
        }
        let sides = catalog::junctions_touching(self.conn, name)?;
        self.junctions.insert(name.to_string(), sides.clone());
        Ok(sides)
    }
}

/// Applies relationship semantics to deletes and maintains junction tables
pub struct RelationshipEnforcer<'a> {
    registry: &'a SchemaRegistry,
    metrics: Option<&'a MetricsCollector>,
}

impl<'a> RelationshipEnforcer<'a> {
    pub fn new(registry: &'a SchemaRegistry) -> Self {
        Self {
            registry,
            metrics: None,
        }
    }

    /// Record link reads as join queries
    pub fn with_metrics(mut self, metrics: &'a MetricsCollector) -> Self {
        self.metrics = Some(metrics);
        self
    }

    // ========== Delete ==========

    /// Delete a record and apply on_delete actions to its dependents
    pub fn delete(&self, entity: &str, id: &str, options: DeleteOptions) -> Result<DeleteOutcome> {
        let outcome = self.registry.database().with_transaction(|tx| {
            let mut cache = PlanCache::new(tx);
            let root = cache.entity(entity)?.clone();
            if backend_for(root.storage_mode).get(tx, &root, id)?.is_none() {
                return Ok(DeleteOutcome::NotFound);
            }

            let plan = plan_delete(&mut cache, &root.name, id, options)?;
            if let Some(violation) = plan.violation {
                return Ok(DeleteOutcome::Blocked(violation));
            }
            let report = execute_delete(&mut cache, &root.name, id, plan)?;
            Ok(DeleteOutcome::Deleted(report))
        })?;

        match &outcome {
            DeleteOutcome::Deleted(report) => info!(
                %entity,
                %id,
                deleted = report.total_deleted(),
                unlinked = report.unlinked,
                "Deleted record"
            ),
            DeleteOutcome::Blocked(v) => info!(
                %entity,
                %id,
                related = %v.related_entity,
                action = %v.action,
                count = v.count,
                "Delete blocked by dependents"
            ),
            DeleteOutcome::NotFound => debug!(%entity, %id, "Delete target not found"),
        }
        Ok(outcome)
    }

    // ========== Links ==========

    /// Link `source_id` to `target_id`. Returns false if the pair already existed.
    pub fn link(&self, entity: &str, relationship: &str, source_id: &str, target_id: &str) -> Result<bool> {
        let added = self.link_many(entity, relationship, source_id, &[target_id.to_string()])?;
        Ok(added > 0)
    }

    /// Remove one link. Returns false if the pair did not exist.
    pub fn unlink(&self, entity: &str, relationship: &str, source_id: &str, target_id: &str) -> Result<bool> {
        let removed = self.unlink_many(entity, relationship, source_id, &[target_id.to_string()])?;
        Ok(removed > 0)
    }

    /// Link one source to many targets in one transaction.
    ///
    /// Every target must exist; otherwise nothing is linked. Returns the
    /// number of new pairs.
    pub fn link_many(
        &self,
        entity: &str,
        relationship: &str,
        source_id: &str,
        target_ids: &[String],
    ) -> Result<usize> {
        let targets = dedup(target_ids);
        let added = self.registry.database().with_transaction(|tx| {
            let (rel_target, junction) = resolve_many_to_many(tx, entity, relationship)?;
            let source = catalog::load_entity(tx, entity)?;
            if backend_for(source.storage_mode).get(tx, &source, source_id)?.is_none() {
                return Err(Error::RecordNotFound {
                    entity: entity.to_string(),
                    id: source_id.to_string(),
                });
            }
            let target = catalog::load_entity(tx, &rel_target)?;
            let found = backend_for(target.storage_mode).existing_ids(tx, &target, &targets)?;
            if let Some(missing) = targets.iter().find(|id| !found.contains(*id)) {
                return Err(Error::LinkTargetNotFound {
                    relationship: relationship.to_string(),
                    target_entity: target.name.clone(),
                    id: missing.clone(),
                });
            }
            junction::insert_pairs(tx, &junction, source_id, &targets)
        })?;
        debug!(%entity, %relationship, %source_id, added, "Linked records");
        Ok(added)
    }

    /// Remove links from one source to many targets. Returns the number removed.
    pub fn unlink_many(
        &self,
        entity: &str,
        relationship: &str,
        source_id: &str,
        target_ids: &[String],
    ) -> Result<usize> {
        let targets = dedup(target_ids);
        let removed = self.registry.database().with_transaction(|tx| {
            let (_, junction) = resolve_many_to_many(tx, entity, relationship)?;
            junction::delete_pairs(tx, &junction, source_id, &targets)
        })?;
        debug!(%entity, %relationship, %source_id, removed, "Unlinked records");
        Ok(removed)
    }

    /// Ids of targets linked to `source_id`
    pub fn get_linked(&self, entity: &str, relationship: &str, source_id: &str) -> Result<Vec<String>> {
        let start = Instant::now();
        let (ids, tables) = self.registry.database().with_connection(|conn| {
            let (rel_target, junction) = resolve_many_to_many(conn, entity, relationship)?;
            let ids = junction::linked_ids(conn, &junction, source_id)?;
            let target = catalog::load_entity(conn, &rel_target)?;
            let target_table = backend_for(target.storage_mode).table_name(&target)?;
            Ok((ids, vec![junction.table_name, target_table]))
        })?;
        self.record_join(entity, "get_linked", start, ids.len(), tables);
        Ok(ids)
    }

    /// Records of targets linked to `source_id`
    pub fn get_linked_records(&self, entity: &str, relationship: &str, source_id: &str) -> Result<Vec<Record>> {
        let start = Instant::now();
        let (records, tables) = self.registry.database().with_connection(|conn| {
            let (rel_target, junction) = resolve_many_to_many(conn, entity, relationship)?;
            let ids = junction::linked_ids(conn, &junction, source_id)?;
            let target = catalog::load_entity(conn, &rel_target)?;
            let backend = backend_for(target.storage_mode);
            let filter = Filter::new().where_op("id", FilterOp::In, Value::from(ids));
            let records = backend.find(conn, &target, &filter)?;
            Ok((records, vec![junction.table_name, backend.table_name(&target)?]))
        })?;
        self.record_join(entity, "get_linked_records", start, records.len(), tables);
        Ok(records)
    }

    fn record_join(&self, entity: &str, query_type: &str, start: Instant, rows: usize, tables: Vec<String>) {
        if let Some(metrics) = self.metrics {
            let elapsed = start.elapsed().as_secs_f64() * 1000.0;
            let metric = QueryMetric::new(entity, query_type, elapsed, rows)
                .with_join()
                .with_tables(tables);
            metrics.record_best_effort(&metric);
        }
    }
}

fn dedup(ids: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.iter().filter(|id| seen.insert(id.as_str())).cloned().collect()
}

/// Target entity and junction table of a many-to-many relationship
fn resolve_many_to_many(conn: &Connection, entity: &str, relationship: &str) -> Result<(String, JunctionTable)> {
    catalog::load_entity(conn, entity)?;
    let rel = catalog::load_relationship(conn, entity, relationship)?;
    match (rel.relationship_type, rel.junction) {
        (RelationshipType::ManyToMany, Some(junction)) => Ok((rel.target_entity, junction)),
        (ty, _) => Err(Error::validation(
            entity,
            format!(
                "relationship '{}' is {}; links apply only to many_to_many relationships, set the '{}' field instead",
                relationship,
                ty,
                rel.foreign_key_field.unwrap_or_default()
            ),
        )),
    }
}

fn plan_delete(cache: &mut PlanCache<'_>, entity: &str, id: &str, options: DeleteOptions) -> Result<DeletePlan> {
    let mut queue = VecDeque::from([(entity.to_string(), id.to_string())]);
    let mut visited: HashSet<(String, String)> = HashSet::from([(entity.to_string(), id.to_string())]);
    let mut order = Vec::new();
    let mut clear = Vec::new();
    let mut blocking: Vec<Blocking> = Vec::new();

    while let Some((current, current_id)) = queue.pop_front() {
        order.push((current.clone(), current_id.clone()));

        for dep in cache.dependents(&current)? {
            let child = cache.entity(&dep.child_entity)?.clone();
            let ids = backend_for(child.storage_mode).ids_referencing(
                cache.conn,
                &child,
                &dep.foreign_key_field,
                &current_id,
            )?;
            if ids.is_empty() {
                continue;
            }
            match dep.on_delete {
                OnDeleteAction::Cascade if options.cascade => {
                    for child_id in ids {
                        if visited.insert((child.name.clone(), child_id.clone())) {
                            queue.push_back((child.name.clone(), child_id));
                        }
                    }
                }
                OnDeleteAction::SetNull if options.cascade => clear.push(ClearForeignKey {
                    entity: child.name.clone(),
                    field: dep.foreign_key_field.clone(),
                    ids,
                }),
                action => blocking.push(Blocking {
                    parent: current.clone(),
                    parent_id: current_id.clone(),
                    relationship: dep.relationship.clone(),
                    action,
                    child: child.name.clone(),
                    field: dep.foreign_key_field.clone(),
                    ids,
                }),
            }
        }
    }

    // Dependents that are themselves being deleted neither block nor need clearing
    let mut violation = None;
    for block in blocking {
        let remaining: Vec<String> = block
            .ids
            .into_iter()
            .filter(|cid| !visited.contains(&(block.child.clone(), cid.clone())))
            .collect();
        if remaining.is_empty() {
            continue;
        }
        let required = cache
            .entity(&block.child)?
            .field(&block.field)
            .is_some_and(|f| f.required);
        let detachable = options.force && !required;
        if detachable {
            clear.push(ClearForeignKey {
                entity: block.child,
                field: block.field,
                ids: remaining,
            });
        } else if violation.is_none() {
            violation = Some(RestrictViolation {
                entity: block.parent,
                id: block.parent_id,
                related_entity: block.child,
                relationship: block.relationship,
                action: block.action,
                count: remaining.len(),
            });
        }
    }
    for action in &mut clear {
        let entity = action.entity.clone();
        action
            .ids
            .retain(|cid| !visited.contains(&(entity.clone(), cid.clone())));
    }
    clear.retain(|action| !action.ids.is_empty());

    Ok(DeletePlan {
        order,
        clear,
        violation,
    })
}

fn execute_delete(cache: &mut PlanCache<'_>, entity: &str, id: &str, plan: DeletePlan) -> Result<DeleteReport> {
    let conn = cache.conn;
    let now = now_timestamp();
    let mut report = DeleteReport {
        entity: entity.to_string(),
        id: id.to_string(),
        ..Default::default()
    };

    for action in &plan.clear {
        let def = cache.entity(&action.entity)?.clone();
        let n = backend_for(def.storage_mode).clear_field(conn, &def, &action.field, &action.ids, &now)?;
        *report.nullified.entry(action.entity.clone()).or_default() += n;
    }

    // Junction rows on either side of every deleted row
    let mut by_side: BTreeMap<(String, String), Vec<String>> = BTreeMap::new();
    for (row_entity, row_id) in &plan.order {
        for side in cache.junctions(row_entity)? {
            by_side
                .entry((side.table_name, side.column))
                .or_default()
                .push(row_id.clone());
        }
    }
    for ((table, column), ids) in &by_side {
        report.unlinked += junction::delete_by_column(conn, table, column, ids)?;
    }

    for (row_entity, row_id) in plan.order.iter().rev() {
        let def = cache.entity(row_entity)?.clone();
        let n = backend_for(def.storage_mode).delete(conn, &def, std::slice::from_ref(row_id))?;
        if n > 0 {
            *report.deleted.entry(row_entity.clone()).or_default() += n;
        }
    }

    Ok(report)
}
