//! Top-level handle wiring the registry, router, enforcer, migrations and metrics

use tracing::warn;

use crate::config::HybridbConfig;
use crate::metrics::advisor::merge_suggestions;
use crate::metrics::{
    EntityStats, MaterializationAdvisor, MaterializationSuggestion, MetricsCollector, QueryMetric,
};
use crate::migration::{MigrationEngine, MigrationProgress, MigrationReport};
use crate::relationship::RelationshipEnforcer;
use crate::schema::SchemaRegistry;
use crate::storage::{Database, StorageRouter};
use crate::Result;

/// One database with every component bound to it
#[derive(Clone)]
pub struct Hybridb {
    registry: SchemaRegistry,
    metrics: MetricsCollector,
    advisor: MaterializationAdvisor,
    default_batch_size: usize,
}

impl Hybridb {
    /// Open the database named by the configuration
    pub fn open(config: &HybridbConfig) -> Result<Self> {
        let db = Database::open_with(&config.database_path(), &config.sqlite)?;
        Ok(Self::with_database(db, config))
    }

    /// Fresh in-memory database with default configuration
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::with_database(Database::open_in_memory()?, &HybridbConfig::default()))
    }

    pub fn with_database(db: Database, config: &HybridbConfig) -> Self {
        Self {
            registry: SchemaRegistry::with_options(db.clone(), config.schema.clone()),
            metrics: MetricsCollector::new(db, config.policy.clone()),
            advisor: MaterializationAdvisor::new(config.policy.clone()),
            default_batch_size: config.migration.default_batch_size.max(1),
        }
    }

    pub fn database(&self) -> &Database {
        self.registry.database()
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Record CRUD, with read metrics recorded
    pub fn router(&self) -> StorageRouter<'_> {
        StorageRouter::new(&self.registry).with_metrics(&self.metrics)
    }

    /// Deletes and links, with join metrics recorded
    pub fn enforcer(&self) -> RelationshipEnforcer<'_> {
        RelationshipEnforcer::new(&self.registry).with_metrics(&self.metrics)
    }

    pub fn migrations(&self) -> MigrationEngine<'_> {
        MigrationEngine::new(&self.registry)
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    pub fn advisor(&self) -> &MaterializationAdvisor {
        &self.advisor
    }

    pub fn default_batch_size(&self) -> usize {
        self.default_batch_size
    }

    // ========== Storage Lifecycle ==========

    pub fn materialize_entity<F>(
        &self,
        entity: &str,
        batch_size: Option<usize>,
        reason: Option<&str>,
        actor: Option<&str>,
        on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&MigrationProgress),
    {
        let batch_size = batch_size.unwrap_or(self.default_batch_size);
        self.migrations()
            .materialize(entity, batch_size, reason, actor, on_progress)
    }

    pub fn dematerialize_entity<F>(
        &self,
        entity: &str,
        batch_size: Option<usize>,
        reason: Option<&str>,
        actor: Option<&str>,
        on_progress: F,
    ) -> Result<MigrationReport>
    where
        F: FnMut(&MigrationProgress),
    {
        let batch_size = batch_size.unwrap_or(self.default_batch_size);
        self.migrations()
            .dematerialize(entity, batch_size, reason, actor, on_progress)
    }

    // ========== Intelligence ==========

    /// Store a metric reported by a query executor and evaluate it.
    ///
    /// Costs one insert and one lookup of the entity's mode and access
    /// window; evaluation itself is pure. Never fails: storage or lookup
    /// errors are logged and yield no suggestions.
    pub fn record_query_metric(&self, metric: &QueryMetric) -> Vec<MaterializationSuggestion> {
        match self.metrics.record_in_context(metric) {
            Ok((mode, window)) => self.advisor.evaluate(&metric.entity_name, mode, metric, window),
            Err(e) => {
                warn!(entity = %metric.entity_name, error = %e, "Skipping materialization advice");
                Vec::new()
            }
        }
    }

    pub fn entity_stats(&self, entity: &str) -> Result<EntityStats> {
        self.metrics.entity_stats(entity)
    }

    /// Historical suggestions for an entity, merged with those triggered by
    /// `metric` when one is given
    pub fn evaluate_suggestions(
        &self,
        entity: &str,
        metric: Option<&QueryMetric>,
    ) -> Result<Vec<MaterializationSuggestion>> {
        let stats = self.metrics.entity_stats(entity)?;
        let historical = self.advisor.evaluate_stats(&stats);
        let live = match metric {
            Some(metric) => self
                .advisor
                .evaluate(&stats.entity_name, stats.storage_mode, metric, stats.window),
            None => Vec::new(),
        };
        Ok(merge_suggestions(live, historical))
    }

    /// Suggestions for every shared entity, highest priority first
    pub fn suggest_all(&self) -> Result<Vec<MaterializationSuggestion>> {
        let mut all = Vec::new();
        for name in self.registry.list_entities()? {
            all.extend(self.evaluate_suggestions(&name, None)?);
        }
        all.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Priority, SuggestionReason};
    use crate::schema::{EntitySpec, FieldSpec, FieldType, StorageMode};
    use crate::storage::{Document, Filter};
    use serde_json::Value;

    fn db_with_customer() -> Hybridb {
        let db = Hybridb::open_in_memory().unwrap();
        db.registry()
            .define_entity(
                EntitySpec::new("Customer").field(FieldSpec::new("name", FieldType::String)),
                None,
            )
            .unwrap();
        db
    }

    #[test]
    fn test_reads_record_metrics() {
        let db = db_with_customer();
        let mut doc = Document::new();
        doc.insert("name".into(), Value::from("Ada"));
        db.router().insert("Customer", doc, None).unwrap();

        db.router().find("Customer", &Filter::new()).unwrap();
        db.router().count("Customer", &Filter::new()).unwrap();

        let stats = db.entity_stats("Customer").unwrap();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.record_count, 1);
    }

    #[test]
    fn test_record_query_metric_suggests() {
        let db = db_with_customer();
        let suggestions = db.record_query_metric(&QueryMetric::new("Customer", "find", 450.0, 3));

        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].priority, Priority::High);
        assert_eq!(suggestions[0].reason, SuggestionReason::SlowQuery);
        assert_eq!(db.metrics().metrics_count(Some("Customer")).unwrap(), 1);
    }

    #[test]
    fn test_recorded_metric_counts_toward_its_own_window() {
        let db = db_with_customer();
        let join = QueryMetric::new("Customer", "get_linked", 5.0, 1).with_join();
        for _ in 0..10 {
            assert!(db.record_query_metric(&join).is_empty());
        }
        let suggestions = db.record_query_metric(&join);
        assert_eq!(suggestions.len(), 1);
        assert_eq!(suggestions[0].reason, SuggestionReason::FrequentJoins);
        assert_eq!(suggestions[0].evidence["join_count"], 11);
    }

    #[test]
    fn test_unknown_entity_metric_is_harmless() {
        let db = db_with_customer();
        assert!(db
            .record_query_metric(&QueryMetric::new("Ghost", "find", 900.0, 1))
            .is_empty());
    }

    #[test]
    fn test_no_suggestions_once_dedicated() {
        let db = db_with_customer();
        let metric = QueryMetric::new("Customer", "find", 450.0, 3);
        db.record_query_metric(&metric);
        assert!(!db.evaluate_suggestions("Customer", Some(&metric)).unwrap().is_empty());

        db.materialize_entity("Customer", None, None, None, |_| {}).unwrap();
        assert_eq!(
            db.registry().get_entity("Customer").unwrap().storage_mode,
            StorageMode::Dedicated
        );
        assert!(db.evaluate_suggestions("Customer", Some(&metric)).unwrap().is_empty());
        assert!(db.suggest_all().unwrap().is_empty());
    }
}
