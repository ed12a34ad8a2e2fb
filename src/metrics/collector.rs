//! Persistent query metrics

use chrono::{Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use super::{AccessWindow, EntityStats, MaterializationAdvisor, MaterializationPolicy, QueryMetric};
use crate::schema::{catalog, StorageMode};
use crate::storage::backend::backend_for;
use crate::storage::{Database, Filter};
use crate::{new_id, timestamp_of, Error, Result};

/// Records query metrics into `kdb_query_metrics` and aggregates them
#[derive(Clone)]
pub struct MetricsCollector {
    db: Database,
    policy: MaterializationPolicy,
}

impl MetricsCollector {
    pub fn new(db: Database, policy: MaterializationPolicy) -> Self {
        Self { db, policy }
    }

    pub fn policy(&self) -> &MaterializationPolicy {
        &self.policy
    }

    /// Persist a metric. Returns its id, or `None` when metrics are disabled.
    pub fn record(&self, metric: &QueryMetric) -> Result<Option<String>> {
        if !self.policy.enabled {
            return Ok(None);
        }
        let id = self.db.with_connection(|conn| insert_metric(conn, metric))?;
        Ok(Some(id))
    }

    /// Persist a metric (when enabled) and read back the entity's storage
    /// mode and access window.
    ///
    /// One lock acquisition and a single lookup query; this is the per-query
    /// path, so it avoids loading the entity's fields.
    pub fn record_in_context(&self, metric: &QueryMetric) -> Result<(StorageMode, AccessWindow)> {
        let since = self.window_start();
        let enabled = self.policy.enabled;
        self.db.with_connection(|conn| {
            if enabled {
                insert_metric(conn, metric)?;
            }
            let row = conn
                .query_row(
                    "SELECT d.storage_mode, COUNT(m.id), COALESCE(SUM(m.has_join), 0)
                     FROM kdb_entity_definitions d
                     LEFT JOIN kdb_query_metrics m ON m.entity_name = d.name AND m.timestamp >= ?2
                     WHERE d.name = ?1 AND d.is_active = 1
                     GROUP BY d.id",
                    params![metric.entity_name, since],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?, row.get::<_, i64>(2)?)),
                )
                .optional()?;
            let Some((mode, queries, joins)) = row else {
                return Err(Error::EntityNotFound {
                    entity: metric.entity_name.clone(),
                    available: catalog::entity_names(conn)?,
                });
            };
            Ok((
                mode.parse()?,
                AccessWindow {
                    query_count: queries as usize,
                    join_count: joins as usize,
                },
            ))
        })
    }

    /// Persist a metric, logging and dropping any failure
    pub fn record_best_effort(&self, metric: &QueryMetric) {
        if let Err(e) = self.record(metric) {
            warn!(entity = %metric.entity_name, error = %e, "Failed to record query metric");
        }
    }

    /// Delete metrics older than `retention_days` (policy default when `None`)
    pub fn cleanup(&self, retention_days: Option<u32>) -> Result<usize> {
        let days = retention_days.unwrap_or(self.policy.retention_days);
        let cutoff = timestamp_of(Utc::now() - Duration::days(i64::from(days)));
        let deleted = self.db.with_connection(|conn| {
            Ok(conn.execute("DELETE FROM kdb_query_metrics WHERE timestamp < ?1", [&cutoff])?)
        })?;
        debug!(deleted, days, "Cleaned up query metrics");
        Ok(deleted)
    }

    /// Number of stored metrics, optionally for one entity
    pub fn metrics_count(&self, entity: Option<&str>) -> Result<usize> {
        self.db.with_connection(|conn| {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM kdb_query_metrics WHERE ?1 IS NULL OR entity_name = ?1",
                [entity],
                |row| row.get(0),
            )?;
            Ok(n as usize)
        })
    }

    /// Query and join counts for the entity within the policy window
    pub fn access_window(&self, entity: &str) -> Result<AccessWindow> {
        let since = self.window_start();
        self.db.with_connection(|conn| {
            let (queries, joins): (i64, i64) = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(has_join), 0) FROM kdb_query_metrics
                 WHERE entity_name = ?1 AND timestamp >= ?2",
                params![entity, since],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(AccessWindow {
                query_count: queries as usize,
                join_count: joins as usize,
            })
        })
    }

    /// Aggregate metrics together with the entity's mode and record count
    pub fn entity_stats(&self, entity: &str) -> Result<EntityStats> {
        let since = self.window_start();
        self.db.with_connection(|conn| {
            let def = catalog::load_entity(conn, entity)?;
            let record_count = backend_for(def.storage_mode).count(conn, &def, &Filter::new())?;

            let row = conn.query_row(
                "SELECT COUNT(*), COALESCE(AVG(execution_time_ms), 0), COALESCE(MAX(execution_time_ms), 0),
                        COALESCE(SUM(row_count), 0), COALESCE(SUM(has_join), 0),
                        MIN(timestamp), MAX(timestamp),
                        COALESCE(SUM(timestamp >= ?2), 0),
                        COALESCE(SUM(has_join AND timestamp >= ?2), 0)
                 FROM kdb_query_metrics WHERE entity_name = ?1",
                params![entity, since],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, i64>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, i64>(7)?,
                        row.get::<_, i64>(8)?,
                    ))
                },
            )?;
            let (total, avg, max, rows, joins, first, last, window_queries, window_joins) = row;

            let mut stats = EntityStats {
                entity_name: def.name.clone(),
                storage_mode: def.storage_mode,
                record_count,
                total_queries: total as usize,
                avg_execution_time_ms: avg,
                max_execution_time_ms: max,
                total_rows_returned: rows as usize,
                join_count: joins as usize,
                window_hours: self.policy.window_hours,
                window: AccessWindow {
                    query_count: window_queries as usize,
                    join_count: window_joins as usize,
                },
                first_seen: first,
                last_seen: last,
                suggestion: None,
            };
            stats.suggestion = MaterializationAdvisor::new(self.policy.clone())
                .evaluate_stats(&stats)
                .into_iter()
                .next()
                .map(|s| s.message);
            Ok(stats)
        })
    }

    fn window_start(&self) -> String {
        timestamp_of(Utc::now() - Duration::hours(i64::from(self.policy.window_hours)))
    }
}

fn insert_metric(conn: &Connection, metric: &QueryMetric) -> Result<String> {
    let id = new_id();
    let tables = serde_json::to_string(&metric.tables_accessed)?;
    conn.execute(
        "INSERT INTO kdb_query_metrics
            (id, entity_name, timestamp, query_type, execution_time_ms, row_count, has_join, tables_accessed, created_by)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            id,
            metric.entity_name,
            metric.timestamp,
            metric.query_type,
            metric.execution_time_ms,
            metric.row_count as i64,
            metric.has_join,
            tables,
            metric.created_by,
        ],
    )?;
    debug!(
        entity = %metric.entity_name,
        query_type = %metric.query_type,
        ms = metric.execution_time_ms,
        rows = metric.row_count,
        "Recorded query metric"
    );
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntitySpec, SchemaRegistry};

    fn collector(policy: MaterializationPolicy) -> MetricsCollector {
        let db = Database::open_in_memory().unwrap();
        SchemaRegistry::new(db.clone())
            .define_entity(EntitySpec::new("Customer"), None)
            .unwrap();
        MetricsCollector::new(db, policy)
    }

    #[test]
    fn test_record_and_stats() {
        let metrics = collector(MaterializationPolicy::default());
        metrics
            .record(&QueryMetric::new("Customer", "find", 40.0, 10))
            .unwrap();
        metrics
            .record(&QueryMetric::new("Customer", "get_linked", 80.0, 2).with_join())
            .unwrap();

        let stats = metrics.entity_stats("Customer").unwrap();
        assert_eq!(stats.total_queries, 2);
        assert_eq!(stats.join_count, 1);
        assert_eq!(stats.total_rows_returned, 12);
        assert!((stats.avg_execution_time_ms - 60.0).abs() < 1e-9);
        assert_eq!(stats.max_execution_time_ms, 80.0);
        assert_eq!(stats.window, AccessWindow { query_count: 2, join_count: 1 });
        assert!(stats.suggestion.is_none());
        assert_eq!(metrics.metrics_count(Some("Customer")).unwrap(), 2);
        assert_eq!(metrics.metrics_count(Some("Order")).unwrap(), 0);
    }

    #[test]
    fn test_disabled_policy_stores_nothing() {
        let metrics = collector(MaterializationPolicy {
            enabled: false,
            ..Default::default()
        });
        let id = metrics
            .record(&QueryMetric::new("Customer", "find", 500.0, 1))
            .unwrap();
        assert!(id.is_none());
        assert_eq!(metrics.metrics_count(None).unwrap(), 0);
    }

    #[test]
    fn test_cleanup_respects_retention() {
        let metrics = collector(MaterializationPolicy::default());
        let mut old = QueryMetric::new("Customer", "find", 1.0, 1);
        old.timestamp = timestamp_of(Utc::now() - Duration::days(30));
        metrics.record(&old).unwrap();
        metrics.record(&QueryMetric::new("Customer", "find", 1.0, 1)).unwrap();

        assert_eq!(metrics.cleanup(None).unwrap(), 1);
        assert_eq!(metrics.metrics_count(None).unwrap(), 1);
        // old metrics also fall outside the window
        assert_eq!(metrics.access_window("Customer").unwrap().query_count, 1);
    }

    #[test]
    fn test_record_in_context_reads_mode_and_window() {
        let metrics = collector(MaterializationPolicy::default());
        metrics
            .record(&QueryMetric::new("Customer", "get_linked", 5.0, 1).with_join())
            .unwrap();
        let (mode, window) = metrics
            .record_in_context(&QueryMetric::new("Customer", "find", 5.0, 1))
            .unwrap();
        assert_eq!(mode, StorageMode::Shared);
        assert_eq!(window, AccessWindow { query_count: 2, join_count: 1 });
        assert_eq!(window, metrics.access_window("Customer").unwrap());

        // the metric is stored before the entity lookup fails
        let err = metrics
            .record_in_context(&QueryMetric::new("Ghost", "find", 5.0, 1))
            .unwrap_err();
        assert!(matches!(err, Error::EntityNotFound { .. }));
        assert_eq!(metrics.metrics_count(Some("Ghost")).unwrap(), 1);
    }

    #[test]
    fn test_record_in_context_respects_disabled_policy() {
        let metrics = collector(MaterializationPolicy {
            enabled: false,
            ..Default::default()
        });
        let (_, window) = metrics
            .record_in_context(&QueryMetric::new("Customer", "find", 500.0, 1))
            .unwrap();
        assert_eq!(window.query_count, 0);
        assert_eq!(metrics.metrics_count(None).unwrap(), 0);
    }

    #[test]
    fn test_stats_for_unknown_entity() {
        let metrics = collector(MaterializationPolicy::default());
        assert!(metrics.entity_stats("Ghost").is_err());
    }
}
