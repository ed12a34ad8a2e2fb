//! Materialization advice from query metrics

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::{AccessWindow, EntityStats, MaterializationPolicy, QueryMetric};
use crate::schema::StorageMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Which threshold a suggestion was triggered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionReason {
    SlowQuery,
    LargeResultSet,
    FrequentJoins,
    HighAccessFrequency,
}

impl SuggestionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionReason::SlowQuery => "slow_query",
            SuggestionReason::LargeResultSet => "large_result_set",
            SuggestionReason::FrequentJoins => "frequent_joins",
            SuggestionReason::HighAccessFrequency => "high_access_frequency",
        }
    }
}

impl std::fmt::Display for SuggestionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The operation a suggestion recommends
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuggestedAction {
    pub operation: String,
    pub target: String,
}

impl SuggestedAction {
    fn materialize(entity: &str) -> Self {
        Self {
            operation: "materialize_entity".to_string(),
            target: entity.to_string(),
        }
    }
}

impl std::fmt::Display for SuggestedAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}('{}')", self.operation, self.target)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializationSuggestion {
    pub entity_name: String,
    pub reason: SuggestionReason,
    pub message: String,
    pub priority: Priority,
    pub evidence: Map<String, Value>,
    pub action: SuggestedAction,
}

impl MaterializationSuggestion {
    fn new(entity: &str, reason: SuggestionReason, priority: Priority, message: String, evidence: Value) -> Self {
        let evidence = match evidence {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            entity_name: entity.to_string(),
            reason,
            message,
            priority,
            evidence,
            action: SuggestedAction::materialize(entity),
        }
    }
}

/// Evaluates metrics against a [`MaterializationPolicy`]
#[derive(Debug, Clone, Default)]
pub struct MaterializationAdvisor {
    policy: MaterializationPolicy,
}

impl MaterializationAdvisor {
    pub fn new(policy: MaterializationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &MaterializationPolicy {
        &self.policy
    }

    /// Evaluate one metric plus the entity's current access window.
    ///
    /// Dedicated entities and a disabled policy yield nothing. At most one
    /// suggestion per reason, highest priority first.
    pub fn evaluate(
        &self,
        entity: &str,
        storage_mode: StorageMode,
        metric: &QueryMetric,
        window: AccessWindow,
    ) -> Vec<MaterializationSuggestion> {
        if !self.applies(storage_mode) {
            return Vec::new();
        }
        let policy = &self.policy;
        let mut suggestions = Vec::new();

        if metric.execution_time_ms > policy.execution_time_threshold_ms {
            suggestions.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::SlowQuery,
                Priority::High,
                format!(
                    "{} query took {:.1} ms (threshold {:.1} ms)",
                    metric.query_type, metric.execution_time_ms, policy.execution_time_threshold_ms
                ),
                json!({
                    "execution_time_ms": metric.execution_time_ms,
                    "threshold_ms": policy.execution_time_threshold_ms,
                    "query_type": metric.query_type,
                }),
            ));
        }

        if metric.row_count > policy.row_count_threshold {
            suggestions.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::LargeResultSet,
                Priority::Medium,
                format!(
                    "{} query returned {} rows (threshold {})",
                    metric.query_type, metric.row_count, policy.row_count_threshold
                ),
                json!({
                    "row_count": metric.row_count,
                    "threshold": policy.row_count_threshold,
                    "query_type": metric.query_type,
                }),
            ));
        }

        self.window_suggestions(entity, window, &mut suggestions);
        finish(suggestions)
    }

    /// Evaluate historical aggregates without a triggering metric
    pub fn evaluate_stats(&self, stats: &EntityStats) -> Vec<MaterializationSuggestion> {
        if !self.applies(stats.storage_mode) || stats.total_queries == 0 {
            return Vec::new();
        }
        let policy = &self.policy;
        let entity = stats.entity_name.as_str();
        let mut suggestions = Vec::new();

        self.window_suggestions(entity, stats.window, &mut suggestions);

        if stats.avg_execution_time_ms > policy.execution_time_threshold_ms {
            suggestions.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::SlowQuery,
                Priority::Medium,
                format!(
                    "Average query time {:.1} ms over {} queries (threshold {:.1} ms)",
                    stats.avg_execution_time_ms, stats.total_queries, policy.execution_time_threshold_ms
                ),
                json!({
                    "avg_execution_time_ms": stats.avg_execution_time_ms,
                    "max_execution_time_ms": stats.max_execution_time_ms,
                    "total_queries": stats.total_queries,
                    "threshold_ms": policy.execution_time_threshold_ms,
                }),
            ));
        }

        if stats.record_count > policy.row_count_threshold {
            suggestions.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::LargeResultSet,
                Priority::Low,
                format!(
                    "{} records in shared storage (threshold {})",
                    stats.record_count, policy.row_count_threshold
                ),
                json!({
                    "record_count": stats.record_count,
                    "threshold": policy.row_count_threshold,
                }),
            ));
        }

        finish(suggestions)
    }

    fn applies(&self, storage_mode: StorageMode) -> bool {
        self.policy.enabled && storage_mode == StorageMode::Shared
    }

    fn window_suggestions(&self, entity: &str, window: AccessWindow, out: &mut Vec<MaterializationSuggestion>) {
        let policy = &self.policy;

        if window.join_count > policy.join_frequency_threshold {
            out.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::FrequentJoins,
                Priority::High,
                format!(
                    "{} join queries in the last {}h (threshold {})",
                    window.join_count, policy.window_hours, policy.join_frequency_threshold
                ),
                json!({
                    "join_count": window.join_count,
                    "window_hours": policy.window_hours,
                    "threshold": policy.join_frequency_threshold,
                }),
            ));
        }

        if window.query_count > policy.access_frequency_threshold {
            out.push(MaterializationSuggestion::new(
                entity,
                SuggestionReason::HighAccessFrequency,
                Priority::Medium,
                format!(
                    "{} queries in the last {}h (threshold {})",
                    window.query_count, policy.window_hours, policy.access_frequency_threshold
                ),
                json!({
                    "query_count": window.query_count,
                    "window_hours": policy.window_hours,
                    "threshold": policy.access_frequency_threshold,
                }),
            ));
        }
    }
}

/// Keep the first suggestion per reason, then order by priority
fn finish(suggestions: Vec<MaterializationSuggestion>) -> Vec<MaterializationSuggestion> {
    let mut out: Vec<MaterializationSuggestion> = Vec::with_capacity(suggestions.len());
    for s in suggestions {
        if !out.iter().any(|o| o.reason == s.reason) {
            out.push(s);
        }
    }
    out.sort_by(|a, b| b.priority.cmp(&a.priority));
    out
}

/// Merge suggestion lists, first occurrence of each reason wins
pub fn merge_suggestions(
    first: Vec<MaterializationSuggestion>,
    second: Vec<MaterializationSuggestion>,
) -> Vec<MaterializationSuggestion> {
    finish(first.into_iter().chain(second).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advisor() -> MaterializationAdvisor {
        MaterializationAdvisor::new(MaterializationPolicy::default())
    }

    fn stats(total_queries: usize, avg: f64, window: AccessWindow) -> EntityStats {
        EntityStats {
            entity_name: "Customer".into(),
            storage_mode: StorageMode::Shared,
            record_count: 10,
            total_queries,
            avg_execution_time_ms: avg,
            max_execution_time_ms: avg,
            total_rows_returned: 0,
            join_count: window.join_count,
            window_hours: 24,
            window,
            first_seen: None,
            last_seen: None,
            suggestion: None,
        }
    }

    #[test]
    fn test_slow_query_is_high_priority() {
        let metric = QueryMetric::new("Customer", "find", 450.0, 5);
        let suggestions = advisor().evaluate("Customer", StorageMode::Shared, &metric, AccessWindow::default());

        assert_eq!(suggestions.len(), 1);
        let s = &suggestions[0];
        assert_eq!(s.reason, SuggestionReason::SlowQuery);
        assert_eq!(s.priority, Priority::High);
        assert_eq!(s.evidence["execution_time_ms"], json!(450.0));
        assert_eq!(s.action.to_string(), "materialize_entity('Customer')");
    }

    #[test]
    fn test_under_thresholds_is_quiet() {
        let metric = QueryMetric::new("Customer", "find", 100.0, 1000);
        let window = AccessWindow { query_count: 500, join_count: 10 };
        assert!(advisor().evaluate("Customer", StorageMode::Shared, &metric, window).is_empty());
    }

    #[test]
    fn test_all_triggers_sorted_by_priority() {
        let metric = QueryMetric::new("Customer", "find", 1.0, 5000);
        let window = AccessWindow { query_count: 900, join_count: 11 };
        let suggestions = advisor().evaluate("Customer", StorageMode::Shared, &metric, window);

        let reasons: Vec<_> = suggestions.iter().map(|s| s.reason).collect();
        assert_eq!(reasons.len(), 3);
        assert_eq!(reasons[0], SuggestionReason::FrequentJoins);
        assert!(suggestions[1..].iter().all(|s| s.priority == Priority::Medium));
    }

    #[test]
    fn test_dedicated_or_disabled_is_skipped() {
        let metric = QueryMetric::new("Customer", "find", 900.0, 5000);
        assert!(advisor()
            .evaluate("Customer", StorageMode::Dedicated, &metric, AccessWindow::default())
            .is_empty());

        let off = MaterializationAdvisor::new(MaterializationPolicy {
            enabled: false,
            ..Default::default()
        });
        assert!(off
            .evaluate("Customer", StorageMode::Shared, &metric, AccessWindow::default())
            .is_empty());
    }

    #[test]
    fn test_evaluate_stats() {
        let quiet = stats(3, 20.0, AccessWindow { query_count: 3, join_count: 0 });
        assert!(advisor().evaluate_stats(&quiet).is_empty());

        let busy = stats(40, 250.0, AccessWindow { query_count: 40, join_count: 25 });
        let suggestions = advisor().evaluate_stats(&busy);
        assert_eq!(suggestions.len(), 2);
        assert_eq!(suggestions[0].reason, SuggestionReason::FrequentJoins);
        assert_eq!(suggestions[1].reason, SuggestionReason::SlowQuery);
        assert_eq!(suggestions[1].priority, Priority::Medium);
    }

    #[test]
    fn test_merge_keeps_first_per_reason() {
        let metric = QueryMetric::new("Customer", "find", 450.0, 5);
        let live = advisor().evaluate("Customer", StorageMode::Shared, &metric, AccessWindow::default());
        let historical = advisor().evaluate_stats(&stats(2, 300.0, AccessWindow::default()));

        let merged = merge_suggestions(live, historical);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].priority, Priority::High);
    }
}
