//! Query metrics and materialization advice
//!
//! The collector persists one row per observed query. The advisor turns a
//! single metric plus the entity's recent access window into suggestions to
//! move the entity to dedicated storage. Suggestions are advisory only.

pub mod advisor;
pub mod collector;

pub use advisor::{MaterializationAdvisor, MaterializationSuggestion, Priority, SuggestedAction, SuggestionReason};
pub use collector::MetricsCollector;

use serde::{Deserialize, Serialize};

use crate::now_timestamp;
use crate::schema::StorageMode;

/// Thresholds governing materialization advice and metric retention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaterializationPolicy {
    /// When false, metrics are neither stored nor evaluated
    pub enabled: bool,
    /// A single query slower than this suggests materialization
    pub execution_time_threshold_ms: f64,
    /// A single query returning more rows than this suggests materialization
    pub row_count_threshold: usize,
    /// More join queries than this within the window suggests materialization
    pub join_frequency_threshold: usize,
    /// More queries of any kind than this within the window suggests materialization
    pub access_frequency_threshold: usize,
    pub window_hours: u32,
    pub retention_days: u32,
}

impl Default for MaterializationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            execution_time_threshold_ms: 100.0,
            row_count_threshold: 1000,
            join_frequency_threshold: 10,
            access_frequency_threshold: 500,
            window_hours: 24,
            retention_days: 7,
        }
    }
}

/// One observed query against an entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryMetric {
    pub entity_name: String,
    pub timestamp: String,
    pub query_type: String,
    pub execution_time_ms: f64,
    pub row_count: usize,
    pub has_join: bool,
    pub tables_accessed: Vec<String>,
    pub created_by: Option<String>,
}

impl QueryMetric {
    pub fn new(entity: &str, query_type: &str, execution_time_ms: f64, row_count: usize) -> Self {
        Self {
            entity_name: entity.to_string(),
            timestamp: now_timestamp(),
            query_type: query_type.to_string(),
            execution_time_ms,
            row_count,
            has_join: false,
            tables_accessed: Vec::new(),
            created_by: None,
        }
    }

    pub fn with_join(mut self) -> Self {
        self.has_join = true;
        self
    }

    pub fn with_tables(mut self, tables: Vec<String>) -> Self {
        self.tables_accessed = tables;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.created_by = Some(actor.into());
        self
    }
}

/// Query and join counts within the policy window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessWindow {
    pub query_count: usize,
    pub join_count: usize,
}

/// Aggregated metrics for one entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityStats {
    pub entity_name: String,
    pub storage_mode: StorageMode,
    pub record_count: usize,
    pub total_queries: usize,
    pub avg_execution_time_ms: f64,
    pub max_execution_time_ms: f64,
    pub total_rows_returned: usize,
    pub join_count: usize,
    pub window_hours: u32,
    pub window: AccessWindow,
    pub first_seen: Option<String>,
    pub last_seen: Option<String>,
    /// Message of the top historical suggestion, if any
    pub suggestion: Option<String>,
}

impl std::fmt::Display for EntityStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{} ({}, {} records)", self.entity_name, self.storage_mode, self.record_count)?;
        writeln!(f, "  Queries: {} (avg {:.1} ms, max {:.1} ms)", self.total_queries, self.avg_execution_time_ms, self.max_execution_time_ms)?;
        writeln!(f, "  Joins: {}", self.join_count)?;
        write!(
            f,
            "  Last {}h: {} queries, {} joins",
            self.window_hours, self.window.query_count, self.window.join_count
        )?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }
        Ok(())
    }
}
