//! Moving entities between shared and dedicated storage
//!
//! A migration is a persisted job driven one batch at a time. Each batch
//! commits on its own, so a failure leaves an inspectable processed count.
//! The final step reconciles concurrent writes, verifies row counts and
//! flips the entity's storage mode in a single transaction.

pub mod engine;

pub use engine::MigrationEngine;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::schema::StorageMode;
use crate::Error;

/// Batch size used when the caller does not choose one
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationDirection {
    /// Shared to dedicated (materialize)
    ToDedicated,
    /// Dedicated to shared (dematerialize)
    ToShared,
}

impl MigrationDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationDirection::ToDedicated => "to_dedicated",
            MigrationDirection::ToShared => "to_shared",
        }
    }

    /// Changelog operation recorded on completion
    pub fn operation(&self) -> &'static str {
        match self {
            MigrationDirection::ToDedicated => "materialize",
            MigrationDirection::ToShared => "dematerialize",
        }
    }

    pub fn source_mode(&self) -> StorageMode {
        match self {
            MigrationDirection::ToDedicated => StorageMode::Shared,
            MigrationDirection::ToShared => StorageMode::Dedicated,
        }
    }

    pub fn target_mode(&self) -> StorageMode {
        match self {
            MigrationDirection::ToDedicated => StorageMode::Dedicated,
            MigrationDirection::ToShared => StorageMode::Shared,
        }
    }
}

impl FromStr for MigrationDirection {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "to_dedicated" => Ok(MigrationDirection::ToDedicated),
            "to_shared" => Ok(MigrationDirection::ToShared),
            other => Err(Error::validation("migration", format!("unknown direction '{}'", other))),
        }
    }
}

impl std::fmt::Display for MigrationDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Completed jobs are deleted, so a persisted job is either running or failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Running,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "running" => Ok(JobStatus::Running),
            "failed" => Ok(JobStatus::Failed),
            other => Err(Error::validation("migration", format!("unknown job status '{}'", other))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Persisted state of an in-flight migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationJob {
    pub entity_name: String,
    pub direction: MigrationDirection,
    pub batch_size: usize,
    pub processed_count: usize,
    pub total_count: usize,
    pub batches: usize,
    /// Id of the last copied row
    pub cursor: Option<String>,
    pub status: JobStatus,
    /// The dedicated table being filled or drained
    pub target_table: Option<String>,
    pub started_at: String,
    pub updated_at: String,
    pub error: Option<String>,
    pub actor: Option<String>,
    pub reason: Option<String>,
}

impl MigrationJob {
    pub fn progress(&self) -> MigrationProgress {
        MigrationProgress {
            entity: self.entity_name.clone(),
            direction: self.direction,
            processed: self.processed_count,
            total: self.total_count,
            batch: self.batches,
            total_batches: self.total_count.div_ceil(self.batch_size.max(1)),
        }
    }

    pub fn is_failed(&self) -> bool {
        self.status == JobStatus::Failed
    }
}

/// Emitted after every committed batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationProgress {
    pub entity: String,
    pub direction: MigrationDirection,
    pub processed: usize,
    pub total: usize,
    pub batch: usize,
    pub total_batches: usize,
}

impl MigrationProgress {
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            100.0
        } else {
            (self.processed as f64 / self.total as f64 * 100.0).min(100.0)
        }
    }
}

/// Summary of a completed migration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationReport {
    pub entity: String,
    pub direction: MigrationDirection,
    pub records_migrated: usize,
    pub batches: usize,
    pub table_name: Option<String>,
    pub duration_ms: i64,
}

impl std::fmt::Display for MigrationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {}: {} records in {} batches ({} ms)",
            self.direction.operation(),
            self.entity,
            self.records_migrated,
            self.batches,
            self.duration_ms
        )
    }
}

/// Outcome of driving a job one step
#[derive(Debug, Clone, PartialEq)]
pub enum MigrationStep {
    Batch(MigrationProgress),
    Completed(MigrationReport),
}
