//! Storage Layer - SQLite-backed persistence
//!
//! One SQLite database holds everything:
//! - kdb_* metadata tables (entities, fields, relationships, changelog, jobs, metrics)
//! - kdb_records, the shared document table
//! - ent_* dedicated tables, one per materialized entity
//! - jt_* junction tables for many-to-many relationships
//!
//! `StorageRouter` is the entry point for record CRUD; it dispatches to the
//! shared or dedicated backend according to each entity's storage mode.

pub(crate) mod backend;
pub(crate) mod dedicated;
pub mod filter;
pub mod router;
pub mod schema;
pub(crate) mod shared;
pub mod sqlite;
pub mod value;

pub use filter::{Condition, Filter, FilterOp};
pub use router::{RowCounts, StorageRouter};
pub use sqlite::{Database, DbStats, SqliteOptions};
pub use value::{Document, Record};
