//! Relationship enforcement
//!
//! - `enforcer`: on_delete actions (CASCADE, SET_NULL, RESTRICT, NO_ACTION)
//!   and many-to-many link operations
//! - `junction`: physical junction tables

pub mod enforcer;
pub(crate) mod junction;

pub use enforcer::{DeleteOptions, DeleteOutcome, DeleteReport, RelationshipEnforcer, RestrictViolation};
