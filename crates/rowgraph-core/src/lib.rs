//! Core types for rowgraph.
//!
//! This crate provides the data model shared by the query and session layers:
//!
//! - `Value` and `Row` for dataset results
//! - `ModelInfo` static record-type metadata
//! - `Key` / `KeyIndex` for batching association loads by key tuple
//! - `Record` with its per-association cache
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod error;
pub mod key;
pub mod model;
pub mod record;
pub mod row;
pub mod value;

pub use error::{
    AssociationError, AssociationErrorKind, ConfigError, ConfigErrorKind, Error, QueryError,
    QueryErrorKind, Result, TypeError,
};
pub use key::{Key, KeyIndex};
pub use model::ModelInfo;
pub use record::{AssociationValue, Record, RecordRef, dedup_records};
pub use row::{ALIAS_SEPARATOR, ColumnInfo, Row};
pub use value::Value;
