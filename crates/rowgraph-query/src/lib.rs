//! Query model and dataset abstraction for rowgraph.
//!
//! `rowgraph-query` is the **query construction layer**. Loaders describe
//! the one query they need as a [`Query`] value; a [`Dataset`] executes it.
//!
//! # Role In The Architecture
//!
//! - **Expression DSL**: `Expr` builds filters and join conditions.
//! - **Joins**: `Join` with ON / USING / NATURAL / CROSS conditions.
//! - **Dialect support**: `Query::to_sql_with_dialect` renders Postgres,
//!   MySQL and SQLite SQL for logging and SQL-backed datasets.
//! - **Datasets**: the `Dataset` trait plus `MemoryDataset`, an in-memory
//!   evaluator with a query log.
//! - **Eager trees**: `EagerTree` describes nested association requests.

pub mod clause;
pub mod dataset;
pub mod eager;
pub mod expr;
pub mod join;
pub mod memory;
pub mod query;

pub use clause::{NullsOrder, OrderBy, OrderDirection};
pub use dataset::{BoxFuture, Dataset};
pub use eager::{EagerEntry, EagerTree};
pub use expr::{BinaryOp, Dialect, Expr};
pub use join::{Join, JoinCondition, JoinType};
pub use memory::MemoryDataset;
pub use query::{Query, SelectItem};
