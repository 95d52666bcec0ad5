//! The dataset collaborator.
//!
//! A [`Dataset`] executes a [`Query`] and returns its rows. How the query
//! reaches the store (SQL over a connection, an in-memory evaluator, a
//! remote API) is the implementation's business; loaders only decide which
//! queries to issue.

use crate::query::Query;
use rowgraph_core::{Cx, Error, Outcome, Row};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Boxed future returned by object-safe async traits in this workspace.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Outcome<T, Error>> + Send + 'a>>;

/// Executes queries.
///
/// Each call is one round trip. The returned rows are a finite, fully
/// materialized result; callers never rely on re-reading them from the
/// dataset.
pub trait Dataset: Send + Sync {
    /// Execute `query` and return its rows.
    fn fetch<'a>(&'a self, cx: &'a Cx, query: &'a Query) -> BoxFuture<'a, Vec<Row>>;
}

impl<D: Dataset + ?Sized> Dataset for Arc<D> {
    fn fetch<'a>(&'a self, cx: &'a Cx, query: &'a Query) -> BoxFuture<'a, Vec<Row>> {
        (**self).fetch(cx, query)
    }
}

impl<D: Dataset + ?Sized> Dataset for &D {
    fn fetch<'a>(&'a self, cx: &'a Cx, query: &'a Query) -> BoxFuture<'a, Vec<Row>> {
        (**self).fetch(cx, query)
    }
}
