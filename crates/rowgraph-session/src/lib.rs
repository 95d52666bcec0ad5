//! Association loading for rowgraph.
//!
//! `rowgraph-session` is the **association layer**. It turns declared
//! associations between record types into a bounded number of dataset
//! queries, whatever the number of records involved.
//!
//! # Role In The Architecture
//!
//! - **Descriptors and registry**: `AssociationDescriptor` declares one named
//!   association; `Registry` validates and stores them per owner type.
//! - **Loaders**: one default loader per association shape, each issuing a
//!   single query for any number of owners; custom loaders plug in through
//!   the same `AssociationLoader` trait.
//! - **Eager loading**: `EagerLoadPlanner` walks an `EagerTree` level by level;
//!   `GraphJoinBuilder` resolves a tree with one joined query instead.
//! - **Mutations**: add / remove / set routed through association hooks.
//! - **N+1 detection**: lazy loads are counted and warned about.
//!
//! # Example
//!
//! ```ignore
//! let mut registry = Registry::new();
//! registry.register(ARTIST).register(ALBUM);
//! registry.associate("artist", AssociationDescriptor::to_many("albums", "album", &["artist_id"]))?;
//!
//! let session = Session::new(dataset, registry);
//! let artists = session
//!     .eager(&cx, "artist", None, &EagerTree::new().include("albums"))
//!     .await;
//! ```

pub mod association;
pub mod callbacks;
pub mod custom;
pub mod graph;
pub mod loader;
pub mod mutation;
pub mod n1_detection;
pub mod patterns;
pub mod planner;
pub mod registry;

pub use association::{
    AssociationDescriptor, AssociationKind, GraphBlock, GraphContext, GraphOptions, JoinTable,
    QueryHook,
};
pub use callbacks::{
    AfterHook, BeforeHook, CallbackDispatcher, Callbacks, HookFailureMode, HookOutcome, LoadHook,
    MutationKind,
};
pub use custom::{CustomLoader, LoadStrategy};
pub use graph::{GraphJoinBuilder, GraphPlan};
pub use loader::{
    AssociationLoader, Fanout, IdentityMap, LoadContext, ManyToManyLoader, ToManyLoader,
    ToOneLoader,
};
pub use mutation::{AssociationMutator, JoinRow};
pub use n1_detection::{CallSite, N1QueryTracker, N1Stats};
pub use patterns::{
    Aggregate, AggregateLoader, AncestorsLoader, DescendantsLoader, MultiKeyLoader,
    PolymorphicLoader, Through,
};
pub use planner::{EagerLoadPlanner, LoadReport};
pub use registry::Registry;

use rowgraph_core::{AssociationValue, Cx, Error, Outcome, RecordRef, Result, dedup_records};
use rowgraph_query::{Dataset, Dialect, EagerTree, Expr, OrderBy, Query};
use std::sync::Arc;

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How a vetoing before-hook is reported.
    pub hook_failure: HookFailureMode,
    /// Lazy loads of one association before the N+1 warning; `None`
    /// disables detection.
    pub n1_threshold: Option<usize>,
    /// Dialect used when rendering SQL for logs.
    pub dialect: Dialect,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hook_failure: HookFailureMode::Raise,
            n1_threshold: Some(3),
            dialect: Dialect::default(),
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Entry point for loading and mutating associations over one dataset.
pub struct Session<D: Dataset> {
    dataset: D,
    registry: Arc<Registry>,
    config: SessionConfig,
    mutator: AssociationMutator,
    /// N+1 query detection tracker (optional).
    n1_tracker: Option<N1QueryTracker>,
}

impl<D: Dataset> Session<D> {
    pub fn new(dataset: D, registry: impl Into<Arc<Registry>>) -> Self {
        Self::with_config(dataset, registry, SessionConfig::default())
    }

    pub fn with_config(dataset: D, registry: impl Into<Arc<Registry>>, config: SessionConfig) -> Self {
        Self {
            dataset,
            registry: registry.into(),
            mutator: AssociationMutator::new(CallbackDispatcher::new(config.hook_failure)),
            n1_tracker: config.n1_threshold.map(N1QueryTracker::new),
            config,
        }
    }

    pub fn dataset(&self) -> &D {
        &self.dataset
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn planner<'a>(&'a self, cx: &'a Cx) -> EagerLoadPlanner<'a> {
        EagerLoadPlanner::new(cx, &self.dataset, &self.registry)
            .with_dispatcher(self.mutator.dispatcher())
            .with_dialect(self.config.dialect)
    }

    fn graph_builder(&self) -> GraphJoinBuilder<'_> {
        GraphJoinBuilder::new(&self.registry)
            .with_dispatcher(self.mutator.dispatcher())
            .with_dialect(self.config.dialect)
    }

    // ========================================================================
    // Fetching
    // ========================================================================

    /// Fetch every record of `type_name` matching `filter`.
    ///
    /// Rows sharing a primary key become one record instance.
    #[tracing::instrument(level = "debug", skip(self, cx, filter))]
    pub async fn all(
        &self,
        cx: &Cx,
        type_name: &str,
        filter: Option<Expr>,
    ) -> Outcome<Vec<RecordRef>, Error> {
        let model = match self.registry.model(type_name) {
            Ok(model) => *model,
            Err(e) => return Outcome::Err(e),
        };
        let mut query = Query::from(model.table);
        if let Some(filter) = filter {
            query = query.filter(filter.qualify(model.table));
        }
        let rows = match self.dataset.fetch(cx, &query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let mut identity = IdentityMap::new();
        let records = rows
            .into_iter()
            .map(|row| identity.materialize(&model, row))
            .collect::<Vec<_>>();
        Outcome::Ok(dedup_records(records))
    }

    // ========================================================================
    // Eager Loading
    // ========================================================================

    /// Fetch records of `type_name` and eager load `tree` for them.
    ///
    /// One query for the roots plus at most one per requested association
    /// and level.
    pub async fn eager(
        &self,
        cx: &Cx,
        type_name: &str,
        filter: Option<Expr>,
        tree: &EagerTree,
    ) -> Outcome<Vec<RecordRef>, Error> {
        if let Err(e) = self.planner(cx).validate(type_name, tree) {
            return Outcome::Err(e);
        }
        let roots = match self.all(cx, type_name, filter).await {
            Outcome::Ok(roots) => roots,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        match self.eager_load(cx, &roots, tree).await {
            Outcome::Ok(_) => Outcome::Ok(roots),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    /// Eager load `tree` for records already in hand.
    ///
    /// Associations already cached on the records are resolved again.
    pub async fn eager_load(
        &self,
        cx: &Cx,
        records: &[RecordRef],
        tree: &EagerTree,
    ) -> Outcome<LoadReport, Error> {
        self.planner(cx).load(records, tree).await
    }

    /// Build the joined query [`Session::eager_graph`] would run.
    pub fn plan_graph(
        &self,
        type_name: &str,
        tree: &EagerTree,
        filter: Option<Expr>,
        order: &[OrderBy],
    ) -> Result<GraphPlan> {
        self.graph_builder().plan(type_name, tree, filter, order)
    }

    /// Fetch records of `type_name` with `tree` resolved by a single joined
    /// query.
    ///
    /// `filter` and `order` may reference any joined table by its alias. An
    /// association using an inner join drops roots without a match.
    pub async fn eager_graph(
        &self,
        cx: &Cx,
        type_name: &str,
        tree: &EagerTree,
        filter: Option<Expr>,
        order: &[OrderBy],
    ) -> Outcome<Vec<RecordRef>, Error> {
        let builder = self.graph_builder();
        let plan = match builder.plan(type_name, tree, filter, order) {
            Ok(plan) => plan,
            Err(e) => return Outcome::Err(e),
        };
        builder.load(cx, &self.dataset, &plan).await
    }

    // ========================================================================
    // Lazy Loading
    // ========================================================================

    /// Resolve one association of one record.
    ///
    /// A cached value (including absent or empty) is returned without a
    /// query. Otherwise the association is loaded for this record alone and
    /// the load is counted for N+1 detection.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(owner = %record.label()))]
    pub async fn load(
        &mut self,
        cx: &Cx,
        record: &RecordRef,
        name: &str,
    ) -> Outcome<AssociationValue, Error> {
        let descriptor = match self.registry.association(record.type_name(), name) {
            Ok(desc) => Arc::clone(desc),
            Err(e) => return Outcome::Err(e),
        };
        if let Some(value) = record.association(descriptor.name) {
            tracing::trace!("Already loaded");
            return Outcome::Ok(value);
        }

        if let Some(tracker) = &mut self.n1_tracker {
            tracker.record_load(record.type_name(), descriptor.name);
        }

        let tree = EagerTree::new().include(descriptor.name);
        match self.planner(cx).load(std::slice::from_ref(record), &tree).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(
            record
                .association(descriptor.name)
                .unwrap_or_else(|| descriptor.default_value()),
        )
    }

    /// Resolve the association again, replacing the cached value.
    ///
    /// The cache is only overwritten once the load succeeds; on failure the
    /// previous value (or unloaded state) is kept.
    #[tracing::instrument(level = "debug", skip(self, cx, record), fields(owner = %record.label()))]
    pub async fn reload(
        &self,
        cx: &Cx,
        record: &RecordRef,
        name: &str,
    ) -> Outcome<AssociationValue, Error> {
        let descriptor = match self.registry.association(record.type_name(), name) {
            Ok(desc) => Arc::clone(desc),
            Err(e) => return Outcome::Err(e),
        };
        let tree = EagerTree::new().include(descriptor.name);
        match self.planner(cx).load(std::slice::from_ref(record), &tree).await {
            Outcome::Ok(_) => {}
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
        Outcome::Ok(
            record
                .association(descriptor.name)
                .unwrap_or_else(|| descriptor.default_value()),
        )
    }

    // ========================================================================
    // Mutations
    // ========================================================================

    /// Add `target` to the `name` collection of `owner`.
    pub fn add(&self, owner: &RecordRef, name: &str, target: &RecordRef) -> Result<bool> {
        let descriptor = self.registry.association(owner.type_name(), name)?;
        self.mutator.add(descriptor, owner, target)
    }

    /// Remove `target` from the `name` collection of `owner`.
    pub fn remove(&self, owner: &RecordRef, name: &str, target: &RecordRef) -> Result<bool> {
        let descriptor = self.registry.association(owner.type_name(), name)?;
        self.mutator.remove(descriptor, owner, target)
    }

    /// Point the to-one association `name` of `owner` at `target`.
    pub fn set(&self, owner: &RecordRef, name: &str, target: Option<&RecordRef>) -> Result<bool> {
        let descriptor = self.registry.association(owner.type_name(), name)?;
        self.mutator.set(descriptor, owner, target)
    }

    /// Join-table rows queued by many-to-many adds, clearing the queue.
    pub fn take_pending_links(&self) -> Vec<JoinRow> {
        self.mutator.take_pending_links()
    }

    /// Join-table rows queued by many-to-many removes, clearing the queue.
    pub fn take_pending_unlinks(&self) -> Vec<JoinRow> {
        self.mutator.take_pending_unlinks()
    }

    // ========================================================================
    // N+1 Detection
    // ========================================================================

    /// Enable N+1 detection with the given threshold.
    pub fn enable_n1_detection(&mut self, threshold: usize) {
        self.n1_tracker = Some(N1QueryTracker::new(threshold));
    }

    /// Disable N+1 query detection and clear the tracker.
    pub fn disable_n1_detection(&mut self) {
        self.n1_tracker = None;
    }

    #[must_use]
    pub fn n1_detection_enabled(&self) -> bool {
        self.n1_tracker.is_some()
    }

    /// Get N+1 detection statistics.
    #[must_use]
    pub fn n1_stats(&self) -> Option<N1Stats> {
        self.n1_tracker.as_ref().map(N1QueryTracker::stats)
    }

    /// Reset N+1 detection counts (call at start of new request).
    pub fn reset_n1_tracking(&mut self) {
        if let Some(tracker) = &mut self.n1_tracker {
            tracker.reset();
        }
    }
}
