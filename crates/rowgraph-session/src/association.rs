//! Association descriptors.
//!
//! An [`AssociationDescriptor`] declares one named association from an owner
//! type to a target type: its shape, the key columns on both sides, an
//! optional join table, loader query options, graph-join options, hooks and
//! an optional custom loader. Descriptors are built with chained setters and
//! become immutable once [`Registry::associate`](crate::Registry::associate)
//! validates and stores them.
//!
//! # Example
//!
//! ```ignore
//! registry.associate(
//!     "artist",
//!     AssociationDescriptor::to_many("albums", "album", &["artist_id"])
//!         .order_by(OrderBy::asc("position"))
//!         .reciprocal("artist"),
//! )?;
//! ```

use crate::callbacks::{AfterHook, BeforeHook, Callbacks, HookOutcome, LoadHook};
use crate::loader::{AssociationLoader, ManyToManyLoader, ToManyLoader, ToOneLoader};
use crate::patterns::AggregateLoader;
use rowgraph_core::{AssociationValue, Record, RecordRef, Value};
use rowgraph_query::{Expr, Join, JoinCondition, JoinType, OrderBy, Query};
use std::fmt;
use std::sync::Arc;

/// Shape of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    /// Owner's local key references the target (many-to-one / one-to-one).
    ToOne,
    /// Target's foreign key references the owner.
    ToMany,
    /// Owner and target are linked through a join table.
    ManyToMany,
    /// A computed value (aggregate) rather than records.
    Scalar,
}

impl AssociationKind {
    /// Value an owner holds when nothing matched.
    pub fn default_value(&self) -> AssociationValue {
        match self {
            AssociationKind::ToOne => AssociationValue::Absent,
            AssociationKind::ToMany | AssociationKind::ManyToMany => {
                AssociationValue::Many(Vec::new())
            }
            AssociationKind::Scalar => AssociationValue::Scalar(Value::Null),
        }
    }

    /// Whether the association holds a list.
    pub const fn is_collection(&self) -> bool {
        matches!(self, AssociationKind::ToMany | AssociationKind::ManyToMany)
    }

    /// Lowercase name for logs.
    pub const fn as_str(&self) -> &'static str {
        match self {
            AssociationKind::ToOne => "to_one",
            AssociationKind::ToMany => "to_many",
            AssociationKind::ManyToMany => "many_to_many",
            AssociationKind::Scalar => "scalar",
        }
    }
}

/// Join table linking owners to targets.
///
/// `owner_columns` reference the owner's key; `target_columns` reference the
/// target's key. Both lists are in the same order as the keys they match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JoinTable {
    pub table: &'static str,
    pub owner_columns: &'static [&'static str],
    pub target_columns: &'static [&'static str],
}

impl JoinTable {
    /// Create a join table description.
    pub const fn new(
        table: &'static str,
        owner_columns: &'static [&'static str],
        target_columns: &'static [&'static str],
    ) -> Self {
        Self {
            table,
            owner_columns,
            target_columns,
        }
    }
}

/// What a graph-join condition callback sees.
#[derive(Debug)]
pub struct GraphContext<'a> {
    /// Alias of the table being joined.
    pub alias: &'a str,
    /// Alias of the table it is joined to.
    pub previous: &'a str,
    /// Joins added before this one.
    pub joins: &'a [Join],
}

/// Callback producing an extra graph-join condition.
pub type GraphBlock = Arc<dyn Fn(&GraphContext<'_>) -> Expr + Send + Sync>;

/// Rewrites a default loader's query before it runs.
pub type QueryHook = Arc<dyn Fn(Query) -> Query + Send + Sync>;

/// Options used when the association is loaded through a graph join.
#[derive(Clone, Default)]
pub struct GraphOptions {
    /// Join kind for this hop.
    pub join_type: JoinType,
    /// Extra `alias.column = value` conditions.
    pub conditions: Vec<(&'static str, Value)>,
    /// Replaces the key-equality condition entirely.
    pub only_conditions: Option<JoinCondition>,
    /// Callback adding a condition computed from the join aliases.
    pub block: Option<GraphBlock>,
    /// Alias to use instead of the association name.
    pub alias: Option<&'static str>,
}

impl fmt::Debug for GraphOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphOptions")
            .field("join_type", &self.join_type)
            .field("conditions", &self.conditions)
            .field("only_conditions", &self.only_conditions)
            .field("block", &self.block.is_some())
            .field("alias", &self.alias)
            .finish()
    }
}

/// A declared association.
#[derive(Clone)]
pub struct AssociationDescriptor {
    /// Association name, unique per owner type.
    pub name: &'static str,
    /// Owner type name (filled in at registration).
    pub owner: &'static str,
    /// Shape.
    pub kind: AssociationKind,
    /// Target type name. `None` for custom loaders whose targets vary.
    pub target: Option<&'static str>,
    /// Key columns on the owner. Empty means "owner primary key".
    pub owner_key: &'static [&'static str],
    /// Key columns on the target. Empty means "target primary key".
    pub target_key: &'static [&'static str],
    /// Join table for many-to-many associations.
    pub join_table: Option<JoinTable>,
    /// Filter applied to every load of this association.
    pub filter: Option<Expr>,
    /// Ordering of loaded collections.
    pub order_by: Vec<OrderBy>,
    pub graph: GraphOptions,
    pub callbacks: Callbacks,
    /// Query rewrite applied by the default loaders.
    pub dataset: Option<QueryHook>,
    /// Loader replacing the default one for this shape.
    pub custom_loader: Option<Arc<dyn AssociationLoader>>,
    /// Mutations through this association are rejected.
    pub read_only: bool,
    /// Association on the target pointing back at the owner.
    pub reciprocal: Option<&'static str>,
}

impl AssociationDescriptor {
    fn base(name: &'static str, kind: AssociationKind, target: Option<&'static str>) -> Self {
        Self {
            name,
            owner: "",
            kind,
            target,
            owner_key: &[],
            target_key: &[],
            join_table: None,
            filter: None,
            order_by: Vec::new(),
            graph: GraphOptions::default(),
            callbacks: Callbacks::default(),
            dataset: None,
            custom_loader: None,
            read_only: false,
            reciprocal: None,
        }
    }

    /// To-one association: `local_key` columns on the owner reference the
    /// target's primary key.
    #[must_use]
    pub fn to_one(
        name: &'static str,
        target: &'static str,
        local_key: &'static [&'static str],
    ) -> Self {
        let mut desc = Self::base(name, AssociationKind::ToOne, Some(target));
        desc.owner_key = local_key;
        desc
    }

    /// To-many association: `foreign_key` columns on the target reference
    /// the owner's primary key.
    #[must_use]
    pub fn to_many(
        name: &'static str,
        target: &'static str,
        foreign_key: &'static [&'static str],
    ) -> Self {
        let mut desc = Self::base(name, AssociationKind::ToMany, Some(target));
        desc.target_key = foreign_key;
        desc
    }

    /// Many-to-many association through `join_table`.
    #[must_use]
    pub fn many_to_many(name: &'static str, target: &'static str, join_table: JoinTable) -> Self {
        let mut desc = Self::base(name, AssociationKind::ManyToMany, Some(target));
        desc.join_table = Some(join_table);
        desc
    }

    /// Association resolved entirely by `loader`.
    #[must_use]
    pub fn custom(
        name: &'static str,
        kind: AssociationKind,
        loader: impl AssociationLoader + 'static,
    ) -> Self {
        let mut desc = Self::base(name, kind, None);
        desc.custom_loader = Some(Arc::new(loader));
        desc
    }

    /// Read-only scalar association computed by `loader`.
    #[must_use]
    pub fn aggregate(name: &'static str, target: &'static str, loader: AggregateLoader) -> Self {
        Self::custom(name, AssociationKind::Scalar, loader)
            .target(target)
            .read_only()
    }

    /// Set the target type.
    #[must_use]
    pub fn target(mut self, target: &'static str) -> Self {
        self.target = Some(target);
        self
    }

    /// Set the owner-side key columns.
    #[must_use]
    pub fn owner_key(mut self, columns: &'static [&'static str]) -> Self {
        self.owner_key = columns;
        self
    }

    /// Set the target-side key columns.
    #[must_use]
    pub fn target_key(mut self, columns: &'static [&'static str]) -> Self {
        self.target_key = columns;
        self
    }

    /// Add a filter (ANDed with any existing one).
    #[must_use]
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Add an ordering term.
    #[must_use]
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Join kind used by graph joins.
    #[must_use]
    pub fn join_type(mut self, join_type: JoinType) -> Self {
        self.graph.join_type = join_type;
        self
    }

    /// Extra equality condition on the joined table in graph joins.
    #[must_use]
    pub fn graph_condition(mut self, column: &'static str, value: impl Into<Value>) -> Self {
        self.graph.conditions.push((column, value.into()));
        self
    }

    /// Replace the key-equality graph-join condition.
    #[must_use]
    pub fn graph_only_conditions(mut self, condition: JoinCondition) -> Self {
        self.graph.only_conditions = Some(condition);
        self
    }

    /// Add a computed graph-join condition.
    #[must_use]
    pub fn graph_block<F>(mut self, block: F) -> Self
    where
        F: Fn(&GraphContext<'_>) -> Expr + Send + Sync + 'static,
    {
        self.graph.block = Some(Arc::new(block));
        self
    }

    /// Alias for this hop in graph joins.
    #[must_use]
    pub fn graph_alias(mut self, alias: &'static str) -> Self {
        self.graph.alias = Some(alias);
        self
    }

    /// Rewrite the default loader's query.
    #[must_use]
    pub fn dataset<F>(mut self, hook: F) -> Self
    where
        F: Fn(Query) -> Query + Send + Sync + 'static,
    {
        self.dataset = Some(Arc::new(hook));
        self
    }

    /// Replace the default loader.
    #[must_use]
    pub fn loader(mut self, loader: impl AssociationLoader + 'static) -> Self {
        self.custom_loader = Some(Arc::new(loader));
        self
    }

    /// Reject add / remove / set.
    #[must_use]
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Name the association on the target that points back at the owner.
    #[must_use]
    pub fn reciprocal(mut self, name: &'static str) -> Self {
        self.reciprocal = Some(name);
        self
    }

    #[must_use]
    pub fn before_add<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) -> HookOutcome + Send + Sync + 'static,
    {
        self.callbacks.before_add.push(Arc::new(hook) as BeforeHook);
        self
    }

    #[must_use]
    pub fn after_add<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.after_add.push(Arc::new(hook) as AfterHook);
        self
    }

    #[must_use]
    pub fn before_remove<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) -> HookOutcome + Send + Sync + 'static,
    {
        self.callbacks.before_remove.push(Arc::new(hook) as BeforeHook);
        self
    }

    #[must_use]
    pub fn after_remove<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.after_remove.push(Arc::new(hook) as AfterHook);
        self
    }

    #[must_use]
    pub fn before_set<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) -> HookOutcome + Send + Sync + 'static,
    {
        self.callbacks.before_set.push(Arc::new(hook) as BeforeHook);
        self
    }

    #[must_use]
    pub fn after_set<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, Option<&RecordRef>) + Send + Sync + 'static,
    {
        self.callbacks.after_set.push(Arc::new(hook) as AfterHook);
        self
    }

    /// Run `hook` whenever this association is resolved.
    #[must_use]
    pub fn after_load<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Record, &AssociationValue) + Send + Sync + 'static,
    {
        self.callbacks.after_load.push(Arc::new(hook) as LoadHook);
        self
    }

    /// Whether a custom loader replaces the default one.
    pub fn is_custom(&self) -> bool {
        self.custom_loader.is_some()
    }

    /// Value an owner holds when nothing matched.
    pub fn default_value(&self) -> AssociationValue {
        self.kind.default_value()
    }

    /// The loader that resolves this association: the custom loader when
    /// one is set, else the default loader for the shape.
    pub fn resolver(&self) -> &dyn AssociationLoader {
        match &self.custom_loader {
            Some(loader) => loader.as_ref(),
            None => match self.kind {
                AssociationKind::ToOne | AssociationKind::Scalar => &ToOneLoader,
                AssociationKind::ToMany => &ToManyLoader,
                AssociationKind::ManyToMany => &ManyToManyLoader,
            },
        }
    }

    /// Alias used for this hop in graph joins.
    pub fn graph_alias_name(&self) -> &'static str {
        self.graph.alias.unwrap_or(self.name)
    }
}

impl fmt::Debug for AssociationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationDescriptor")
            .field("name", &self.name)
            .field("owner", &self.owner)
            .field("kind", &self.kind)
            .field("target", &self.target)
            .field("owner_key", &self.owner_key)
            .field("target_key", &self.target_key)
            .field("join_table", &self.join_table)
            .field("filter", &self.filter)
            .field("order_by", &self.order_by)
            .field("graph", &self.graph)
            .field("callbacks", &self.callbacks)
            .field("custom_loader", &self.custom_loader.is_some())
            .field("read_only", &self.read_only)
            .field("reciprocal", &self.reciprocal)
            .finish()
    }
}
