//! Association loaders.
//!
//! A loader resolves one association for a batch of owners of the same type
//! with a bounded number of queries, independent of how many owners there
//! are. The default loaders issue exactly one query each:
//!
//! | shape        | owner key       | target key          | default     |
//! |--------------|-----------------|---------------------|-------------|
//! | to-one       | local key       | target primary key  | `Absent`    |
//! | to-many      | owner pk        | foreign key         | empty list  |
//! | many-to-many | owner pk        | target pk, via join | empty list  |
//!
//! Loaders never write to record caches directly. They stage their results
//! in a [`Fanout`]; the planner applies every staged fan-out once the whole
//! eager load has succeeded, so a failed load leaves caches untouched.

use crate::association::AssociationDescriptor;
use crate::registry::Registry;
use rowgraph_core::error::ConfigErrorKind;
use rowgraph_core::{
    AssociationValue, Cx, Error, Key, KeyIndex, ModelInfo, Outcome, Record, RecordRef, Result,
    Row, Value, dedup_records,
};
use rowgraph_query::{BoxFuture, Dataset, Dialect, Expr, Join, Query};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Prefix of the owner-key columns projected by join-table queries.
pub(crate) const OWNER_COLUMN_PREFIX: &str = "__owner_";

/// Resolves an association for a batch of owners.
///
/// Implementations must:
///
/// - give every owner a value (the shape default when nothing matched)
/// - issue a number of queries that does not grow with `owners.len()`
/// - stage results in the returned [`Fanout`] instead of writing caches
/// - report the loaded target records via [`Fanout::add_target`] so nested
///   requests can continue from them
pub trait AssociationLoader: Send + Sync {
    fn load<'a>(&'a self, ctx: &'a LoadContext<'a>, owners: &'a [RecordRef])
    -> BoxFuture<'a, Fanout>;
}

/// Everything a loader needs for one invocation.
pub struct LoadContext<'a> {
    pub cx: &'a Cx,
    pub dataset: &'a dyn Dataset,
    pub registry: &'a Registry,
    pub descriptor: &'a AssociationDescriptor,
    /// Per-call filter from the eager request.
    pub filter: Option<&'a Expr>,
    pub dialect: Dialect,
    queries: AtomicUsize,
}

impl<'a> LoadContext<'a> {
    pub fn new(
        cx: &'a Cx,
        dataset: &'a dyn Dataset,
        registry: &'a Registry,
        descriptor: &'a AssociationDescriptor,
    ) -> Self {
        Self {
            cx,
            dataset,
            registry,
            descriptor,
            filter: None,
            dialect: Dialect::default(),
            queries: AtomicUsize::new(0),
        }
    }

    /// Attach the per-call filter.
    #[must_use]
    pub fn with_filter(mut self, filter: Option<&'a Expr>) -> Self {
        self.filter = filter;
        self
    }

    /// Set the dialect used when rendering SQL for logs.
    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Metadata of the descriptor's target type.
    pub fn target_model(&self) -> Result<&'a ModelInfo> {
        let registry: &'a Registry = self.registry;
        match self.descriptor.target {
            Some(target) => registry.model(target),
            None => Err(Error::config(
                ConfigErrorKind::UnknownType,
                format!(
                    "{}.{} has no static target type",
                    self.descriptor.owner, self.descriptor.name
                ),
            )),
        }
    }

    /// Apply the association's filter, the per-call filter, ordering and
    /// dataset override to a query over `reference` (the target table or
    /// its alias).
    pub fn scope(&self, mut query: Query, reference: &str) -> Query {
        if let Some(filter) = &self.descriptor.filter {
            query = query.filter(filter.qualify(reference));
        }
        if let Some(filter) = self.filter {
            query = query.filter(filter.qualify(reference));
        }
        for order in &self.descriptor.order_by {
            query = query.order_by(order.qualify(reference));
        }
        match &self.descriptor.dataset {
            Some(hook) => hook(query),
            None => query,
        }
    }

    /// Execute one query, counting it.
    pub async fn fetch(&self, query: &Query) -> Outcome<Vec<Row>, Error> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        let (sql, params) = query.to_sql_with_dialect(self.dialect);
        tracing::trace!(
            association = self.descriptor.name,
            sql = %sql,
            params = params.len(),
            "Association query"
        );
        self.dataset.fetch(self.cx, query).await
    }

    /// Number of queries issued through this context.
    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }
}

/// Staged association writes produced by a loader.
///
/// Writes are keyed by (record identity, association name). Later writes to
/// the same slot replace earlier ones, except through [`Fanout::append`],
/// [`Fanout::assign_first`] and [`Fanout::assign_back`].
#[derive(Default)]
pub struct Fanout {
    writes: Vec<Staged>,
    slots: HashMap<(usize, &'static str), usize>,
    // write index -> identities already in its list
    members: HashMap<usize, HashSet<usize>>,
    targets: Vec<RecordRef>,
}

struct Staged {
    record: RecordRef,
    name: &'static str,
    value: AssociationValue,
    back: bool,
}

fn identity(record: &RecordRef) -> usize {
    Arc::as_ptr(record) as usize
}

impl Fanout {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self, record: &RecordRef, name: &'static str) -> Option<usize> {
        self.slots.get(&(identity(record), name)).copied()
    }

    fn stage(&mut self, record: &RecordRef, name: &'static str, value: AssociationValue, back: bool) {
        match self.index(record, name) {
            Some(idx) => {
                let staged = &mut self.writes[idx];
                staged.value = value;
                staged.back = back;
                self.members.remove(&idx);
            }
            None => {
                self.slots.insert((identity(record), name), self.writes.len());
                self.writes.push(Staged {
                    record: Arc::clone(record),
                    name,
                    value,
                    back,
                });
            }
        }
    }

    fn stage_first(&mut self, record: &RecordRef, name: &'static str, target: &RecordRef, back: bool) {
        if let Some(idx) = self.index(record, name) {
            if matches!(self.writes[idx].value, AssociationValue::One(_)) {
                return;
            }
        }
        self.stage(record, name, AssociationValue::One(Arc::clone(target)), back);
    }

    /// Stage `value` for `record.name`, replacing any staged value.
    pub fn assign(&mut self, record: &RecordRef, name: &'static str, value: AssociationValue) {
        self.stage(record, name, value, false);
    }

    /// Stage the same value for every record.
    pub fn assign_all(&mut self, records: &[RecordRef], name: &'static str, value: &AssociationValue) {
        for record in records {
            self.assign(record, name, value.clone());
        }
    }

    /// Stage a to-one target unless one is already staged.
    pub fn assign_first(&mut self, record: &RecordRef, name: &'static str, target: &RecordRef) {
        self.stage_first(record, name, target, false);
    }

    /// Stage a back-reference from `record` to `owner`, a record that holds
    /// it, unless one is already staged. Applied with
    /// [`Record::set_back_reference`].
    pub fn assign_back(&mut self, record: &RecordRef, name: &'static str, owner: &RecordRef) {
        self.stage_first(record, name, owner, true);
    }

    /// Append a target to a staged list, skipping targets already present.
    pub fn append(&mut self, record: &RecordRef, name: &'static str, target: &RecordRef) {
        let Some(idx) = self.index(record, name) else {
            self.stage(record, name, AssociationValue::Many(vec![Arc::clone(target)]), false);
            self.members
                .insert(self.writes.len() - 1, HashSet::from([identity(target)]));
            return;
        };
        match &mut self.writes[idx].value {
            AssociationValue::Many(list) => {
                let seen = self
                    .members
                    .entry(idx)
                    .or_insert_with(|| list.iter().map(identity).collect());
                if seen.insert(identity(target)) {
                    list.push(Arc::clone(target));
                }
            }
            other => {
                *other = AssociationValue::Many(vec![Arc::clone(target)]);
                self.members.insert(idx, HashSet::from([identity(target)]));
            }
        }
    }

    /// Staged value for `record.name`.
    pub fn value(&self, record: &RecordRef, name: &'static str) -> Option<&AssociationValue> {
        self.index(record, name).map(|idx| &self.writes[idx].value)
    }

    /// Whether anything is staged for `record.name`.
    pub fn is_assigned(&self, record: &RecordRef, name: &'static str) -> bool {
        self.index(record, name).is_some()
    }

    /// Record a loaded target as an owner for nested requests.
    pub fn add_target(&mut self, target: &RecordRef) {
        self.targets.push(Arc::clone(target));
    }

    /// Loaded targets, deduplicated by identity.
    pub fn targets(&self) -> Vec<RecordRef> {
        dedup_records(self.targets.iter().cloned())
    }

    /// Number of staged writes.
    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    /// Write every staged value into the record caches.
    pub fn apply(self) -> usize {
        let count = self.writes.len();
        for staged in self.writes {
            if staged.back {
                staged.record.set_back_reference(staged.name, staged.value);
            } else {
                staged.record.set_association(staged.name, staged.value);
            }
        }
        count
    }
}

impl std::fmt::Debug for Fanout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fanout")
            .field("writes", &self.writes.len())
            .field("targets", &self.targets.len())
            .finish()
    }
}

/// Per-query identity map: rows with the same primary key become the same
/// record instance.
#[derive(Debug, Default)]
pub struct IdentityMap {
    records: HashMap<(&'static str, Key), RecordRef>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the record for `row`, reusing an instance with the same key.
    pub fn materialize(&mut self, model: &ModelInfo, row: Row) -> RecordRef {
        let record = Record::new(*model, row);
        match record.primary_key() {
            Some(key) => Arc::clone(
                self.records
                    .entry((model.name, key))
                    .or_insert(record),
            ),
            None => record,
        }
    }

    /// Adopt an existing record so later rows with its key reuse it.
    pub fn adopt(&mut self, record: &RecordRef) {
        if let Some(key) = record.primary_key() {
            self.records
                .entry((record.type_name(), key))
                .or_insert_with(|| Arc::clone(record));
        }
    }

    /// Record already materialized for `model` with `key`.
    pub fn get(&self, model: &'static str, key: &Key) -> Option<&RecordRef> {
        self.records.get(&(model, key.clone()))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// `table.column` expressions for key columns.
pub(crate) fn key_columns(reference: &str, columns: &[&str]) -> Vec<Expr> {
    columns
        .iter()
        .map(|c| Expr::qualified(reference, *c))
        .collect()
}

/// Key rows for an IN list.
pub(crate) fn key_rows<T>(index: &KeyIndex<T>) -> Vec<Vec<Value>> {
    index.keys().iter().map(|k| k.parts().to_vec()).collect()
}

/// Split a join-table row into the target row and the owner key values.
pub(crate) fn split_owner_columns(row: &Row) -> (Row, Vec<Value>) {
    let mut names = Vec::new();
    let mut values = Vec::new();
    let mut owner = Vec::new();
    for (name, value) in row.iter() {
        match name.strip_prefix(OWNER_COLUMN_PREFIX) {
            Some(_) => owner.push(value.clone()),
            None => {
                names.push(name.to_string());
                values.push(value.clone());
            }
        }
    }
    (Row::new(names, values), owner)
}

fn index_owners(owners: &[RecordRef], columns: &[&str]) -> KeyIndex<RecordRef> {
    KeyIndex::build(owners.iter().cloned(), |o| o.key_for(columns))
}

macro_rules! try_fetch {
    ($ctx:expr, $query:expr) => {
        match $ctx.fetch($query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        }
    };
}
pub(crate) use try_fetch;

/// Default loader for to-one associations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToOneLoader;

impl AssociationLoader for ToOneLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let target = match ctx.target_model() {
                Ok(model) => model,
                Err(e) => return Outcome::Err(e),
            };

            let mut fanout = Fanout::new();
            fanout.assign_all(owners, desc.name, &AssociationValue::Absent);

            let index = index_owners(owners, desc.owner_key);
            tracing::info!(
                association = desc.name,
                owner_type = desc.owner,
                owner_count = owners.len(),
                key_count = index.len(),
                null_keys = index.skipped(),
                "Batch loading to-one association"
            );
            if index.is_empty() {
                return Outcome::Ok(fanout);
            }

            let query = ctx.scope(
                Query::from(target.table).filter(Expr::key_in(
                    key_columns(target.table, desc.target_key),
                    key_rows(&index),
                )),
                target.table,
            );
            let rows = try_fetch!(ctx, &query);

            let mut identity = IdentityMap::new();
            let mut matched = 0usize;
            for row in rows {
                let record = identity.materialize(target, row);
                let Some(key) = record.key_for(desc.target_key) else {
                    continue;
                };
                if let Some(bucket) = index.get(&key) {
                    for owner in bucket {
                        fanout.assign_first(owner, desc.name, &record);
                    }
                    matched += bucket.len();
                    fanout.add_target(&record);
                }
            }

            tracing::debug!(
                association = desc.name,
                query_count = 1,
                loaded = identity.len(),
                matched_owners = matched,
                "Batch load complete"
            );
            Outcome::Ok(fanout)
        })
    }
}

/// Default loader for to-many associations.
#[derive(Debug, Clone, Copy, Default)]
pub struct ToManyLoader;

impl AssociationLoader for ToManyLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let target = match ctx.target_model() {
                Ok(model) => model,
                Err(e) => return Outcome::Err(e),
            };

            let mut fanout = Fanout::new();
            fanout.assign_all(owners, desc.name, &AssociationValue::Many(Vec::new()));

            let index = index_owners(owners, desc.owner_key);
            tracing::info!(
                association = desc.name,
                owner_type = desc.owner,
                owner_count = owners.len(),
                key_count = index.len(),
                "Batch loading to-many association"
            );
            if index.is_empty() {
                return Outcome::Ok(fanout);
            }

            let query = ctx.scope(
                Query::from(target.table).filter(Expr::key_in(
                    key_columns(target.table, desc.target_key),
                    key_rows(&index),
                )),
                target.table,
            );
            let rows = try_fetch!(ctx, &query);

            let mut identity = IdentityMap::new();
            let row_count = rows.len();
            for row in rows {
                let child = identity.materialize(target, row);
                let Some(key) = child.key_for(desc.target_key) else {
                    continue;
                };
                let Some(bucket) = index.get(&key) else {
                    continue;
                };
                for owner in bucket {
                    fanout.append(owner, desc.name, &child);
                }
                if let (Some(reciprocal), Some(owner)) = (desc.reciprocal, bucket.first()) {
                    fanout.assign_back(&child, reciprocal, owner);
                }
                fanout.add_target(&child);
            }

            tracing::debug!(
                association = desc.name,
                query_count = 1,
                rows = row_count,
                "Batch load complete"
            );
            Outcome::Ok(fanout)
        })
    }
}

/// Default loader for many-to-many associations.
///
/// Joins the target table to the join table, projects the join table's
/// owner columns as `__owner_{i}` and filters on them, so one query returns
/// every (owner key, target) pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManyToManyLoader;

impl AssociationLoader for ManyToManyLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let target = match ctx.target_model() {
                Ok(model) => model,
                Err(e) => return Outcome::Err(e),
            };
            let Some(join) = desc.join_table else {
                return Outcome::Err(Error::config(
                    ConfigErrorKind::MissingJoinTable,
                    format!("{}.{} has no join table", desc.owner, desc.name),
                ));
            };

            let mut fanout = Fanout::new();
            fanout.assign_all(owners, desc.name, &AssociationValue::Many(Vec::new()));

            let index = index_owners(owners, desc.owner_key);
            tracing::info!(
                association = desc.name,
                owner_type = desc.owner,
                owner_count = owners.len(),
                key_count = index.len(),
                join_table = join.table,
                "Batch loading many-to-many association"
            );
            if index.is_empty() {
                return Outcome::Ok(fanout);
            }

            let on = join
                .target_columns
                .iter()
                .zip(desc.target_key)
                .map(|(jc, tc)| Expr::qualified(join.table, *jc).eq(Expr::qualified(target.table, *tc)));
            let Some(on) = Expr::all(on) else {
                return Outcome::Ok(fanout);
            };

            let mut query = Query::from(target.table).select_all_from(target.table);
            for (i, column) in join.owner_columns.iter().enumerate() {
                query = query.select_as(
                    Expr::qualified(join.table, *column),
                    format!("{OWNER_COLUMN_PREFIX}{i}"),
                );
            }
            let query = ctx.scope(
                query.join(Join::inner(join.table, on)).filter(Expr::key_in(
                    key_columns(join.table, join.owner_columns),
                    key_rows(&index),
                )),
                target.table,
            );
            let rows = try_fetch!(ctx, &query);

            let mut identity = IdentityMap::new();
            let row_count = rows.len();
            for row in rows {
                let (target_row, owner_values) = split_owner_columns(&row);
                let Some(owner_key) = Key::new(owner_values) else {
                    continue;
                };
                let Some(bucket) = index.get(&owner_key) else {
                    continue;
                };
                let record = identity.materialize(target, target_row);
                for owner in bucket {
                    fanout.append(owner, desc.name, &record);
                }
                fanout.add_target(&record);
            }

            tracing::debug!(
                association = desc.name,
                query_count = 1,
                rows = row_count,
                distinct_targets = identity.len(),
                "Batch load complete"
            );
            Outcome::Ok(fanout)
        })
    }
}
