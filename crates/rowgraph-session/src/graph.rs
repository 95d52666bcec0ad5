//! Graph-join eager loading.
//!
//! Instead of one query per association and level, a graph load issues a
//! single SELECT joining every requested hop. Each table is projected under
//! its alias as `alias__column`; after execution the rows are split by alias
//! and reassembled into the same association caches the per-query loaders
//! fill. Duplicate owner rows produced by to-many joins collapse onto one
//! record per primary key.
//!
//! The caller's filter and ordering may reference any joined alias. An
//! inner join drops owners with no match from the result, unlike
//! [`EagerLoadPlanner`](crate::EagerLoadPlanner), which never drops owners.
//!
//! Aliases default to the association name. When a name is already taken
//! (the root table, or the same association at another depth) the alias
//! becomes `name_0`, `name_1`, and so on.

use crate::association::{AssociationDescriptor, AssociationKind, GraphContext};
use crate::callbacks::CallbackDispatcher;
use crate::loader::{Fanout, IdentityMap};
use crate::registry::Registry;
use rowgraph_core::error::ConfigErrorKind;
use rowgraph_core::{
    ALIAS_SEPARATOR, Cx, Error, ModelInfo, Outcome, RecordRef, Result, Row,
    dedup_records,
};
use rowgraph_query::{
    Dataset, Dialect, EagerTree, Expr, Join, JoinCondition, OrderBy, Query, SelectItem,
};
use std::collections::HashSet;
use std::sync::Arc;

/// One table in a graph query.
#[derive(Debug, Clone)]
struct GraphNode {
    alias: String,
    model: ModelInfo,
    /// Index of the owning node; `None` for the root.
    parent: Option<usize>,
    descriptor: Option<Arc<AssociationDescriptor>>,
}

/// A built graph query plus what is needed to reassemble its rows.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    query: Query,
    nodes: Vec<GraphNode>,
}

impl GraphPlan {
    /// The joined query.
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Aliases in join order, root first.
    pub fn aliases(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.alias.as_str()).collect()
    }

    /// Alias chosen for the association reached by `path` (dot separated).
    pub fn alias_for(&self, path: &str) -> Option<&str> {
        let mut current = 0;
        for name in path.split('.').filter(|s| !s.is_empty()) {
            current = self.nodes.iter().position(|n| {
                n.parent == Some(current) && n.descriptor.as_ref().is_some_and(|d| d.name == name)
            })?;
        }
        Some(self.nodes[current].alias.as_str())
    }
}

/// Builds and runs graph-join loads.
pub struct GraphJoinBuilder<'a> {
    registry: &'a Registry,
    dispatcher: CallbackDispatcher,
    dialect: Dialect,
}

impl<'a> GraphJoinBuilder<'a> {
    pub fn new(registry: &'a Registry) -> Self {
        Self {
            registry,
            dispatcher: CallbackDispatcher::default(),
            dialect: Dialect::default(),
        }
    }

    #[must_use]
    pub fn with_dispatcher(mut self, dispatcher: CallbackDispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    #[must_use]
    pub fn with_dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Build the joined query for `root_type` and `tree`.
    ///
    /// `filter` and `order` are applied as given; reference joined tables by
    /// the aliases reported by [`GraphPlan::alias_for`].
    pub fn plan(
        &self,
        root_type: &str,
        tree: &EagerTree,
        filter: Option<Expr>,
        order: &[OrderBy],
    ) -> Result<GraphPlan> {
        let root = *self.registry.model(root_type)?;
        require_columns(&root)?;

        let mut used: HashSet<String> = HashSet::new();
        used.insert(root.table.to_string());
        let mut nodes = vec![GraphNode {
            alias: root.table.to_string(),
            model: root,
            parent: None,
            descriptor: None,
        }];
        let mut query = Query::from(root.table);
        project(&mut query, root.table, &root);
        let mut association_order = Vec::new();

        self.add_hops(&mut query, &mut nodes, &mut used, 0, tree, &mut association_order)?;

        if let Some(filter) = filter {
            query = query.filter(filter);
        }
        for o in order.iter().cloned().chain(association_order) {
            query = query.order_by(o);
        }

        tracing::trace!(
            root = root_type,
            aliases = ?nodes.iter().map(|n| n.alias.as_str()).collect::<Vec<_>>(),
            sql = %query.to_sql_with_dialect(self.dialect).0,
            "Built graph query"
        );
        Ok(GraphPlan { query, nodes })
    }

    fn add_hops(
        &self,
        query: &mut Query,
        nodes: &mut Vec<GraphNode>,
        used: &mut HashSet<String>,
        parent: usize,
        tree: &EagerTree,
        association_order: &mut Vec<OrderBy>,
    ) -> Result<()> {
        for entry in tree.entries() {
            let owner = nodes[parent].model;
            let desc = Arc::clone(self.registry.association(owner.name, &entry.name)?);
            if desc.is_custom() {
                return Err(Error::config(
                    ConfigErrorKind::Unsupported,
                    format!(
                        "association '{}.{}' uses a custom loader and cannot be graphed",
                        owner.name, desc.name
                    ),
                ));
            }
            let Some(target_name) = desc.target else {
                return Err(Error::config(
                    ConfigErrorKind::Unsupported,
                    format!("association '{}.{}' has no target type", owner.name, desc.name),
                ));
            };
            let target = *self.registry.model(target_name)?;
            require_columns(&target)?;

            let previous = nodes[parent].alias.clone();
            let alias = unique_alias(used, desc.graph_alias_name());
            let mut near = previous.clone();
            let mut near_columns: &[&str] = desc.owner_key;

            if let Some(jt) = desc.join_table {
                let jt_alias = unique_alias(used, &format!("{alias}_{}", jt.table));
                let on = key_equality(&jt_alias, jt.owner_columns, &previous, desc.owner_key)?;
                query
                    .joins
                    .push(Join::new(desc.graph.join_type, jt.table, on).alias(jt_alias.clone()));
                near = jt_alias;
                near_columns = jt.target_columns;
            }

            let condition = self.hop_condition(
                &desc,
                &alias,
                &near,
                near_columns,
                entry.filter.as_ref(),
                &query.joins,
            )?;
            query.joins.push(Join {
                join_type: desc.graph.join_type,
                table: target.table.to_string(),
                alias: Some(alias.clone()),
                condition,
            });
            project(query, &alias, &target);
            association_order.extend(desc.order_by.iter().map(|o| o.qualify(&alias)));

            nodes.push(GraphNode {
                alias,
                model: target,
                parent: Some(parent),
                descriptor: Some(desc),
            });
            let index = nodes.len() - 1;
            self.add_hops(query, nodes, used, index, &entry.nested, association_order)?;
        }
        Ok(())
    }

    /// Join condition for the hop reaching `alias` from `near`.
    fn hop_condition(
        &self,
        desc: &AssociationDescriptor,
        alias: &str,
        near: &str,
        near_columns: &[&str],
        entry_filter: Option<&Expr>,
        joins: &[Join],
    ) -> Result<JoinCondition> {
        let mut extras: Vec<Expr> = desc
            .graph
            .conditions
            .iter()
            .map(|(column, value)| Expr::qualified(alias, *column).eq(value.clone()))
            .collect();
        extras.extend(desc.filter.as_ref().map(|f| f.qualify(alias)));
        extras.extend(entry_filter.map(|f| f.qualify(alias)));
        if let Some(block) = &desc.graph.block {
            extras.push(block(&GraphContext {
                alias,
                previous: near,
                joins,
            }));
        }

        let base = match &desc.graph.only_conditions {
            Some(JoinCondition::On(expr)) => expr.clone(),
            Some(other) => {
                if !extras.is_empty() {
                    return Err(Error::config(
                        ConfigErrorKind::Unsupported,
                        format!(
                            "association '{}.{}' combines a USING/NATURAL/CROSS override with extra conditions",
                            desc.owner, desc.name
                        ),
                    ));
                }
                return Ok(other.clone());
            }
            None => key_equality(alias, desc.target_key, near, near_columns)?,
        };
        let all = std::iter::once(base).chain(extras);
        match Expr::all(all) {
            Some(expr) => Ok(JoinCondition::On(expr)),
            None => Ok(JoinCondition::None),
        }
    }

    /// Run `plan` and return its root records with caches filled.
    #[tracing::instrument(level = "debug", skip(self, cx, dataset, plan), fields(aliases = plan.nodes.len()))]
    pub async fn load(
        &self,
        cx: &Cx,
        dataset: &dyn Dataset,
        plan: &GraphPlan,
    ) -> Outcome<Vec<RecordRef>, Error> {
        let rows = match dataset.fetch(cx, &plan.query).await {
            Outcome::Ok(rows) => rows,
            Outcome::Err(e) => return Outcome::Err(e),
            Outcome::Cancelled(r) => return Outcome::Cancelled(r),
            Outcome::Panicked(p) => return Outcome::Panicked(p),
        };
        let row_count = rows.len();
        let roots = self.assemble(plan, rows);
        tracing::debug!(
            query_count = 1,
            rows = row_count,
            roots = roots.len(),
            "Graph load complete"
        );
        Outcome::Ok(roots)
    }

    /// Split `rows` by alias and rebuild the record graph.
    pub fn assemble(&self, plan: &GraphPlan, rows: Vec<Row>) -> Vec<RecordRef> {
        let nodes = &plan.nodes;
        // One identity map per hop: an instance never appears at two depths,
        // so cache links only point from a hop to its child hops.
        let mut identities: Vec<IdentityMap> =
            nodes.iter().map(|_| IdentityMap::new()).collect();
        let mut fanout = Fanout::new();
        let mut roots = Vec::new();
        let mut owners: Vec<Vec<RecordRef>> = vec![Vec::new(); nodes.len()];

        for row in rows {
            let present: Vec<Option<RecordRef>> = nodes
                .iter()
                .zip(identities.iter_mut())
                .map(|(node, identity)| {
                    let part = row.split_alias(&node.alias).filter(|r| !r.all_null())?;
                    let record = identity.materialize(&node.model, part);
                    record.primary_key().map(|_| record)
                })
                .collect();
            let Some(root) = &present[0] else {
                continue;
            };
            roots.push(Arc::clone(root));

            for (i, node) in nodes.iter().enumerate().skip(1) {
                let (Some(parent), Some(desc)) = (node.parent, &node.descriptor) else {
                    continue;
                };
                let Some(owner) = &present[parent] else {
                    continue;
                };
                if !fanout.is_assigned(owner, desc.name) {
                    fanout.assign(owner, desc.name, desc.default_value());
                    owners[i].push(Arc::clone(owner));
                }
                let Some(child) = &present[i] else {
                    continue;
                };
                if desc.kind.is_collection() {
                    fanout.append(owner, desc.name, child);
                } else {
                    fanout.assign_first(owner, desc.name, child);
                }
                if desc.kind == AssociationKind::ToMany {
                    if let Some(back) = desc.reciprocal {
                        fanout.assign_back(child, back, owner);
                    }
                }
            }
        }

        fanout.apply();
        for (node, node_owners) in nodes.iter().zip(&owners) {
            let Some(desc) = &node.descriptor else {
                continue;
            };
            if desc.callbacks.after_load.is_empty() {
                continue;
            }
            for owner in node_owners {
                if let Some(value) = owner.association(desc.name) {
                    self.dispatcher.after_load(desc, owner, &value);
                }
            }
        }
        dedup_records(roots)
    }
}

fn require_columns(model: &ModelInfo) -> Result<()> {
    if model.columns.is_empty() {
        return Err(Error::config(
            ConfigErrorKind::Unsupported,
            format!(
                "type '{}' declares no columns to project in a graph join",
                model.name
            ),
        ));
    }
    Ok(())
}

fn project(query: &mut Query, alias: &str, model: &ModelInfo) {
    for column in model.columns {
        query.columns.push(SelectItem::aliased(
            Expr::qualified(alias, *column),
            format!("{alias}{ALIAS_SEPARATOR}{column}"),
        ));
    }
}

fn unique_alias(used: &mut HashSet<String>, wanted: &str) -> String {
    let mut alias = wanted.to_string();
    let mut n = 0;
    while used.contains(&alias) {
        alias = format!("{wanted}_{n}");
        n += 1;
    }
    used.insert(alias.clone());
    alias
}

fn key_equality(left: &str, left_cols: &[&str], right: &str, right_cols: &[&str]) -> Result<Expr> {
    let pairs = left_cols
        .iter()
        .zip(right_cols)
        .map(|(l, r)| Expr::qualified(left, *l).eq(Expr::qualified(right, *r)));
    match Expr::all(pairs) {
        Some(expr) if left_cols.len() == right_cols.len() => Ok(expr),
        _ => Err(Error::config(
            ConfigErrorKind::KeyArity,
            format!("cannot join {left}({}) to {right}({})", left_cols.join(", "), right_cols.join(", ")),
        )),
    }
}
