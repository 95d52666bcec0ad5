//! Self-referential trees: ancestor chains and descendant fan-out.
//!
//! Both loaders walk one generation per query. A node whose parent key is
//! NULL, or equal to its own primary key, is a root; its key is never used
//! to look up a parent, so a self-parented root cannot loop.

use crate::loader::{
    AssociationLoader, Fanout, IdentityMap, LoadContext, key_columns, key_rows, try_fetch,
};
use rowgraph_core::{AssociationValue, Key, KeyIndex, ModelInfo, Outcome, Record, RecordRef};
use rowgraph_query::{BoxFuture, Expr, Query};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

fn ptr(record: &RecordRef) -> usize {
    Arc::as_ptr(record) as usize
}

fn node_model<'a>(ctx: &'a LoadContext<'a>) -> rowgraph_core::Result<&'a ModelInfo> {
    let desc = ctx.descriptor;
    ctx.registry.model(desc.target.unwrap_or(desc.owner))
}

/// The key a node points at, unless the node is a root.
fn parent_key(node: &RecordRef, columns: &[&str]) -> Option<Key> {
    let key = node.key_for(columns)?;
    match node.primary_key() {
        Some(own) if own == key => None,
        _ => Some(key),
    }
}

/// Loads every ancestor of each owner, nearest first.
///
/// The association's value is the ancestor list. When `parent` names the
/// direct-parent association, that slot is filled on every node visited,
/// with `Absent` for roots.
#[derive(Debug, Clone, Copy)]
pub struct AncestorsLoader {
    /// Columns on a node referencing its parent's primary key.
    pub parent_key: &'static [&'static str],
    /// Direct-parent association to fill along the way.
    pub parent: Option<&'static str>,
}

impl AncestorsLoader {
    pub const fn new(parent_key: &'static [&'static str]) -> Self {
        Self {
            parent_key,
            parent: None,
        }
    }

    #[must_use]
    pub const fn with_parent(mut self, association: &'static str) -> Self {
        self.parent = Some(association);
        self
    }
}

impl AssociationLoader for AncestorsLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let model = match node_model(ctx) {
                Ok(model) => model,
                Err(e) => return Outcome::Err(e),
            };

            let mut identity = IdentityMap::new();
            for owner in owners {
                identity.adopt(owner);
            }
            // node -> resolved parent (None for roots and dangling keys)
            let mut parents: HashMap<usize, Option<RecordRef>> = HashMap::new();
            let mut nodes: Vec<RecordRef> = Vec::new();
            let mut current: Vec<RecordRef> = rowgraph_core::dedup_records(owners.iter().cloned());
            let mut generations = 0usize;

            while !current.is_empty() {
                let mut pending = KeyIndex::new();
                for node in &current {
                    if parents.contains_key(&ptr(node)) {
                        continue;
                    }
                    nodes.push(Arc::clone(node));
                    match parent_key(node, self.parent_key) {
                        None => {
                            parents.insert(ptr(node), None);
                        }
                        Some(key) => match identity.get(model.name, &key) {
                            Some(known) => {
                                parents.insert(ptr(node), Some(Arc::clone(known)));
                            }
                            None => pending.insert(key, Arc::clone(node)),
                        },
                    }
                }
                if pending.is_empty() {
                    break;
                }

                let query = ctx.scope(
                    Query::from(model.table).filter(Expr::key_in(
                        key_columns(model.table, model.primary_key),
                        key_rows(&pending),
                    )),
                    model.table,
                );
                let rows = try_fetch!(ctx, &query);
                generations += 1;

                let mut next = Vec::new();
                for row in rows {
                    let record = identity.materialize(model, row);
                    let Some(key) = record.primary_key() else {
                        continue;
                    };
                    if let Some(children) = pending.get(&key) {
                        for child in children {
                            parents.insert(ptr(child), Some(Arc::clone(&record)));
                        }
                        next.push(record);
                    }
                }
                for (_, children) in pending.iter() {
                    for child in children {
                        parents.entry(ptr(child)).or_insert(None);
                    }
                }
                current = rowgraph_core::dedup_records(next);
            }

            let mut fanout = Fanout::new();
            if let Some(parent) = self.parent {
                for node in &nodes {
                    let value = match parents.get(&ptr(node)) {
                        Some(Some(p)) => AssociationValue::One(Arc::clone(p)),
                        _ => AssociationValue::Absent,
                    };
                    fanout.assign(node, parent, value);
                }
            }
            for owner in owners {
                let mut chain = Vec::new();
                let mut seen = HashSet::from([ptr(owner)]);
                let mut cursor = parents.get(&ptr(owner)).cloned().flatten();
                while let Some(ancestor) = cursor {
                    if !seen.insert(ptr(&ancestor)) {
                        break;
                    }
                    cursor = parents.get(&ptr(&ancestor)).cloned().flatten();
                    fanout.add_target(&ancestor);
                    chain.push(ancestor);
                }
                fanout.assign(owner, desc.name, AssociationValue::Many(chain));
            }

            tracing::debug!(
                association = desc.name,
                owner_count = owners.len(),
                query_count = generations,
                nodes = nodes.len(),
                "Ancestor chains loaded"
            );
            Outcome::Ok(fanout)
        })
    }
}

/// Loads every descendant of each owner, breadth first.
///
/// Rows whose parent key equals their own primary key are excluded both
/// from each generation's query and from the fan-out.
#[derive(Debug, Clone, Copy)]
pub struct DescendantsLoader {
    /// Columns on a node referencing its parent's primary key.
    pub child_key: &'static [&'static str],
    /// Direct-children association to fill along the way.
    pub children: Option<&'static str>,
    /// Direct-parent association to fill on every loaded child.
    pub parent: Option<&'static str>,
}

impl DescendantsLoader {
    pub const fn new(child_key: &'static [&'static str]) -> Self {
        Self {
            child_key,
            children: None,
            parent: None,
        }
    }

    #[must_use]
    pub const fn with_children(mut self, association: &'static str) -> Self {
        self.children = Some(association);
        self
    }

    #[must_use]
    pub const fn with_parent(mut self, association: &'static str) -> Self {
        self.parent = Some(association);
        self
    }
}

impl AssociationLoader for DescendantsLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let model = match node_model(ctx) {
                Ok(model) => model,
                Err(e) => return Outcome::Err(e),
            };
            if model.key_arity() != self.child_key.len() {
                return Outcome::Err(rowgraph_core::Error::config(
                    rowgraph_core::error::ConfigErrorKind::KeyArity,
                    format!(
                        "{}.{}: child key has {} column(s), primary key has {}",
                        desc.owner,
                        desc.name,
                        self.child_key.len(),
                        model.key_arity()
                    ),
                ));
            }

            let not_self_parented = Expr::all(
                self.child_key
                    .iter()
                    .zip(model.primary_key)
                    .map(|(c, p)| Expr::qualified(model.table, *c).eq(Expr::qualified(model.table, *p))),
            )
            .map(|same| same.paren().not());

            let mut identity = IdentityMap::new();
            let mut visited: HashSet<usize> = HashSet::new();
            for owner in owners {
                identity.adopt(owner);
                visited.insert(ptr(owner));
            }
            let mut children: HashMap<usize, Vec<RecordRef>> = HashMap::new();
            let mut nodes: Vec<RecordRef> = rowgraph_core::dedup_records(owners.iter().cloned());
            let mut frontier = nodes.clone();
            let mut generations = 0usize;

            loop {
                let index = KeyIndex::build(frontier.iter().cloned(), |n| n.primary_key());
                if index.is_empty() {
                    break;
                }
                let mut query = Query::from(model.table).filter(Expr::key_in(
                    key_columns(model.table, self.child_key),
                    key_rows(&index),
                ));
                if let Some(condition) = &not_self_parented {
                    query = query.filter(condition.clone());
                }
                let query = ctx.scope(query, model.table);
                let rows = try_fetch!(ctx, &query);
                generations += 1;

                let mut next = Vec::new();
                for row in rows {
                    let record = identity.materialize(model, row);
                    let Some(key) = record.key_for(self.child_key) else {
                        continue;
                    };
                    if record.primary_key().as_ref() == Some(&key) {
                        continue;
                    }
                    let Some(parents) = index.get(&key) else {
                        continue;
                    };
                    for parent in parents {
                        let list = children.entry(ptr(parent)).or_default();
                        if !list.iter().any(|c| Record::same(c, &record)) {
                            list.push(Arc::clone(&record));
                        }
                    }
                    if visited.insert(ptr(&record)) {
                        nodes.push(Arc::clone(&record));
                        next.push(record);
                    }
                }
                frontier = next;
            }

            let mut fanout = Fanout::new();
            for node in &nodes {
                let direct = children.get(&ptr(node)).cloned().unwrap_or_default();
                if let Some(parent) = self.parent {
                    for child in &direct {
                        fanout.assign_back(child, parent, node);
                    }
                }
                if let Some(name) = self.children {
                    fanout.assign(node, name, AssociationValue::Many(direct));
                }
            }
            for owner in owners {
                let mut all = Vec::new();
                let mut seen = HashSet::from([ptr(owner)]);
                let mut queue: std::collections::VecDeque<RecordRef> =
                    children.get(&ptr(owner)).cloned().unwrap_or_default().into();
                while let Some(node) = queue.pop_front() {
                    if !seen.insert(ptr(&node)) {
                        continue;
                    }
                    if let Some(grandchildren) = children.get(&ptr(&node)) {
                        queue.extend(grandchildren.iter().cloned());
                    }
                    fanout.add_target(&node);
                    all.push(node);
                }
                fanout.assign(owner, desc.name, AssociationValue::Many(all));
            }

            tracing::debug!(
                association = desc.name,
                owner_count = owners.len(),
                query_count = generations,
                nodes = nodes.len(),
                "Descendants loaded"
            );
            Outcome::Ok(fanout)
        })
    }
}
