//! Scalar associations computed with a grouped aggregate.

use crate::loader::{
    AssociationLoader, Fanout, LoadContext, OWNER_COLUMN_PREFIX, key_columns, key_rows,
    split_owner_columns, try_fetch,
};
use rowgraph_core::{AssociationValue, Key, KeyIndex, Outcome, RecordRef, Value};
use rowgraph_query::{BoxFuture, Expr, Query};

/// Aggregate function applied per owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregate {
    Count,
    Sum(&'static str),
    Min(&'static str),
    Max(&'static str),
    Avg(&'static str),
}

impl Aggregate {
    fn expr(&self, table: &str) -> Expr {
        match self {
            Aggregate::Count => Expr::count_star(),
            Aggregate::Sum(c) => Expr::qualified(table, *c).sum(),
            Aggregate::Min(c) => Expr::qualified(table, *c).min(),
            Aggregate::Max(c) => Expr::qualified(table, *c).max(),
            Aggregate::Avg(c) => Expr::qualified(table, *c).avg(),
        }
    }

    /// Value for owners with no matching rows.
    pub fn empty_value(&self) -> Value {
        match self {
            Aggregate::Count => Value::BigInt(0),
            _ => Value::Null,
        }
    }
}

/// Computes `aggregate` over target rows whose `foreign_key` references the
/// owner, one grouped query per invocation.
#[derive(Debug, Clone, Copy)]
pub struct AggregateLoader {
    pub aggregate: Aggregate,
    pub foreign_key: &'static [&'static str],
}

impl AggregateLoader {
    pub const fn new(aggregate: Aggregate, foreign_key: &'static [&'static str]) -> Self {
        Self {
            aggregate,
            foreign_key,
        }
    }
}

impl AssociationLoader for AggregateLoader {
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
            fanout.assign_all(
                owners,
                desc.name,
                &AssociationValue::Scalar(self.aggregate.empty_value()),
            );

            let index = KeyIndex::build(owners.iter().cloned(), |o| o.key_for(desc.owner_key));
            if index.is_empty() {
                return Outcome::Ok(fanout);
            }

            let mut query = Query::from(target.table);
            for (i, column) in self.foreign_key.iter().enumerate() {
                query = query
                    .select_as(
                        Expr::qualified(target.table, *column),
                        format!("{OWNER_COLUMN_PREFIX}{i}"),
                    )
                    .group_by(Expr::qualified(target.table, *column));
            }
            let query = ctx.scope(
                query
                    .select_as(self.aggregate.expr(target.table), "value")
                    .filter(Expr::key_in(
                        key_columns(target.table, self.foreign_key),
                        key_rows(&index),
                    )),
                target.table,
            );
            let rows = try_fetch!(ctx, &query);

            for row in &rows {
                let (values, owner_values) = split_owner_columns(row);
                let Some(key) = Key::new(owner_values) else {
                    continue;
                };
                let value = values.get_by_name("value").cloned().unwrap_or(Value::Null);
                if let Some(bucket) = index.get(&key) {
                    for owner in bucket {
                        fanout.assign(owner, desc.name, AssociationValue::Scalar(value.clone()));
                    }
                }
            }

            tracing::debug!(
                association = desc.name,
                query_count = 1,
                groups = rows.len(),
                "Aggregate load complete"
            );
            Outcome::Ok(fanout)
        })
    }
}
