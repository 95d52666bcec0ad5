//! Several candidate columns pointing at one owner key.
//!
//! A match row references two teams (`home_id`, `away_id`); a team's
//! `matches` are the rows where either column holds its key. With a through
//! table, the candidate columns live on the intermediate table and a further
//! column there references the target.

use crate::loader::{
    AssociationLoader, Fanout, IdentityMap, LoadContext, OWNER_COLUMN_PREFIX, split_owner_columns,
    try_fetch,
};
use rowgraph_core::error::ConfigErrorKind;
use rowgraph_core::{AssociationValue, Error, Key, KeyIndex, Outcome, RecordRef, Value};
use rowgraph_query::{BoxFuture, Expr, Join, Query};

/// Intermediate table for [`MultiKeyLoader::through`].
#[derive(Debug, Clone, Copy)]
pub struct Through {
    pub table: &'static str,
    /// Column on the intermediate table referencing the target key.
    pub target_column: &'static str,
}

/// Loads targets matching the owner key on any of several columns.
#[derive(Debug, Clone, Copy)]
pub struct MultiKeyLoader {
    pub candidates: &'static [&'static str],
    pub through: Option<Through>,
}

impl MultiKeyLoader {
    /// Candidate columns live on the target table.
    pub const fn direct(candidates: &'static [&'static str]) -> Self {
        Self {
            candidates,
            through: None,
        }
    }

    /// Candidate columns live on `table`, whose `target_column` references
    /// the target's key.
    pub const fn through(
        table: &'static str,
        candidates: &'static [&'static str],
        target_column: &'static str,
    ) -> Self {
        Self {
            candidates,
            through: Some(Through {
                table,
                target_column,
            }),
        }
    }
}

impl AssociationLoader for MultiKeyLoader {
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
            if desc.owner_key.len() != 1 || self.candidates.is_empty() {
                return Outcome::Err(Error::config(
                    ConfigErrorKind::KeyArity,
                    format!(
                        "{}.{}: multi-key associations need a single-column owner key and at least one candidate column",
                        desc.owner, desc.name
                    ),
                ));
            }

            let mut fanout = Fanout::new();
            fanout.assign_all(owners, desc.name, &AssociationValue::Many(Vec::new()));

            let index = KeyIndex::build(owners.iter().cloned(), |o| o.key_for(desc.owner_key));
            tracing::info!(
                association = desc.name,
                owner_count = owners.len(),
                key_count = index.len(),
                candidates = self.candidates.len(),
                "Batch loading multi-key association"
            );
            if index.is_empty() {
                return Outcome::Ok(fanout);
            }
            let keys: Vec<Value> = index
                .keys()
                .iter()
                .filter_map(|k| k.as_single().cloned())
                .collect();

            let mut query = Query::from(target.table).select_all_from(target.table);
            let candidate_table = match self.through {
                None => target.table,
                Some(through) => {
                    let Some(target_key) = desc.target_key.first() else {
                        return Outcome::Err(Error::config(
                            ConfigErrorKind::MissingKey,
                            format!("{}.{} has no target key", desc.owner, desc.name),
                        ));
                    };
                    query = query.join(Join::inner(
                        through.table,
                        Expr::qualified(through.table, through.target_column)
                            .eq(Expr::qualified(target.table, *target_key)),
                    ));
                    through.table
                }
            };
            for (i, column) in self.candidates.iter().enumerate() {
                query = query.select_as(
                    Expr::qualified(candidate_table, *column),
                    format!("{OWNER_COLUMN_PREFIX}{i}"),
                );
            }
            let any_candidate = Expr::any(
                self.candidates
                    .iter()
                    .map(|c| Expr::qualified(candidate_table, *c).in_list(keys.clone())),
            );
            if let Some(condition) = any_candidate {
                query = query.filter(condition);
            }
            let query = ctx.scope(query, target.table);
            let rows = try_fetch!(ctx, &query);

            let mut identity = IdentityMap::new();
            for row in rows {
                let (target_row, candidate_values) = split_owner_columns(&row);
                let record = identity.materialize(target, target_row);
                let mut matched = false;
                for value in candidate_values {
                    let Some(key) = Key::single(value) else {
                        continue;
                    };
                    if let Some(bucket) = index.get(&key) {
                        for owner in bucket {
                            fanout.append(owner, desc.name, &record);
                        }
                        matched = true;
                    }
                }
                if matched {
                    fanout.add_target(&record);
                }
            }

            tracing::debug!(
                association = desc.name,
                query_count = 1,
                loaded = identity.len(),
                "Batch load complete"
            );
            Outcome::Ok(fanout)
        })
    }
}
