//! Polymorphic to-one associations.
//!
//! The owner stores a discriminator column naming the target type and key
//! columns pointing at that type's primary key. Owners are partitioned by
//! discriminator and each distinct type present is fetched with one query.

use crate::loader::{
    AssociationLoader, Fanout, IdentityMap, LoadContext, key_columns, key_rows, try_fetch,
};
use rowgraph_core::error::AssociationErrorKind;
use rowgraph_core::{AssociationValue, Error, KeyIndex, ModelInfo, Outcome, RecordRef};
use rowgraph_query::{BoxFuture, Expr, Query};

/// Loads a to-one association whose target type is chosen per owner.
#[derive(Debug, Clone, Copy)]
pub struct PolymorphicLoader {
    /// Name of the registry type table mapping discriminators to types.
    pub types: &'static str,
    /// Owner column holding the discriminator.
    pub type_column: &'static str,
    /// Owner columns holding the target key.
    pub key_columns: &'static [&'static str],
}

impl PolymorphicLoader {
    pub const fn new(
        types: &'static str,
        type_column: &'static str,
        key_columns: &'static [&'static str],
    ) -> Self {
        Self {
            types,
            type_column,
            key_columns,
        }
    }
}

impl AssociationLoader for PolymorphicLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            let mut fanout = Fanout::new();
            fanout.assign_all(owners, desc.name, &AssociationValue::Absent);

            // Partition owners by resolved target type, in first-seen order.
            let mut groups: Vec<(&ModelInfo, Vec<RecordRef>)> = Vec::new();
            for owner in owners {
                let discriminator = owner.value(self.type_column);
                if discriminator.is_null() {
                    continue;
                }
                let model = match ctx.registry.resolve_polymorphic(
                    self.types,
                    &discriminator,
                    desc.owner,
                    desc.name,
                ) {
                    Ok(model) => model,
                    Err(e) => return Outcome::Err(e),
                };
                if model.key_arity() != self.key_columns.len() {
                    return Outcome::Err(Error::association(
                        AssociationErrorKind::InvalidTarget,
                        desc.owner,
                        desc.name,
                        format!(
                            "type '{}' has a {}-column key, the association stores {}",
                            model.name,
                            model.key_arity(),
                            self.key_columns.len()
                        ),
                    ));
                }
                match groups.iter_mut().find(|(m, _)| m.name == model.name) {
                    Some((_, members)) => members.push(owner.clone()),
                    None => groups.push((model, vec![owner.clone()])),
                }
            }

            tracing::info!(
                association = desc.name,
                owner_count = owners.len(),
                type_count = groups.len(),
                "Batch loading polymorphic association"
            );

            for (model, members) in groups {
                let index = KeyIndex::build(members, |o| o.key_for(self.key_columns));
                if index.is_empty() {
                    continue;
                }
                let query = ctx.scope(
                    Query::from(model.table).filter(Expr::key_in(
                        key_columns(model.table, model.primary_key),
                        key_rows(&index),
                    )),
                    model.table,
                );
                let rows = try_fetch!(ctx, &query);

                let mut identity = IdentityMap::new();
                for row in rows {
                    let record = identity.materialize(model, row);
                    let Some(key) = record.primary_key() else {
                        continue;
                    };
                    if let Some(bucket) = index.get(&key) {
                        for owner in bucket {
                            fanout.assign_first(owner, desc.name, &record);
                        }
                        fanout.add_target(&record);
                    }
                }
                tracing::debug!(
                    association = desc.name,
                    target_type = model.name,
                    loaded = identity.len(),
                    "Polymorphic group loaded"
                );
            }

            Outcome::Ok(fanout)
        })
    }
}
