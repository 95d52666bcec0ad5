//! Adapter for user-supplied loading strategies.
//!
//! A strategy is any function with the loader signature. [`CustomLoader`]
//! wraps it so the loader contract holds regardless of what the strategy
//! does: owners it left untouched get the association's default value, and
//! its errors propagate unchanged.
//!
//! ```ignore
//! fn featured<'a>(ctx: &'a LoadContext<'a>, owners: &'a [RecordRef]) -> BoxFuture<'a, Fanout> {
//!     Box::pin(async move { /* one query, stage results */ })
//! }
//!
//! AssociationDescriptor::to_many("featured", "album", &["artist_id"])
//!     .loader(CustomLoader::from_fn(featured));
//! ```

use crate::loader::{AssociationLoader, Fanout, LoadContext};
use rowgraph_core::{Outcome, RecordRef};
use rowgraph_query::BoxFuture;
use std::fmt;

/// Strategy signature accepted by [`CustomLoader::from_fn`].
pub type LoadStrategy =
    for<'a> fn(&'a LoadContext<'a>, &'a [RecordRef]) -> BoxFuture<'a, Fanout>;

/// Wraps a loading strategy and fills in defaults for unassigned owners.
pub struct CustomLoader {
    name: &'static str,
    inner: Box<dyn AssociationLoader>,
}

struct FnLoader(LoadStrategy);

impl AssociationLoader for FnLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        (self.0)(ctx, owners)
    }
}

impl CustomLoader {
    /// Wrap a strategy function.
    pub fn from_fn(strategy: LoadStrategy) -> Self {
        Self {
            name: "fn",
            inner: Box::new(FnLoader(strategy)),
        }
    }

    /// Wrap another loader.
    pub fn wrap(name: &'static str, loader: impl AssociationLoader + 'static) -> Self {
        Self {
            name,
            inner: Box::new(loader),
        }
    }
}

impl fmt::Debug for CustomLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CustomLoader")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl AssociationLoader for CustomLoader {
    fn load<'a>(
        &'a self,
        ctx: &'a LoadContext<'a>,
        owners: &'a [RecordRef],
    ) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let desc = ctx.descriptor;
            tracing::debug!(
                association = desc.name,
                owner_type = desc.owner,
                owner_count = owners.len(),
                strategy = self.name,
                "Running custom loader"
            );

            let mut fanout = match self.inner.load(ctx, owners).await {
                Outcome::Ok(fanout) => fanout,
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            };

            let default = desc.default_value();
            let mut defaulted = 0usize;
            for owner in owners {
                if !fanout.is_assigned(owner, desc.name) {
                    fanout.assign(owner, desc.name, default.clone());
                    defaulted += 1;
                }
            }
            if defaulted > 0 {
                tracing::trace!(
                    association = desc.name,
                    defaulted,
                    "Custom loader left owners unassigned"
                );
            }
            Outcome::Ok(fanout)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationDescriptor, AssociationKind};
    use crate::registry::Registry;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::{AssociationValue, Cx, Error, ModelInfo, Record};
    use rowgraph_query::MemoryDataset;

    const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");

    fn only_first<'a>(ctx: &'a LoadContext<'a>, owners: &'a [RecordRef]) -> BoxFuture<'a, Fanout> {
        Box::pin(async move {
            let mut fanout = Fanout::new();
            if let Some(first) = owners.first() {
                fanout.assign(
                    first,
                    ctx.descriptor.name,
                    AssociationValue::Scalar(rowgraph_core::Value::BigInt(7)),
                );
            }
            Outcome::Ok(fanout)
        })
    }

    fn failing<'a>(_ctx: &'a LoadContext<'a>, _owners: &'a [RecordRef]) -> BoxFuture<'a, Fanout> {
        Box::pin(async move { Outcome::Err(Error::Custom("strategy failed".into())) })
    }

    fn registry(strategy: LoadStrategy) -> Registry {
        let mut registry = Registry::new();
        registry.register(ARTIST);
        registry
            .associate(
                "artist",
                AssociationDescriptor::custom(
                    "score",
                    AssociationKind::Scalar,
                    CustomLoader::from_fn(strategy),
                ),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_unassigned_owners_get_default() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = MemoryDataset::new();
        let registry = registry(only_first);
        let desc = registry.association("artist", "score").unwrap();
        let owners: Vec<_> = [1_i64, 2]
            .into_iter()
            .map(|id| Record::from_pairs(ARTIST, [("id", id)]))
            .collect();

        rt.block_on(async {
            let ctx = LoadContext::new(&cx, &ds, &registry, desc);
            match desc.resolver().load(&ctx, &owners).await {
                Outcome::Ok(fanout) => {
                    fanout.apply();
                }
                other => panic!("unexpected outcome: {other:?}"),
            }
        });

        let first = owners[0].association("score").unwrap();
        assert_eq!(first.as_scalar(), Some(&rowgraph_core::Value::BigInt(7)));
        let second = owners[1].association("score").unwrap();
        assert_eq!(second.as_scalar(), Some(&rowgraph_core::Value::Null));
    }

    #[test]
    fn test_strategy_error_propagates_unchanged() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = MemoryDataset::new();
        let registry = registry(failing);
        let desc = registry.association("artist", "score").unwrap();
        let owners = vec![Record::from_pairs(ARTIST, [("id", 1_i64)])];

        rt.block_on(async {
            let ctx = LoadContext::new(&cx, &ds, &registry, desc);
            match desc.resolver().load(&ctx, &owners).await {
                Outcome::Err(Error::Custom(msg)) => assert_eq!(msg, "strategy failed"),
                other => panic!("unexpected outcome: {other:?}"),
            }
        });
        assert!(!owners[0].is_loaded("score"));
    }
}
