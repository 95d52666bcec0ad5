//! Loading patterns built on the custom loader hook.
//!
//! Each pattern is an [`AssociationLoader`](crate::AssociationLoader) that
//! plugs into a descriptor via
//! [`AssociationDescriptor::custom`](crate::AssociationDescriptor::custom) or
//! [`AssociationDescriptor::loader`](crate::AssociationDescriptor::loader):
//!
//! - [`PolymorphicLoader`]: one query per distinct target type present
//! - [`AncestorsLoader`] / [`DescendantsLoader`]: one query per generation
//! - [`MultiKeyLoader`]: several candidate columns, one owner key
//! - [`AggregateLoader`]: grouped aggregate exposed as a scalar

pub mod aggregate;
pub mod multikey;
pub mod polymorphic;
pub mod tree;

pub use aggregate::{Aggregate, AggregateLoader};
pub use multikey::{MultiKeyLoader, Through};
pub use polymorphic::PolymorphicLoader;
pub use tree::{AncestorsLoader, DescendantsLoader};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationDescriptor, AssociationKind};
    use crate::loader::{Fanout, LoadContext};
    use crate::registry::Registry;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::{Cx, Error, ModelInfo, Outcome, Record, RecordRef, Value};
    use rowgraph_query::{Dataset, MemoryDataset};
    use std::sync::Arc;

    const NODE: ModelInfo = ModelInfo::new("node", "nodes");
    const COMMENT: ModelInfo = ModelInfo::new("comment", "comments");
    const ALBUM: ModelInfo = ModelInfo::new("album", "albums");
    const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");
    const TEAM: ModelInfo = ModelInfo::new("team", "teams");
    const GAME: ModelInfo = ModelInfo::new("game", "games");
    const PLAYER: ModelInfo = ModelInfo::new("player", "players");

    fn registry() -> Registry {
        let mut r = Registry::new();
        r.register(NODE)
            .register(COMMENT)
            .register(ALBUM)
            .register(ARTIST)
            .register(TEAM)
            .register(GAME)
            .register(PLAYER);
        r.associate("node", AssociationDescriptor::to_one("parent", "node", &["parent_id"]))
            .unwrap();
        r.associate(
            "node",
            AssociationDescriptor::custom(
                "ancestors",
                AssociationKind::ToMany,
                AncestorsLoader::new(&["parent_id"]).with_parent("parent"),
            )
            .target("node"),
        )
        .unwrap();
        r.associate(
            "node",
            AssociationDescriptor::custom(
                "descendants",
                AssociationKind::ToMany,
                DescendantsLoader::new(&["parent_id"]).with_children("children"),
            )
            .target("node"),
        )
        .unwrap();
        r.associate(
            "node",
            AssociationDescriptor::custom(
                "subtree",
                AssociationKind::ToMany,
                DescendantsLoader::new(&["parent_id"])
                    .with_children("children")
                    .with_parent("parent"),
            )
            .target("node"),
        )
        .unwrap();
        r.polymorphic("commentable", [("Album", "album"), ("Artist", "artist")]);
        r.associate(
            "comment",
            AssociationDescriptor::custom(
                "subject",
                AssociationKind::ToOne,
                PolymorphicLoader::new("commentable", "subject_type", &["subject_id"]),
            ),
        )
        .unwrap();
        r.associate(
            "team",
            AssociationDescriptor::custom(
                "games",
                AssociationKind::ToMany,
                MultiKeyLoader::direct(&["home_id", "away_id"]),
            )
            .target("game"),
        )
        .unwrap();
        r.associate(
            "team",
            AssociationDescriptor::custom(
                "opponents",
                AssociationKind::ToMany,
                MultiKeyLoader::through("games", &["home_id", "away_id"], "mvp_id"),
            )
            .target("player"),
        )
        .unwrap();
        r.associate(
            "artist",
            AssociationDescriptor::aggregate(
                "album_count",
                "album",
                AggregateLoader::new(Aggregate::Count, &["artist_id"]),
            ),
        )
        .unwrap();
        r.associate(
            "artist",
            AssociationDescriptor::aggregate(
                "best_rating",
                "album",
                AggregateLoader::new(Aggregate::Max("rating"), &["artist_id"]),
            ),
        )
        .unwrap();
        r
    }

    fn dataset() -> MemoryDataset {
        let ds = MemoryDataset::new();
        // 1 <- 2 <- 3 <- 4, and a self-parented root 10 <- 11 <- 12.
        for (id, parent) in [
            (1_i64, None),
            (2, Some(1_i64)),
            (3, Some(2)),
            (4, Some(3)),
            (10, Some(10)),
            (11, Some(10)),
            (12, Some(11)),
        ] {
            ds.insert_pairs("nodes", [("id", Value::BigInt(id)), ("parent_id", parent.into())]);
        }
        ds.insert_pairs("artists", [("id", 1_i64)]);
        ds.insert_pairs("artists", [("id", 2_i64)]);
        for (id, artist, rating) in [(20_i64, 1_i64, 3_i64), (21, 1, 5)] {
            ds.insert_pairs(
                "albums",
                [("id", id), ("artist_id", artist), ("rating", rating)],
            );
        }
        for (id, kind, subject) in [(1_i64, "Album", 20_i64), (2, "Artist", 1), (3, "Album", 20)] {
            ds.insert_pairs(
                "comments",
                [
                    ("id", Value::BigInt(id)),
                    ("subject_type", Value::from(kind)),
                    ("subject_id", Value::BigInt(subject)),
                ],
            );
        }
        for id in [1_i64, 2, 3] {
            ds.insert_pairs("teams", [("id", id)]);
        }
        for (id, home, away, mvp) in [(100_i64, 1_i64, 2_i64, 7_i64), (101, 2, 1, 8), (102, 1, 1, 7)] {
            ds.insert_pairs(
                "games",
                [("id", id), ("home_id", home), ("away_id", away), ("mvp_id", mvp)],
            );
        }
        ds.insert_pairs("players", [("id", 7_i64)]);
        ds.insert_pairs("players", [("id", 8_i64)]);
        ds
    }

    fn run(
        registry: &Registry,
        ds: &MemoryDataset,
        owner: &str,
        name: &str,
        owners: &[RecordRef],
    ) -> Outcome<usize, Error> {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let desc = registry.association(owner, name).unwrap();
        let dataset: &dyn Dataset = ds;
        rt.block_on(async {
            let ctx = LoadContext::new(&cx, dataset, registry, desc);
            match desc.resolver().load(&ctx, owners).await {
                Outcome::Ok(fanout) => {
                    let fanout: Fanout = fanout;
                    fanout.apply();
                    Outcome::Ok(ctx.query_count())
                }
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        })
    }

    fn queries(outcome: Outcome<usize, Error>) -> usize {
        match outcome {
            Outcome::Ok(n) => n,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn node(id: i64, parent: Option<i64>) -> RecordRef {
        Record::from_pairs(NODE, [("id", Value::BigInt(id)), ("parent_id", parent.into())])
    }

    fn ids(records: &[RecordRef]) -> Vec<i64> {
        records
            .iter()
            .map(|r| r.value("id").as_i64().unwrap_or(-1))
            .collect()
    }

    #[test]
    fn test_ancestor_chain_one_query_per_generation() {
        let (registry, ds) = (registry(), dataset());
        let leaf = node(4, Some(3));
        let n = queries(run(&registry, &ds, "node", "ancestors", &[leaf.clone()]));
        assert_eq!(n, 3);

        let chain = leaf.association("ancestors").unwrap();
        let chain = chain.as_many().unwrap();
        assert_eq!(ids(chain), vec![3, 2, 1]);

        // Direct parent slots are filled along the chain; only the root is absent.
        assert_eq!(ids(&leaf.association("parent").unwrap().records()), vec![3]);
        assert_eq!(ids(&chain[0].association("parent").unwrap().records()), vec![2]);
        assert_eq!(ids(&chain[1].association("parent").unwrap().records()), vec![1]);
        assert!(chain[2].association("parent").unwrap().is_absent());
    }

    #[test]
    fn test_self_referencing_root_has_no_ancestors() {
        let (registry, ds) = (registry(), dataset());
        let root = node(10, Some(10));
        let n = queries(run(&registry, &ds, "node", "ancestors", &[root.clone()]));
        assert_eq!(n, 0);
        assert!(root.association("ancestors").unwrap().as_many().unwrap().is_empty());
        assert!(root.association("parent").unwrap().is_absent());
    }

    #[test]
    fn test_descendants_of_self_parented_root_terminate() {
        let (registry, ds) = (registry(), dataset());
        let root = node(10, Some(10));
        let n = queries(run(&registry, &ds, "node", "descendants", &[root.clone()]));
        // Two generations plus the final empty one.
        assert_eq!(n, 3);

        let all = root.association("descendants").unwrap();
        assert_eq!(ids(all.as_many().unwrap()), vec![11, 12]);
        let children = root.association("children").unwrap();
        assert_eq!(ids(children.as_many().unwrap()), vec![11]);
        let leaf = &all.as_many().unwrap()[1];
        assert!(leaf.association("children").unwrap().as_many().unwrap().is_empty());
    }

    #[test]
    fn test_descendant_parent_links_do_not_keep_nodes_alive() {
        let (registry, ds) = (registry(), dataset());
        let root = node(10, Some(10));
        queries(run(&registry, &ds, "node", "subtree", &[root.clone()]));

        let all = root.association("subtree").unwrap().records();
        assert_eq!(ids(&all), vec![11, 12]);
        assert!(Record::same(
            all[0].association("parent").unwrap().as_one().unwrap(),
            &root
        ));
        assert!(Record::same(
            all[1].association("parent").unwrap().as_one().unwrap(),
            &all[0]
        ));

        let weak = Arc::downgrade(&root);
        drop(root);
        assert!(weak.upgrade().is_none());
        assert!(!all[0].is_loaded("parent"));
        assert!(all[1].is_loaded("parent"));
    }

    #[test]
    fn test_polymorphic_one_query_per_type() {
        let (registry, ds) = (registry(), dataset());
        let comments: Vec<RecordRef> = ds
            .execute(&rowgraph_query::Query::from("comments"))
            .unwrap()
            .into_iter()
            .map(|row| Record::new(COMMENT, row))
            .collect();
        let n = queries(run(&registry, &ds, "comment", "subject", &comments));
        assert_eq!(n, 2);

        let first = comments[0].association("subject").unwrap();
        let third = comments[2].association("subject").unwrap();
        assert_eq!(first.as_one().unwrap().type_name(), "album");
        assert!(Record::same(first.as_one().unwrap(), third.as_one().unwrap()));
        let second = comments[1].association("subject").unwrap();
        assert_eq!(second.as_one().unwrap().type_name(), "artist");
    }

    #[test]
    fn test_polymorphic_unknown_discriminator() {
        let (registry, ds) = (registry(), dataset());
        let comment = Record::from_pairs(
            COMMENT,
            [
                ("id", Value::BigInt(9)),
                ("subject_type", Value::from("Gig")),
                ("subject_id", Value::BigInt(1)),
            ],
        );
        match run(&registry, &ds, "comment", "subject", &[comment.clone()]) {
            Outcome::Err(Error::Association(e)) => {
                assert_eq!(
                    e.kind,
                    rowgraph_core::error::AssociationErrorKind::UnknownPolymorphicType
                );
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!comment.is_loaded("subject"));
    }

    #[test]
    fn test_multi_key_direct_dedups_per_owner() {
        let (registry, ds) = (registry(), dataset());
        let teams: Vec<_> = [1_i64, 2, 3]
            .into_iter()
            .map(|id| Record::from_pairs(TEAM, [("id", id)]))
            .collect();
        let n = queries(run(&registry, &ds, "team", "games", &teams));
        assert_eq!(n, 1);

        // Game 102 has team 1 on both sides but appears once.
        assert_eq!(
            ids(teams[0].association("games").unwrap().as_many().unwrap()),
            vec![100, 101, 102]
        );
        assert_eq!(
            ids(teams[1].association("games").unwrap().as_many().unwrap()),
            vec![100, 101]
        );
        assert!(teams[2].association("games").unwrap().as_many().unwrap().is_empty());
    }

    #[test]
    fn test_multi_key_through_table() {
        let (registry, ds) = (registry(), dataset());
        let teams: Vec<_> = [1_i64, 2]
            .into_iter()
            .map(|id| Record::from_pairs(TEAM, [("id", id)]))
            .collect();
        let n = queries(run(&registry, &ds, "team", "opponents", &teams));
        assert_eq!(n, 1);

        let first = teams[0].association("opponents").unwrap();
        let mut first_ids = ids(first.as_many().unwrap());
        first_ids.sort_unstable();
        assert_eq!(first_ids, vec![7, 8]);
        let second = teams[1].association("opponents").unwrap();
        let mut second_ids = ids(second.as_many().unwrap());
        second_ids.sort_unstable();
        assert_eq!(second_ids, vec![7, 8]);
    }

    #[test]
    fn test_aggregates() {
        let (registry, ds) = (registry(), dataset());
        let artists: Vec<_> = [1_i64, 2]
            .into_iter()
            .map(|id| Record::from_pairs(ARTIST, [("id", id)]))
            .collect();
        assert_eq!(queries(run(&registry, &ds, "artist", "album_count", &artists)), 1);
        assert_eq!(queries(run(&registry, &ds, "artist", "best_rating", &artists)), 1);

        let count = |r: &RecordRef| r.association("album_count").unwrap().as_scalar().cloned();
        assert_eq!(count(&artists[0]), Some(Value::BigInt(2)));
        assert_eq!(count(&artists[1]), Some(Value::BigInt(0)));
        let best = artists[0].association("best_rating").unwrap();
        assert_eq!(best.as_scalar().and_then(Value::as_i64), Some(5));
        assert!(artists[1].association("best_rating").unwrap().as_scalar().unwrap().is_null());

        let desc = registry.association("artist", "album_count").unwrap();
        assert!(desc.read_only);
    }
}
