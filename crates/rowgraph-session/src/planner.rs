//! Level-by-level eager loading.
//!
//! The planner walks an [`EagerTree`] breadth first. At each level the
//! owners are grouped by type and every requested association is resolved
//! by its loader (custom loader first, else the default for its shape). The
//! targets loaded for an association, deduplicated, become the owners of
//! that association's nested request. The walk stops when a level has no
//! owners or no requests left.
//!
//! Fan-outs are staged and applied together after the last level, followed
//! by the after-load hooks. If any loader fails the call returns its error
//! and no cache is touched.

use crate::association::AssociationDescriptor;
use crate::callbacks::CallbackDispatcher;
use crate::loader::{Fanout, LoadContext};
use crate::registry::Registry;
use rowgraph_core::{Cx, Error, Outcome, RecordRef, Result, dedup_records};
use rowgraph_query::{Dataset, Dialect, EagerTree};
use std::collections::VecDeque;
use std::sync::Arc;

/// What an eager load did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LoadReport {
    /// Queries issued.
    pub queries: usize,
    /// Levels visited (0 when nothing was requested).
    pub levels: usize,
    /// Association slots written.
    pub loaded: usize,
}

struct Staged {
    descriptor: Arc<AssociationDescriptor>,
    owners: Vec<RecordRef>,
    fanout: Fanout,
}

/// Runs eager loads for one session call.
pub struct EagerLoadPlanner<'a> {
    cx: &'a Cx,
    dataset: &'a dyn Dataset,
    registry: &'a Registry,
    dispatcher: CallbackDispatcher,
    dialect: Dialect,
}

impl<'a> EagerLoadPlanner<'a> {
    pub fn new(cx: &'a Cx, dataset: &'a dyn Dataset, registry: &'a Registry) -> Self {
        Self {
            cx,
            dataset,
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

    /// Check every statically reachable association name in `tree`.
    ///
    /// Associations whose target type is only known at load time
    /// (polymorphic) stop the static walk; their nested requests are checked
    /// when their owners are known.
    pub fn validate(&self, owner_type: &str, tree: &EagerTree) -> Result<()> {
        for entry in tree.entries() {
            let desc = self.registry.association(owner_type, &entry.name)?;
            if let Some(target) = desc.target {
                self.validate(target, &entry.nested)?;
            }
        }
        Ok(())
    }

    /// Resolve `tree` for `roots`.
    #[tracing::instrument(level = "debug", skip(self, roots, tree), fields(roots = roots.len(), depth = tree.depth()))]
    pub async fn load(&self, roots: &[RecordRef], tree: &EagerTree) -> Outcome<LoadReport, Error> {
        let mut root_types: Vec<&'static str> = Vec::new();
        for root in roots {
            if !root_types.contains(&root.type_name()) {
                root_types.push(root.type_name());
            }
        }
        for owner_type in &root_types {
            if let Err(e) = self.validate(owner_type, tree) {
                return Outcome::Err(e);
            }
        }

        let mut report = LoadReport::default();
        let mut staged: Vec<Staged> = Vec::new();
        let mut queue: VecDeque<(usize, Vec<RecordRef>, &EagerTree)> = VecDeque::new();
        queue.push_back((1, dedup_records(roots.iter().cloned()), tree));

        while let Some((level, owners, subtree)) = queue.pop_front() {
            if owners.is_empty() || subtree.is_empty() {
                continue;
            }
            report.levels = report.levels.max(level);

            for entry in subtree.entries() {
                let mut next_owners = Vec::new();
                for (owner_type, group) in group_by_type(&owners) {
                    let descriptor = match self.registry.association(owner_type, &entry.name) {
                        Ok(desc) => Arc::clone(desc),
                        Err(e) => return Outcome::Err(e),
                    };
                    let ctx = LoadContext::new(self.cx, self.dataset, self.registry, &descriptor)
                        .with_filter(entry.filter.as_ref())
                        .with_dialect(self.dialect);
                    let fanout = match descriptor.resolver().load(&ctx, &group).await {
                        Outcome::Ok(fanout) => fanout,
                        Outcome::Err(e) => {
                            tracing::debug!(
                                association = descriptor.name,
                                owner_type = owner_type,
                                level = level,
                                error = %e,
                                "Eager load aborted"
                            );
                            return Outcome::Err(e);
                        }
                        Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                        Outcome::Panicked(p) => return Outcome::Panicked(p),
                    };
                    report.queries += ctx.query_count();
                    if !entry.nested.is_empty() {
                        next_owners.extend(fanout.targets());
                    }
                    drop(ctx);
                    staged.push(Staged {
                        descriptor,
                        owners: group,
                        fanout,
                    });
                }
                let next_owners = dedup_records(next_owners);
                if !next_owners.is_empty() {
                    queue.push_back((level + 1, next_owners, &entry.nested));
                }
            }
        }

        for stage in &mut staged {
            report.loaded += std::mem::take(&mut stage.fanout).apply();
        }
        for stage in &staged {
            if stage.descriptor.callbacks.after_load.is_empty() {
                continue;
            }
            for owner in &stage.owners {
                if let Some(value) = owner.association(stage.descriptor.name) {
                    self.dispatcher.after_load(&stage.descriptor, owner, &value);
                }
            }
        }

        tracing::debug!(
            query_count = report.queries,
            levels = report.levels,
            loaded = report.loaded,
            "Eager load complete"
        );
        Outcome::Ok(report)
    }
}

/// Split owners by record type, keeping first-seen order.
fn group_by_type(owners: &[RecordRef]) -> Vec<(&'static str, Vec<RecordRef>)> {
    let mut groups: Vec<(&'static str, Vec<RecordRef>)> = Vec::new();
    for owner in owners {
        let name = owner.type_name();
        match groups.iter_mut().find(|(t, _)| *t == name) {
            Some((_, members)) => members.push(Arc::clone(owner)),
            None => groups.push((name, vec![Arc::clone(owner)])),
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::{AssociationDescriptor, AssociationKind, JoinTable};
    use crate::patterns::PolymorphicLoader;
    use asupersync::runtime::RuntimeBuilder;
    use rowgraph_core::error::ConfigErrorKind;
    use rowgraph_core::{AssociationValue, ModelInfo, Record, Value};
    use rowgraph_query::{Expr, MemoryDataset};
    use std::sync::Mutex;

    const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");
    const ALBUM: ModelInfo = ModelInfo::new("album", "albums");
    const TRACK: ModelInfo = ModelInfo::new("track", "tracks");
    const TAG: ModelInfo = ModelInfo::new("tag", "tags");
    const COMMENT: ModelInfo = ModelInfo::new("comment", "comments");

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn registry(loaded: Arc<Mutex<Vec<String>>>) -> Registry {
        let mut r = Registry::new();
        r.register(ARTIST)
            .register(ALBUM)
            .register(TRACK)
            .register(TAG)
            .register(COMMENT);
        r.associate(
            "artist",
            AssociationDescriptor::to_many("albums", "album", &["artist_id"]).after_load(
                move |owner, value| {
                    loaded.lock().expect("lock poisoned").push(format!(
                        "{}:{}",
                        owner.label(),
                        value.records().len()
                    ));
                },
            ),
        )
        .unwrap();
        r.associate("album", AssociationDescriptor::to_one("artist", "artist", &["artist_id"]))
            .unwrap();
        r.associate("album", AssociationDescriptor::to_many("tracks", "track", &["album_id"]))
            .unwrap();
        r.associate(
            "album",
            AssociationDescriptor::many_to_many(
                "tags",
                "tag",
                JoinTable::new("album_tags", &["album_id"], &["tag_id"]),
            ),
        )
        .unwrap();
        r.associate("track", AssociationDescriptor::to_one("album", "album", &["album_id"]))
            .unwrap();
        r.polymorphic("commentable", [("Album", "album"), ("Track", "track")]);
        r.associate(
            "comment",
            AssociationDescriptor::custom(
                "subject",
                AssociationKind::ToOne,
                PolymorphicLoader::new("commentable", "subject_type", &["subject_id"]),
            ),
        )
        .unwrap();
        r
    }

    fn dataset() -> MemoryDataset {
        let ds = MemoryDataset::new();
        ds.define("tags", &["id"]);
        ds.define("album_tags", &["album_id", "tag_id"]);
        for id in [1_i64, 2] {
            ds.insert_pairs("artists", [("id", id)]);
        }
        for (id, artist) in [(10_i64, 1_i64), (11, 1), (12, 2)] {
            ds.insert_pairs("albums", [("id", id), ("artist_id", artist)]);
        }
        for (id, album) in [(100_i64, 10_i64), (101, 10), (102, 12)] {
            ds.insert_pairs("tracks", [("id", id), ("album_id", album)]);
        }
        for (id, kind, subject) in [(1_i64, "Album", 11_i64), (2, "Track", 100)] {
            ds.insert_pairs(
                "comments",
                [
                    ("id", Value::BigInt(id)),
                    ("subject_type", Value::from(kind)),
                    ("subject_id", Value::BigInt(subject)),
                ],
            );
        }
        ds
    }

    fn artists(ids: &[i64]) -> Vec<RecordRef> {
        ids.iter()
            .map(|id| Record::from_pairs(ARTIST, [("id", *id)]))
            .collect()
    }

    #[test]
    fn test_nested_levels_issue_one_query_per_association() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let roots = artists(&[1, 2]);
        let tree = EagerTree::new()
            .include_path("albums.tracks.album")
            .include_path("albums.tags");

        let report = rt.block_on(async {
            unwrap_outcome(EagerLoadPlanner::new(&cx, &ds, &registry).load(&roots, &tree).await)
        });
        // albums, tracks, tags, tracks.album
        assert_eq!(report.queries, 4);
        assert_eq!(report.levels, 3);
        assert_eq!(ds.query_count(), 4);

        let albums = roots[0].association("albums").unwrap();
        let albums = albums.as_many().unwrap();
        assert_eq!(albums.len(), 2);
        let tracks = albums[0].association("tracks").unwrap();
        assert_eq!(tracks.as_many().unwrap().len(), 2);
        assert!(albums[1].association("tracks").unwrap().as_many().unwrap().is_empty());
        assert!(albums[0].association("tags").unwrap().as_many().unwrap().is_empty());
        let back = tracks.as_many().unwrap()[0].association("album").unwrap();
        assert_eq!(back.as_one().unwrap().value("id"), Value::BigInt(10));
    }

    #[test]
    fn test_query_count_independent_of_root_count() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let tree = EagerTree::new().include_path("albums.tracks");

        for count in [0_i64, 1, 50] {
            let ds = dataset();
            let roots = artists(&(1..=count).collect::<Vec<_>>());
            let report = rt.block_on(async {
                unwrap_outcome(EagerLoadPlanner::new(&cx, &ds, &registry).load(&roots, &tree).await)
            });
            assert!(report.queries <= 2, "{count} roots took {} queries", report.queries);
            if count == 0 {
                assert_eq!(report.queries, 0);
            }
        }
    }

    #[test]
    fn test_undeclared_association_fails_before_any_query() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let roots = artists(&[1]);
        let tree = EagerTree::new().include_path("albums.producer");

        let outcome =
            rt.block_on(async { EagerLoadPlanner::new(&cx, &ds, &registry).load(&roots, &tree).await });
        match outcome {
            Outcome::Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::UnknownAssociation),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert_eq!(ds.query_count(), 0);
    }

    #[test]
    fn test_failure_leaves_caches_untouched() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        ds.fail_on("tracks");
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let roots = artists(&[1, 2]);
        let tree = EagerTree::new().include_path("albums.tracks");

        let outcome =
            rt.block_on(async { EagerLoadPlanner::new(&cx, &ds, &registry).load(&roots, &tree).await });
        assert!(matches!(outcome, Outcome::Err(Error::Query(_))));
        // The albums level succeeded but was never applied.
        assert!(!roots[0].is_loaded("albums"));
    }

    #[test]
    fn test_after_load_hooks_see_resolved_values() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = registry(Arc::clone(&seen));
        let roots = artists(&[1, 2, 3]);

        rt.block_on(async {
            unwrap_outcome(
                EagerLoadPlanner::new(&cx, &ds, &registry)
                    .load(&roots, &EagerTree::new().include("albums"))
                    .await,
            )
        });
        assert_eq!(
            *seen.lock().expect("lock poisoned"),
            vec!["artist#BigInt(1):2", "artist#BigInt(2):1", "artist#BigInt(3):0"]
        );
    }

    #[test]
    fn test_per_call_filter() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let roots = artists(&[1]);
        let tree = EagerTree::new().include_filtered(
            "albums",
            Expr::col("id").ne(10_i64),
            EagerTree::new(),
        );

        rt.block_on(async {
            unwrap_outcome(EagerLoadPlanner::new(&cx, &ds, &registry).load(&roots, &tree).await)
        });
        let albums = roots[0].association("albums").unwrap();
        let ids: Vec<_> = albums
            .as_many()
            .unwrap()
            .iter()
            .map(|a| a.value("id"))
            .collect();
        assert_eq!(ids, vec![Value::BigInt(11)]);
    }

    #[test]
    fn test_polymorphic_targets_continue_by_type() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let ds = dataset();
        let registry = registry(Arc::new(Mutex::new(Vec::new())));
        let comments: Vec<RecordRef> = ds
            .execute(&rowgraph_query::Query::from("comments"))
            .unwrap()
            .into_iter()
            .map(|row| Record::new(COMMENT, row))
            .collect();
        let tree = EagerTree::new().include_with("subject", EagerTree::new().include("tracks"));

        let outcome = rt.block_on(async {
            EagerLoadPlanner::new(&cx, &ds, &registry).load(&comments, &tree).await
        });
        // Albums declare `tracks`, tracks do not; checked once owners are known.
        match outcome {
            Outcome::Err(Error::Config(e)) => assert_eq!(e.kind, ConfigErrorKind::UnknownAssociation),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!comments[0].is_loaded("subject"));

        let tree = EagerTree::new().include("subject");
        let report = rt.block_on(async {
            unwrap_outcome(EagerLoadPlanner::new(&cx, &ds, &registry).load(&comments, &tree).await)
        });
        assert_eq!(report.queries, 2);
        match comments[1].association("subject") {
            Some(AssociationValue::One(track)) => assert_eq!(track.type_name(), "track"),
            other => panic!("unexpected value: {other:?}"),
        }
    }
}
