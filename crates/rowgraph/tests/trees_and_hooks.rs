use asupersync::runtime::RuntimeBuilder;
use rowgraph::prelude::*;
use rowgraph::{AncestorsLoader, DescendantsLoader};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

const NODE: ModelInfo = ModelInfo::new("node", "nodes").columns(&["id", "parent_id", "name"]);
const PLAYLIST: ModelInfo = ModelInfo::new("playlist", "playlists");
const TRACK: ModelInfo = ModelInfo::new("track", "tracks");

fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
    match outcome {
        Outcome::Ok(v) => v,
        Outcome::Err(e) => panic!("unexpected error: {e}"),
        Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
        Outcome::Panicked(p) => panic!("panicked: {p:?}"),
    }
}

fn tree_registry() -> Registry {
    let mut registry = Registry::new();
    registry.register(NODE);
    registry
        .associate("node", AssociationDescriptor::to_one("parent", "node", &["parent_id"]))
        .expect("declare node.parent");
    registry
        .associate(
            "node",
            AssociationDescriptor::custom(
                "ancestors",
                AssociationKind::ToMany,
                AncestorsLoader::new(&["parent_id"]).with_parent("parent"),
            )
            .target("node"),
        )
        .expect("declare node.ancestors");
    registry
        .associate(
            "node",
            AssociationDescriptor::custom(
                "descendants",
                AssociationKind::ToMany,
                DescendantsLoader::new(&["parent_id"]).with_children("children"),
            )
            .target("node"),
        )
        .expect("declare node.descendants");
    registry
}

fn node(ds: &MemoryDataset, id: i64, parent: Option<i64>, name: &str) {
    ds.insert_pairs(
        "nodes",
        [
            ("id", Value::BigInt(id)),
            ("parent_id", parent.into()),
            ("name", Value::from(name)),
        ],
    );
}

#[test]
fn ancestor_chain_terminates_and_only_root_is_parentless() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let ds = MemoryDataset::new();
    node(&ds, 1, None, "A");
    node(&ds, 2, Some(1), "B");
    node(&ds, 3, Some(2), "C");
    node(&ds, 4, Some(3), "D");
    let session = Session::new(ds, tree_registry());

    let d = rt.block_on(async {
        unwrap_outcome(
            session
                .all(&cx, "node", Some(Expr::col("name").eq("D")))
                .await,
        )
    });
    session.dataset().reset_log();
    rt.block_on(async {
        unwrap_outcome(
            session
                .eager_load(&cx, &d, &EagerTree::new().include("ancestors"))
                .await,
        );
    });
    assert!(session.dataset().query_count() <= 3);

    let chain = d[0].association("ancestors").expect("ancestors loaded").records();
    let names: Vec<Value> = chain.iter().map(|n| n.value("name")).collect();
    assert_eq!(names, vec![Value::from("C"), Value::from("B"), Value::from("A")]);

    let mut walked = vec![Arc::clone(&d[0])];
    walked.extend(chain);
    for n in &walked {
        let parent = n.association("parent").expect("parent slot filled");
        if n.value("name") == Value::from("A") {
            assert!(parent.is_absent());
        } else {
            assert!(parent.as_one().is_some(), "{} has a parent", n.label());
        }
    }
}

#[test]
fn self_parented_root_does_not_recurse() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let ds = MemoryDataset::new();
    node(&ds, 10, Some(10), "root");
    node(&ds, 11, Some(10), "left");
    node(&ds, 12, Some(10), "right");
    let session = Session::new(ds, tree_registry());

    let root = rt.block_on(async {
        unwrap_outcome(
            session
                .all(&cx, "node", Some(Expr::col("id").eq(10_i64)))
                .await,
        )
    });
    session.dataset().reset_log();
    rt.block_on(async {
        unwrap_outcome(
            session
                .eager_load(&cx, &root, &EagerTree::new().include("descendants"))
                .await,
        );
    });
    // Children of the root, then an empty generation.
    assert!(session.dataset().query_count() <= 2);
    for query in session.dataset().queries() {
        let (sql, _) = query.to_sql();
        assert!(sql.contains("NOT"), "self-parented rows excluded: {sql}");
    }

    let descendants = root[0].association("descendants").expect("loaded").records();
    let ids: Vec<Value> = descendants.iter().map(|n| n.value("id")).collect();
    assert_eq!(ids, vec![Value::BigInt(11), Value::BigInt(12)]);
    assert!(descendants.iter().all(|n| !Record::same(n, &root[0])));

    // The ancestor walk from the same root stops at once.
    session.dataset().reset_log();
    rt.block_on(async {
        unwrap_outcome(
            session
                .eager_load(&cx, &root, &EagerTree::new().include("ancestors"))
                .await,
        );
    });
    assert_eq!(session.dataset().query_count(), 0);
    assert!(root[0].association("parent").expect("parent slot").is_absent());
}

#[test]
fn vetoed_add_leaves_cache_and_skips_after_hook() {
    let rt = RuntimeBuilder::current_thread()
        .build()
        .expect("create asupersync runtime");
    let cx = Cx::for_testing();
    let after_adds = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&after_adds);

    let mut registry = Registry::new();
    registry.register(PLAYLIST).register(TRACK);
    registry
        .associate(
            "playlist",
            AssociationDescriptor::to_many("tracks", "track", &["playlist_id"])
                .before_add(|playlist, _| {
                    if playlist.value("locked") == Value::Bool(true) {
                        HookOutcome::Veto
                    } else {
                        HookOutcome::Continue
                    }
                })
                .after_add(move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .expect("declare playlist.tracks");

    let ds = MemoryDataset::new();
    ds.insert_pairs("playlists", [("id", Value::BigInt(1)), ("locked", Value::Bool(true))]);
    ds.insert_pairs("playlists", [("id", Value::BigInt(2)), ("locked", Value::Bool(false))]);
    ds.insert_pairs("tracks", [("id", Value::BigInt(100)), ("playlist_id", Value::BigInt(1))]);
    let registry = Arc::new(registry);
    let raising = Session::new(ds, Arc::clone(&registry));

    let playlists = rt.block_on(async {
        unwrap_outcome(
            raising
                .eager(&cx, "playlist", None, &EagerTree::new().include("tracks"))
                .await,
        )
    });
    let locked = &playlists[0];
    let before = locked.association("tracks").expect("tracks loaded").records();
    let extra = Record::from_pairs(TRACK, [("id", Value::BigInt(101)), ("playlist_id", Value::Null)]);

    let err = raising
        .add(locked, "tracks", &extra)
        .expect_err("veto raises by default");
    assert!(err.is_hook_failure());

    let quiet = Session::with_config(
        MemoryDataset::new(),
        registry,
        SessionConfig {
            hook_failure: HookFailureMode::ReturnFalse,
            ..SessionConfig::default()
        },
    );
    assert!(!quiet.add(locked, "tracks", &extra).expect("veto returns false"));

    let after = locked.association("tracks").expect("tracks loaded").records();
    assert_eq!(after.len(), before.len());
    assert!(after.iter().zip(&before).all(|(a, b)| Record::same(a, b)));
    assert!(extra.value("playlist_id").is_null());
    assert_eq!(after_adds.load(Ordering::SeqCst), 0);

    // An unlocked playlist accepts the track and runs the after-hook once.
    let open = &playlists[1];
    assert!(raising.add(open, "tracks", &extra).expect("add succeeds"));
    assert_eq!(extra.value("playlist_id"), Value::BigInt(2));
    assert_eq!(open.association("tracks").expect("loaded").records().len(), 1);
    assert_eq!(after_adds.load(Ordering::SeqCst), 1);
}
