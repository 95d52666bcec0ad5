//! rowgraph - association eager loading for record graphs.
//!
//! Given records already fetched and a declared graph of associations to
//! other record types, rowgraph resolves the requested related records with
//! a bounded number of queries: at most one per requested association and
//! depth level, however many records are involved.
//!
//! - to-one, to-many and many-to-many (join table) associations
//! - composite keys
//! - nested eager loads (`albums.tracks.artist`)
//! - self-referential trees, polymorphic targets, aggregates
//! - single-query graph joins for filtering on related columns
//! - custom loaders, association hooks, N+1 warnings
//!
//! # Quick Start
//!
//! ```ignore
//! use rowgraph::prelude::*;
//!
//! const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");
//! const ALBUM: ModelInfo = ModelInfo::new("album", "albums");
//!
//! let mut registry = Registry::new();
//! registry.register(ARTIST).register(ALBUM);
//! registry.associate(
//!     "artist",
//!     AssociationDescriptor::to_many("albums", "album", &["artist_id"]),
//! )?;
//! registry.associate(
//!     "album",
//!     AssociationDescriptor::to_one("artist", "artist", &["artist_id"]),
//! )?;
//!
//! let session = Session::new(dataset, registry);
//! // Three queries: artists, their albums, the albums' artists.
//! let artists = session
//!     .eager(&cx, "artist", None, &EagerTree::new().include_path("albums.artist"))
//!     .await;
//! ```
//!
//! # Features
//!
//! - **Bounded queries**: loaders batch every owner of a level into one query
//! - **Structured concurrency**: built on asupersync (`Cx` + `Outcome`)
//! - **All-or-nothing**: a failed load leaves every association cache untouched
//! - **Pluggable datasets**: anything implementing [`Dataset`] can serve queries

pub use rowgraph_core::{
    // asupersync re-exports
    Budget,
    Cx,
    Outcome,
    RegionId,
    TaskId,
    // Core types
    AssociationError,
    AssociationErrorKind,
    AssociationValue,
    ConfigError,
    ConfigErrorKind,
    Error,
    Key,
    KeyIndex,
    ModelInfo,
    QueryError,
    QueryErrorKind,
    Record,
    RecordRef,
    Result,
    Row,
    TypeError,
    Value,
    dedup_records,
};

pub use rowgraph_query::{
    BinaryOp, BoxFuture, Dataset, Dialect, EagerEntry, EagerTree, Expr, Join, JoinCondition,
    JoinType, MemoryDataset, NullsOrder, OrderBy, OrderDirection, Query, SelectItem,
};

pub use rowgraph_session::{
    Aggregate, AggregateLoader, AncestorsLoader, AssociationDescriptor, AssociationKind,
    AssociationLoader, AssociationMutator, CallSite, CallbackDispatcher, Callbacks, CustomLoader,
    DescendantsLoader, EagerLoadPlanner, Fanout, GraphContext, GraphJoinBuilder, GraphPlan,
    HookFailureMode, HookOutcome, IdentityMap, JoinRow, JoinTable, LoadContext, LoadReport,
    LoadStrategy, MultiKeyLoader, MutationKind, N1QueryTracker, N1Stats, PolymorphicLoader,
    Registry, Session, SessionConfig, Through,
};

/// Common imports.
pub mod prelude {
    pub use crate::{
        // asupersync
        Cx,
        Outcome,
        // Core
        AssociationValue,
        Error,
        ModelInfo,
        Record,
        RecordRef,
        Result,
        Value,
        // Query
        Dataset,
        EagerTree,
        Expr,
        JoinCondition,
        JoinType,
        MemoryDataset,
        OrderBy,
        // Associations
        AssociationDescriptor,
        AssociationKind,
        HookFailureMode,
        HookOutcome,
        JoinTable,
        Registry,
        Session,
        SessionConfig,
    };
}
