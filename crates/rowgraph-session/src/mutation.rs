//! Association mutations: add, remove and set.
//!
//! Every mutation goes through the [`CallbackDispatcher`], so before-hooks
//! can veto it and after-hooks observe it. A mutation updates the key
//! columns it owns, the loaded cache on both sides (unloaded caches stay
//! unloaded) and, for many-to-many associations, records the join-table row
//! to insert or delete. Persisting those rows is the caller's job; drain
//! them with [`AssociationMutator::take_pending_links`] and
//! [`AssociationMutator::take_pending_unlinks`].

use crate::association::{AssociationDescriptor, AssociationKind};
use crate::callbacks::{CallbackDispatcher, MutationKind};
use rowgraph_core::{
    AssociationErrorKind, AssociationValue, Error, Record, RecordRef, Result, Value,
};
use std::sync::{Arc, Mutex, PoisonError};

/// A join-table row to insert or delete.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRow {
    pub table: &'static str,
    pub values: Vec<(&'static str, Value)>,
}

#[derive(Debug, Default)]
struct PendingLinks {
    links: Vec<JoinRow>,
    unlinks: Vec<JoinRow>,
}

/// Applies add / remove / set through the association hooks.
#[derive(Debug, Default)]
pub struct AssociationMutator {
    dispatcher: CallbackDispatcher,
    pending: Mutex<PendingLinks>,
}

impl AssociationMutator {
    pub fn new(dispatcher: CallbackDispatcher) -> Self {
        Self {
            dispatcher,
            pending: Mutex::new(PendingLinks::default()),
        }
    }

    pub fn dispatcher(&self) -> CallbackDispatcher {
        self.dispatcher
    }

    /// Add `target` to a collection association of `owner`.
    ///
    /// To-many: copies the owner key into the target's foreign key columns.
    /// Many-to-many: queues a join-table insert. Returns `Ok(false)` when a
    /// hook vetoed in return-false mode.
    pub fn add(
        &self,
        descriptor: &AssociationDescriptor,
        owner: &RecordRef,
        target: &RecordRef,
    ) -> Result<bool> {
        require_collection(descriptor, owner, "add")?;
        check_target(descriptor, owner, target)?;

        self.dispatcher
            .dispatch(descriptor, MutationKind::Add, owner, Some(target), || {
                match descriptor.kind {
                    AssociationKind::ManyToMany => {
                        let row = join_row(descriptor, owner, target)?;
                        let mut pending = self.lock_pending();
                        pending.unlinks.retain(|r| *r != row);
                        if !pending.links.contains(&row) {
                            pending.links.push(row);
                        }
                    }
                    _ => copy_columns(owner, descriptor.owner_key, target, descriptor.target_key),
                }

                owner.update_association(descriptor.name, |value| push_unique(value, target));
                if let Some(back) = descriptor.reciprocal {
                    link_back(descriptor.kind, back, target, owner);
                }
                tracing::debug!(
                    owner = %owner.label(),
                    association = descriptor.name,
                    target = %target.label(),
                    "Association add"
                );
                Ok(())
            })
    }

    /// Remove `target` from a collection association of `owner`.
    ///
    /// To-many: clears the target's foreign key columns. Many-to-many:
    /// queues a join-table delete.
    pub fn remove(
        &self,
        descriptor: &AssociationDescriptor,
        owner: &RecordRef,
        target: &RecordRef,
    ) -> Result<bool> {
        require_collection(descriptor, owner, "remove")?;
        check_target(descriptor, owner, target)?;

        self.dispatcher
            .dispatch(descriptor, MutationKind::Remove, owner, Some(target), || {
                match descriptor.kind {
                    AssociationKind::ManyToMany => {
                        let row = join_row(descriptor, owner, target)?;
                        let mut pending = self.lock_pending();
                        pending.links.retain(|r| *r != row);
                        if !pending.unlinks.contains(&row) {
                            pending.unlinks.push(row);
                        }
                    }
                    _ => {
                        for column in descriptor.target_key {
                            target.set(column, Value::Null);
                        }
                    }
                }

                owner.update_association(descriptor.name, |value| remove_record(value, target));
                if let Some(back) = descriptor.reciprocal {
                    unlink_back(descriptor.kind, back, target, owner);
                }
                tracing::debug!(
                    owner = %owner.label(),
                    association = descriptor.name,
                    target = %target.label(),
                    "Association remove"
                );
                Ok(())
            })
    }

    /// Point a to-one association of `owner` at `target`, or clear it.
    ///
    /// Copies the target key into the owner's local key columns (NULL when
    /// clearing) and caches the new value.
    pub fn set(
        &self,
        descriptor: &AssociationDescriptor,
        owner: &RecordRef,
        target: Option<&RecordRef>,
    ) -> Result<bool> {
        if descriptor.kind != AssociationKind::ToOne {
            return Err(Error::association(
                AssociationErrorKind::InvalidTarget,
                owner.type_name(),
                descriptor.name,
                format!("set needs a to_one association, found {}", descriptor.kind.as_str()),
            ));
        }
        if let Some(target) = target {
            check_target(descriptor, owner, target)?;
        }

        self.dispatcher
            .dispatch(descriptor, MutationKind::Set, owner, target, || {
                let previous = owner.association(descriptor.name).and_then(|v| v.as_one().cloned());
                match target {
                    Some(target) => {
                        copy_columns(target, descriptor.target_key, owner, descriptor.owner_key);
                        owner.set_association(descriptor.name, AssociationValue::One(Arc::clone(target)));
                    }
                    None => {
                        for column in descriptor.owner_key {
                            owner.set(column, Value::Null);
                        }
                        owner.set_association(descriptor.name, AssociationValue::Absent);
                    }
                }

                if let Some(back) = descriptor.reciprocal {
                    if let Some(previous) = previous {
                        if target.is_none_or(|t| !Record::same(t, &previous)) {
                            previous.update_back_reference(back, |value| remove_record(value, owner));
                        }
                    }
                    if let Some(target) = target {
                        target.update_back_reference(back, |value| push_unique(value, owner));
                    }
                }
                tracing::debug!(
                    owner = %owner.label(),
                    association = descriptor.name,
                    target = %target.map_or_else(|| "none".to_string(), |t| t.label()),
                    "Association set"
                );
                Ok(())
            })
    }

    /// Join-table rows queued for insertion, clearing the queue.
    pub fn take_pending_links(&self) -> Vec<JoinRow> {
        std::mem::take(&mut self.lock_pending().links)
    }

    /// Join-table rows queued for deletion, clearing the queue.
    pub fn take_pending_unlinks(&self) -> Vec<JoinRow> {
        std::mem::take(&mut self.lock_pending().unlinks)
    }

    #[must_use]
    pub fn has_pending_ops(&self) -> bool {
        let pending = self.lock_pending();
        !pending.links.is_empty() || !pending.unlinks.is_empty()
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingLinks> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn require_collection(descriptor: &AssociationDescriptor, owner: &Record, op: &str) -> Result<()> {
    if descriptor.kind.is_collection() {
        return Ok(());
    }
    Err(Error::association(
        AssociationErrorKind::InvalidTarget,
        owner.type_name(),
        descriptor.name,
        format!("{op} needs a collection association, found {}", descriptor.kind.as_str()),
    ))
}

fn check_target(descriptor: &AssociationDescriptor, owner: &Record, target: &Record) -> Result<()> {
    match descriptor.target {
        Some(expected) if expected != target.type_name() => Err(Error::association(
            AssociationErrorKind::InvalidTarget,
            owner.type_name(),
            descriptor.name,
            format!("expected a {expected}, got a {}", target.type_name()),
        )),
        _ => Ok(()),
    }
}

fn copy_columns(from: &Record, from_columns: &[&str], to: &Record, to_columns: &[&str]) {
    for (src, dst) in from_columns.iter().zip(to_columns) {
        to.set(dst, from.value(src));
    }
}

fn join_row(descriptor: &AssociationDescriptor, owner: &Record, target: &Record) -> Result<JoinRow> {
    let Some(jt) = descriptor.join_table else {
        return Err(Error::association(
            AssociationErrorKind::InvalidTarget,
            owner.type_name(),
            descriptor.name,
            "many_to_many association has no join table",
        ));
    };
    let values = jt
        .owner_columns
        .iter()
        .zip(owner.values_for(descriptor.owner_key))
        .chain(jt.target_columns.iter().zip(target.values_for(descriptor.target_key)))
        .map(|(column, value)| (*column, value))
        .collect();
    Ok(JoinRow {
        table: jt.table,
        values,
    })
}

fn push_unique(value: &mut AssociationValue, record: &RecordRef) {
    match value {
        AssociationValue::Many(list) => {
            if !list.iter().any(|r| Record::same(r, record)) {
                list.push(Arc::clone(record));
            }
        }
        other => *other = AssociationValue::One(Arc::clone(record)),
    }
}

fn remove_record(value: &mut AssociationValue, record: &RecordRef) {
    match value {
        AssociationValue::Many(list) => list.retain(|r| !Record::same(r, record)),
        AssociationValue::One(current) if Record::same(current, record) => {
            *value = AssociationValue::Absent;
        }
        _ => {}
    }
}

/// Mirror an add on the target's reciprocal association.
fn link_back(kind: AssociationKind, back: &'static str, target: &RecordRef, owner: &RecordRef) {
    match kind {
        AssociationKind::ToMany => {
            target.set_back_reference(back, AssociationValue::One(Arc::clone(owner)));
        }
        _ => {
            target.update_back_reference(back, |value| push_unique(value, owner));
        }
    }
}

fn unlink_back(kind: AssociationKind, back: &'static str, target: &RecordRef, owner: &RecordRef) {
    match kind {
        AssociationKind::ToMany => target.set_association(back, AssociationValue::Absent),
        _ => {
            target.update_back_reference(back, |value| remove_record(value, owner));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::association::JoinTable;
    use crate::callbacks::{HookFailureMode, HookOutcome};
    use crate::registry::Registry;
    use rowgraph_core::ModelInfo;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");
    const ALBUM: ModelInfo = ModelInfo::new("album", "albums");
    const TAG: ModelInfo = ModelInfo::new("tag", "tags");

    fn registry(after_adds: Arc<AtomicUsize>) -> Registry {
        let mut r = Registry::new();
        r.register(ARTIST).register(ALBUM).register(TAG);
        r.associate(
            "artist",
            AssociationDescriptor::to_many("albums", "album", &["artist_id"])
                .reciprocal("artist")
                .before_add(|_, target| {
                    if target.is_some_and(|t| t.value("title") == Value::from("forbidden")) {
                        HookOutcome::Veto
                    } else {
                        HookOutcome::Continue
                    }
                })
                .after_add(move |_, _| {
                    after_adds.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .unwrap();
        r.associate(
            "album",
            AssociationDescriptor::to_one("artist", "artist", &["artist_id"]).reciprocal("albums"),
        )
        .unwrap();
        r.associate(
            "album",
            AssociationDescriptor::many_to_many(
                "tags",
                "tag",
                JoinTable::new("album_tags", &["album_id"], &["tag_id"]),
            )
            .reciprocal("albums"),
        )
        .unwrap();
        r
    }

    fn album(id: i64, title: &str) -> RecordRef {
        Record::from_pairs(
            ALBUM,
            [("id", Value::BigInt(id)), ("title", Value::from(title)), ("artist_id", Value::Null)],
        )
    }

    #[test]
    fn test_add_to_many_sets_foreign_key_and_caches() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let desc = registry.association("artist", "albums").unwrap();
        let artist = Record::from_pairs(ARTIST, [("id", 7_i64)]);
        artist.set_association("albums", AssociationValue::Many(Vec::new()));
        let a = album(1, "Secret Name");

        let mutator = AssociationMutator::default();
        assert!(mutator.add(desc, &artist, &a).unwrap());
        assert!(mutator.add(desc, &artist, &a).unwrap());
        assert_eq!(a.value("artist_id"), Value::BigInt(7));
        assert_eq!(artist.association("albums").unwrap().records().len(), 1);
        assert!(Record::same(
            a.association("artist").unwrap().as_one().unwrap(),
            &artist
        ));

        assert!(mutator.remove(desc, &artist, &a).unwrap());
        assert!(a.value("artist_id").is_null());
        assert!(artist.association("albums").unwrap().records().is_empty());
        assert!(a.association("artist").unwrap().is_absent());
    }

    #[test]
    fn test_reciprocal_links_do_not_keep_owners_alive() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let albums = registry.association("artist", "albums").unwrap();
        let tags = registry.association("album", "tags").unwrap();
        let artist = Record::from_pairs(ARTIST, [("id", 7_i64)]);
        artist.set_association("albums", AssociationValue::Many(Vec::new()));
        let a = album(1, "Secret Name");
        a.set_association("tags", AssociationValue::Many(Vec::new()));
        let tag = Record::from_pairs(TAG, [("id", 40_i64)]);
        tag.set_association("albums", AssociationValue::Many(Vec::new()));

        let mutator = AssociationMutator::default();
        assert!(mutator.add(albums, &artist, &a).unwrap());
        assert!(mutator.add(tags, &a, &tag).unwrap());
        assert_eq!(tag.association("albums").unwrap().records().len(), 1);

        let weak_artist = Arc::downgrade(&artist);
        drop(artist);
        assert!(weak_artist.upgrade().is_none());
        assert!(!a.is_loaded("artist"));

        let weak_album = Arc::downgrade(&a);
        drop(a);
        assert!(weak_album.upgrade().is_none());
        assert!(!tag.is_loaded("albums"));
    }

    #[test]
    fn test_unloaded_cache_stays_unloaded() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let desc = registry.association("artist", "albums").unwrap();
        let artist = Record::from_pairs(ARTIST, [("id", 7_i64)]);
        AssociationMutator::default()
            .add(desc, &artist, &album(1, "Trust"))
            .unwrap();
        assert!(!artist.is_loaded("albums"));
    }

    #[test]
    fn test_veto_leaves_state_unchanged() {
        let after_adds = Arc::new(AtomicUsize::new(0));
        let registry = registry(Arc::clone(&after_adds));
        let desc = registry.association("artist", "albums").unwrap();
        let artist = Record::from_pairs(ARTIST, [("id", 7_i64)]);
        artist.set_association("albums", AssociationValue::Many(Vec::new()));
        let bad = album(2, "forbidden");

        let raise = AssociationMutator::default();
        assert!(raise.add(desc, &artist, &bad).unwrap_err().is_hook_failure());
        let quiet = AssociationMutator::new(CallbackDispatcher::new(HookFailureMode::ReturnFalse));
        assert!(!quiet.add(desc, &artist, &bad).unwrap());

        assert!(bad.value("artist_id").is_null());
        assert!(artist.association("albums").unwrap().records().is_empty());
        assert_eq!(after_adds.load(Ordering::SeqCst), 0);

        quiet.add(desc, &artist, &album(3, "Things We Lost")).unwrap();
        assert_eq!(after_adds.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_many_to_many_queues_join_rows() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let desc = registry.association("album", "tags").unwrap();
        let a = album(1, "Secret Name");
        let tag = Record::from_pairs(TAG, [("id", 40_i64)]);
        tag.set_association("albums", AssociationValue::Many(Vec::new()));

        let mutator = AssociationMutator::default();
        mutator.add(desc, &a, &tag).unwrap();
        mutator.add(desc, &a, &tag).unwrap();
        assert_eq!(tag.association("albums").unwrap().records().len(), 1);
        assert!(mutator.has_pending_ops());
        assert_eq!(
            mutator.take_pending_links(),
            vec![JoinRow {
                table: "album_tags",
                values: vec![("album_id", Value::BigInt(1)), ("tag_id", Value::BigInt(40))],
            }]
        );
        assert!(!mutator.has_pending_ops());

        mutator.add(desc, &a, &tag).unwrap();
        mutator.remove(desc, &a, &tag).unwrap();
        assert!(mutator.take_pending_links().is_empty());
        assert_eq!(mutator.take_pending_unlinks().len(), 1);
        assert!(tag.association("albums").unwrap().records().is_empty());
    }

    #[test]
    fn test_set_to_one_moves_between_owners() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let desc = registry.association("album", "artist").unwrap();
        let low = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let slint = Record::from_pairs(ARTIST, [("id", 2_i64)]);
        let a = album(1, "Secret Name");
        low.set_association("albums", AssociationValue::Many(Vec::new()));
        slint.set_association("albums", AssociationValue::Many(Vec::new()));

        let mutator = AssociationMutator::default();
        mutator.set(desc, &a, Some(&low)).unwrap();
        assert_eq!(a.value("artist_id"), Value::BigInt(1));
        assert_eq!(low.association("albums").unwrap().records().len(), 1);
        // The owner list refers back to the album weakly.
        assert_eq!(Arc::strong_count(&a), 1);

        mutator.set(desc, &a, Some(&slint)).unwrap();
        assert!(low.association("albums").unwrap().records().is_empty());
        assert_eq!(slint.association("albums").unwrap().records().len(), 1);

        mutator.set(desc, &a, None).unwrap();
        assert!(a.value("artist_id").is_null());
        assert!(a.association("artist").unwrap().is_absent());
        assert!(slint.association("albums").unwrap().records().is_empty());
    }

    #[test]
    fn test_wrong_shape_or_type_is_rejected() {
        let registry = registry(Arc::new(AtomicUsize::new(0)));
        let albums = registry.association("artist", "albums").unwrap();
        let artist_of = registry.association("album", "artist").unwrap();
        let artist = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let tag = Record::from_pairs(TAG, [("id", 1_i64)]);
        let mutator = AssociationMutator::default();

        assert!(mutator.add(albums, &artist, &tag).is_err());
        assert!(mutator.set(albums, &artist, None).is_err());
        assert!(mutator.add(artist_of, &album(1, "x"), &artist).is_err());
    }
}
