//! Loaded records and their association cache.
//!
//! A [`Record`] is shared as [`RecordRef`] (`Arc<Record>`): the same target
//! record instance may be assigned to many owners by a single eager load.
//! Column values and the association cache sit behind their own locks so a
//! loader can fill cache slots on records that are already referenced
//! elsewhere in the graph.
//!
//! The cache distinguishes three states per association name:
//!
//! - **unloaded**: no entry; a lazy access will query
//! - **loaded**: an [`AssociationValue`], including `Absent` and an empty
//!   `Many`, which short-circuit future lazy loads
//! - entries are removed only by [`Record::reset_associations`] /
//!   [`Record::clear_association`] (explicit reload)
//!
//! A slot pointing back at records that already hold this one (a reciprocal
//! written by a loader or a mutation) is stored as a back-reference with
//! [`Record::set_back_reference`]. Back-references are weak: they never keep
//! the records they name alive, and once one of those records is dropped
//! the slot reads as unloaded again.

use crate::key::Key;
use crate::model::ModelInfo;
use crate::row::Row;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

/// Shared handle to a loaded record.
pub type RecordRef = Arc<Record>;

/// A resolved association value.
#[derive(Clone)]
pub enum AssociationValue {
    /// Resolution was attempted and found nothing (to-one).
    Absent,
    /// A single associated record (to-one).
    One(RecordRef),
    /// Ordered associated records (to-many); may be empty.
    Many(Vec<RecordRef>),
    /// A computed scalar (aggregate associations).
    Scalar(Value),
}

impl AssociationValue {
    /// The single record, if this is a loaded to-one value.
    pub fn as_one(&self) -> Option<&RecordRef> {
        match self {
            AssociationValue::One(r) => Some(r),
            _ => None,
        }
    }

    /// The record list, if this is a to-many value.
    pub fn as_many(&self) -> Option<&[RecordRef]> {
        match self {
            AssociationValue::Many(list) => Some(list),
            _ => None,
        }
    }

    /// The scalar, if this is an aggregate value.
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            AssociationValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    /// True for `Absent`.
    pub fn is_absent(&self) -> bool {
        matches!(self, AssociationValue::Absent)
    }

    /// Records referenced by this value (empty for `Absent` and `Scalar`).
    pub fn records(&self) -> Vec<RecordRef> {
        match self {
            AssociationValue::One(r) => vec![Arc::clone(r)],
            AssociationValue::Many(list) => list.clone(),
            AssociationValue::Absent | AssociationValue::Scalar(_) => Vec::new(),
        }
    }
}

impl fmt::Debug for AssociationValue {
    // Records are summarised by type and key; printing them in full would
    // recurse through reciprocal caches.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssociationValue::Absent => write!(f, "Absent"),
            AssociationValue::One(r) => write!(f, "One({})", r.label()),
            AssociationValue::Many(list) => {
                let labels: Vec<String> = list.iter().map(|r| r.label()).collect();
                write!(f, "Many([{}])", labels.join(", "))
            }
            AssociationValue::Scalar(v) => write!(f, "Scalar({v:?})"),
        }
    }
}

/// One association cache entry.
enum Slot {
    Held(AssociationValue),
    BackOne(Weak<Record>),
    BackMany(Vec<Weak<Record>>),
}

impl Slot {
    fn back(value: AssociationValue) -> Self {
        match value {
            AssociationValue::One(r) => Slot::BackOne(Arc::downgrade(&r)),
            AssociationValue::Many(list) => {
                Slot::BackMany(list.iter().map(Arc::downgrade).collect())
            }
            other => Slot::Held(other),
        }
    }

    fn value(&self) -> Option<AssociationValue> {
        match self {
            Slot::Held(value) => Some(value.clone()),
            Slot::BackOne(weak) => weak.upgrade().map(AssociationValue::One),
            Slot::BackMany(list) => list
                .iter()
                .map(Weak::upgrade)
                .collect::<Option<Vec<_>>>()
                .map(AssociationValue::Many),
        }
    }

    fn is_live(&self) -> bool {
        match self {
            Slot::Held(_) => true,
            Slot::BackOne(weak) => weak.strong_count() > 0,
            Slot::BackMany(list) => list.iter().all(|w| w.strong_count() > 0),
        }
    }
}

/// A record loaded from a dataset.
pub struct Record {
    model: ModelInfo,
    values: RwLock<Row>,
    associations: Mutex<HashMap<&'static str, Slot>>,
}

impl Record {
    /// Wrap a fetched row as a shared record of type `model`.
    pub fn new(model: ModelInfo, row: Row) -> RecordRef {
        Arc::new(Self {
            model,
            values: RwLock::new(row),
            associations: Mutex::new(HashMap::new()),
        })
    }

    /// Build a record from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(model: ModelInfo, pairs: I) -> RecordRef
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self::new(model, Row::from_pairs(pairs))
    }

    /// Type metadata.
    pub fn model(&self) -> &ModelInfo {
        &self.model
    }

    /// Type name (registry key).
    pub fn type_name(&self) -> &'static str {
        self.model.name
    }

    /// Column value, `None` if the column is not present.
    pub fn get(&self, column: &str) -> Option<Value> {
        self.read_values().get_by_name(column).cloned()
    }

    /// Column value, NULL when absent.
    pub fn value(&self, column: &str) -> Value {
        self.get(column).unwrap_or(Value::Null)
    }

    /// Set a column value in memory.
    pub fn set(&self, column: &str, value: Value) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .set(column, value);
    }

    /// Replace every column value (used by reload).
    pub fn replace_row(&self, row: Row) {
        *self.values.write().unwrap_or_else(PoisonError::into_inner) = row;
    }

    /// Snapshot of the column values.
    pub fn row(&self) -> Row {
        self.read_values().clone()
    }

    /// Values of `columns`, NULL for missing ones.
    pub fn values_for(&self, columns: &[&str]) -> Vec<Value> {
        let row = self.read_values();
        columns
            .iter()
            .map(|c| row.get_by_name(c).cloned().unwrap_or(Value::Null))
            .collect()
    }

    /// Key tuple over `columns`; `None` if any component is NULL.
    pub fn key_for(&self, columns: &[&str]) -> Option<Key> {
        Key::new(self.values_for(columns))
    }

    /// Primary key tuple; `None` for unsaved records.
    pub fn primary_key(&self) -> Option<Key> {
        self.key_for(self.model.primary_key)
    }

    /// Cached association value; `None` means "not loaded yet".
    pub fn association(&self, name: &str) -> Option<AssociationValue> {
        self.lock_associations().get(name).and_then(Slot::value)
    }

    /// Whether `name` has been resolved (including to absent / empty).
    pub fn is_loaded(&self, name: &str) -> bool {
        self.lock_associations().get(name).is_some_and(Slot::is_live)
    }

    /// Store a resolved association value.
    pub fn set_association(&self, name: &'static str, value: AssociationValue) {
        self.lock_associations().insert(name, Slot::Held(value));
    }

    /// Store a value naming records that already hold this one.
    ///
    /// The records are referenced weakly; see the module docs.
    pub fn set_back_reference(&self, name: &'static str, value: AssociationValue) {
        self.lock_associations().insert(name, Slot::back(value));
    }

    /// Apply `f` to a loaded association value. Returns `false` (and does
    /// nothing) when the association is not loaded.
    ///
    /// A back-reference stays a back-reference.
    pub fn update_association<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut AssociationValue),
    {
        let mut slots = self.lock_associations();
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        if let Slot::Held(value) = &mut *slot {
            f(value);
            return true;
        }
        match slot.value() {
            Some(mut value) => {
                f(&mut value);
                *slot = Slot::back(value);
                true
            }
            None => false,
        }
    }

    /// Like [`Record::update_association`], storing the result as a
    /// back-reference.
    pub fn update_back_reference<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut AssociationValue),
    {
        let mut slots = self.lock_associations();
        let Some(slot) = slots.get_mut(name) else {
            return false;
        };
        match slot.value() {
            Some(mut value) => {
                f(&mut value);
                *slot = Slot::back(value);
                true
            }
            None => false,
        }
    }

    /// Forget one association, marking it unloaded.
    pub fn clear_association(&self, name: &str) {
        self.lock_associations().remove(name);
    }

    /// Forget every cached association.
    pub fn reset_associations(&self) {
        self.lock_associations().clear();
    }

    /// Names of the associations currently loaded.
    pub fn loaded_associations(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self
            .lock_associations()
            .iter()
            .filter(|(_, slot)| slot.is_live())
            .map(|(name, _)| *name)
            .collect();
        names.sort_unstable();
        names
    }

    /// `type#key` label for logs.
    pub fn label(&self) -> String {
        match self.primary_key() {
            Some(key) => {
                let parts: Vec<String> = key.parts().iter().map(|v| format!("{v:?}")).collect();
                format!("{}#{}", self.model.name, parts.join(","))
            }
            None => format!("{}#new", self.model.name),
        }
    }

    /// Identity comparison of two handles.
    pub fn same(a: &RecordRef, b: &RecordRef) -> bool {
        Arc::ptr_eq(a, b)
    }

    fn read_values(&self) -> std::sync::RwLockReadGuard<'_, Row> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_associations(&self) -> std::sync::MutexGuard<'_, HashMap<&'static str, Slot>> {
        self.associations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Record")
            .field("type", &self.model.name)
            .field("values", &*self.read_values())
            .field("loaded", &self.loaded_associations())
            .finish()
    }
}

/// Deduplicate records by identity, keeping first occurrences in order.
pub fn dedup_records(records: impl IntoIterator<Item = RecordRef>) -> Vec<RecordRef> {
    let mut seen = std::collections::HashSet::new();
    records
        .into_iter()
        .filter(|r| seen.insert(Arc::as_ptr(r) as usize))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARTIST: ModelInfo = ModelInfo::new("artist", "artists");
    const ALBUM: ModelInfo = ModelInfo::new("album", "albums");
    const TAG: ModelInfo = ModelInfo::new("tag", "tags");
    const TRACK: ModelInfo =
        ModelInfo::new("track", "tracks").primary_key(&["album_id", "position"]);

    #[test]
    fn test_primary_key_and_null() {
        let a = Record::from_pairs(ARTIST, [("id", Value::BigInt(1))]);
        assert_eq!(a.primary_key(), Key::single(1_i64));

        let unsaved = Record::from_pairs(ARTIST, [("id", Value::Null)]);
        assert!(unsaved.primary_key().is_none());
        assert_eq!(unsaved.label(), "artist#new");
    }

    #[test]
    fn test_composite_primary_key() {
        let t = Record::from_pairs(
            TRACK,
            [("album_id", Value::BigInt(4)), ("position", Value::Int(2))],
        );
        let key = t.primary_key().unwrap();
        assert_eq!(key.arity(), 2);
        assert_eq!(
            key,
            Key::new(vec![Value::BigInt(4), Value::BigInt(2)]).unwrap()
        );
    }

    #[test]
    fn test_cache_distinguishes_unloaded_from_absent() {
        let a = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        assert!(!a.is_loaded("label"));
        assert!(a.association("label").is_none());

        a.set_association("label", AssociationValue::Absent);
        assert!(a.is_loaded("label"));
        assert!(a.association("label").unwrap().is_absent());

        a.reset_associations();
        assert!(!a.is_loaded("label"));
    }

    #[test]
    fn test_update_association_only_when_loaded() {
        let a = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let b = Record::from_pairs(ARTIST, [("id", 2_i64)]);
        assert!(!a.update_association("albums", |_| {}));

        a.set_association("albums", AssociationValue::Many(Vec::new()));
        assert!(a.update_association("albums", |v| {
            if let AssociationValue::Many(list) = v {
                list.push(Arc::clone(&b));
            }
        }));
        assert_eq!(a.association("albums").unwrap().as_many().unwrap().len(), 1);
    }

    #[test]
    fn test_dedup_records_by_identity() {
        let a = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let same_key = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let out = dedup_records(vec![Arc::clone(&a), Arc::clone(&a), Arc::clone(&same_key)]);
        assert_eq!(out.len(), 2);
        assert!(Record::same(&out[0], &a));
    }

    #[test]
    fn test_debug_does_not_recurse() {
        let a = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        a.set_back_reference("self_ref", AssociationValue::One(Arc::clone(&a)));
        let text = format!("{:?}", a.association("self_ref").unwrap());
        assert_eq!(text, "One(artist#BigInt(1))");
        assert_eq!(Arc::strong_count(&a), 1);
    }

    #[test]
    fn test_back_reference_does_not_keep_owner_alive() {
        let artist = Record::from_pairs(ARTIST, [("id", 1_i64)]);
        let album = Record::from_pairs(ALBUM, [("id", 7_i64), ("artist_id", 1_i64)]);
        artist.set_association("albums", AssociationValue::Many(vec![Arc::clone(&album)]));
        album.set_back_reference("artist", AssociationValue::One(Arc::clone(&artist)));
        assert!(Record::same(
            album.association("artist").unwrap().as_one().unwrap(),
            &artist
        ));
        assert_eq!(album.loaded_associations(), vec!["artist"]);

        let weak = Arc::downgrade(&artist);
        drop(artist);
        assert!(weak.upgrade().is_none());
        assert!(!album.is_loaded("artist"));
        assert!(album.association("artist").is_none());
        assert!(album.loaded_associations().is_empty());
    }

    #[test]
    fn test_update_keeps_back_reference_weak() {
        let tag = Record::from_pairs(TAG, [("id", 1_i64)]);
        let first = Record::from_pairs(ALBUM, [("id", 1_i64)]);
        let second = Record::from_pairs(ALBUM, [("id", 2_i64)]);
        tag.set_back_reference("albums", AssociationValue::Many(vec![Arc::clone(&first)]));
        assert!(tag.update_association("albums", |v| {
            if let AssociationValue::Many(list) = v {
                list.push(Arc::clone(&second));
            }
        }));
        assert_eq!(tag.association("albums").unwrap().as_many().unwrap().len(), 2);
        assert_eq!(Arc::strong_count(&second), 1);

        // Held values become back-references through update_back_reference.
        let held = Record::from_pairs(TAG, [("id", 2_i64)]);
        held.set_association("albums", AssociationValue::Many(Vec::new()));
        assert!(held.update_back_reference("albums", |v| {
            if let AssociationValue::Many(list) = v {
                list.push(Arc::clone(&first));
            }
        }));
        assert_eq!(Arc::strong_count(&first), 1);

        drop(second);
        assert!(!tag.is_loaded("albums"));
        assert!(!tag.update_association("albums", |_| {}));
    }
}
