//! Key tuples and the key index used to batch association loads.
//!
//! A [`KeyIndex`] maps a (possibly composite) key value to every owner that
//! shares it. Loaders build one per invocation, use its keys as the `IN` list
//! of a single query, and look returned rows back up by key to fan results
//! out onto owners.

use crate::value::Value;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// A non-null key tuple, compared element-wise in declared order.
///
/// Integer components compare equal across widths (`Int(3) == BigInt(3)`),
/// so a foreign key stored as INTEGER still matches a BIGINT primary key.
#[derive(Debug, Clone)]
pub struct Key(Vec<Value>);

impl Key {
    /// Build a key from its components.
    ///
    /// Returns `None` for an empty tuple or when any component is NULL: such
    /// a key can never match anything.
    pub fn new(parts: Vec<Value>) -> Option<Self> {
        if parts.is_empty() || parts.iter().any(Value::is_null) {
            return None;
        }
        Some(Self(parts))
    }

    /// Single-column key.
    pub fn single(value: impl Into<Value>) -> Option<Self> {
        Self::new(vec![value.into()])
    }

    /// Key components in declared order.
    pub fn parts(&self) -> &[Value] {
        &self.0
    }

    /// Number of components.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// The sole component of a single-column key.
    pub fn as_single(&self) -> Option<&Value> {
        match self.0.as_slice() {
            [value] => Some(value),
            _ => None,
        }
    }

    /// Consume the key, returning its components.
    pub fn into_values(self) -> Vec<Value> {
        self.0
    }
}

fn part_eq(a: &Value, b: &Value) -> bool {
    match (a.as_i64(), b.as_i64()) {
        (Some(x), Some(y)) => x == y,
        _ => match (a, b) {
            (Value::Double(x), Value::Double(y)) => x.to_bits() == y.to_bits(),
            _ => a == b,
        },
    }
}

fn hash_part(v: &Value, hasher: &mut impl Hasher) {
    if let Some(i) = v.as_i64() {
        1u8.hash(hasher);
        i.hash(hasher);
        return;
    }
    match v {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            2u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Double(f) => {
            3u8.hash(hasher);
            f.to_bits().hash(hasher);
        }
        Value::Text(s) => {
            4u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Bytes(b) => {
            5u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Timestamp(ts) => {
            6u8.hash(hasher);
            ts.hash(hasher);
        }
        Value::Uuid(u) => {
            7u8.hash(hasher);
            u.hash(hasher);
        }
        Value::Json(j) => {
            8u8.hash(hasher);
            j.to_string().hash(hasher);
        }
        // Integers are handled above.
        Value::Int(_) | Value::BigInt(_) => {}
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| part_eq(a, b))
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for part in &self.0 {
            hash_part(part, state);
        }
    }
}

/// Mapping from key tuple to the items sharing it.
///
/// Insertion order is preserved both across keys (`keys()` lists keys in
/// first-seen order) and within each bucket.
#[derive(Debug, Clone)]
pub struct KeyIndex<T> {
    buckets: HashMap<Key, Vec<T>>,
    order: Vec<Key>,
    skipped: usize,
}

impl<T> Default for KeyIndex<T> {
    fn default() -> Self {
        Self {
            buckets: HashMap::new(),
            order: Vec::new(),
            skipped: 0,
        }
    }
}

impl<T> KeyIndex<T> {
    /// Create an empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an index in one pass. Items for which `key_of` returns `None`
    /// (a NULL key component) are dropped and counted in [`skipped`].
    ///
    /// [`skipped`]: KeyIndex::skipped
    pub fn build<I, F>(items: I, mut key_of: F) -> Self
    where
        I: IntoIterator<Item = T>,
        F: FnMut(&T) -> Option<Key>,
    {
        let mut index = Self::new();
        for item in items {
            match key_of(&item) {
                Some(key) => index.insert(key, item),
                None => index.skipped += 1,
            }
        }
        index
    }

    /// Add an item under `key`.
    pub fn insert(&mut self, key: Key, item: T) {
        if let Some(bucket) = self.buckets.get_mut(&key) {
            bucket.push(item);
            return;
        }
        self.order.push(key.clone());
        self.buckets.insert(key, vec![item]);
    }

    /// Items sharing `key`, in insertion order.
    pub fn get(&self, key: &Key) -> Option<&[T]> {
        self.buckets.get(key).map(Vec::as_slice)
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> &[Key] {
        &self.order
    }

    /// Check whether any item is indexed under `key`.
    pub fn contains(&self, key: &Key) -> bool {
        self.buckets.contains_key(key)
    }

    /// Number of distinct keys.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// True when no item had a usable key.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Number of items dropped because their key had a NULL component.
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    /// Iterate `(key, items)` in first-seen key order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &[T])> {
        self.order
            .iter()
            .filter_map(|k| self.buckets.get(k).map(|items| (k, items.as_slice())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(parts: &[i64]) -> Key {
        Key::new(parts.iter().map(|p| Value::BigInt(*p)).collect()).unwrap()
    }

    #[test]
    fn test_null_component_rejected() {
        assert!(Key::new(vec![Value::BigInt(1), Value::Null]).is_none());
        assert!(Key::new(vec![]).is_none());
        assert!(Key::single(Value::Null).is_none());
    }

    #[test]
    fn test_integer_widths_match() {
        let a = Key::single(Value::Int(3)).unwrap();
        let b = Key::single(Value::BigInt(3)).unwrap();
        assert_eq!(a, b);

        let mut index = KeyIndex::new();
        index.insert(a, "owner");
        assert_eq!(index.get(&b), Some(&["owner"][..]));
    }

    #[test]
    fn test_composite_keys_compare_in_order() {
        assert_eq!(key(&[1, 2]), key(&[1, 2]));
        assert_ne!(key(&[1, 2]), key(&[2, 1]));
        assert_ne!(key(&[1]), key(&[1, 1]));
    }

    #[test]
    fn test_build_drops_null_keys_and_preserves_order() {
        let owners = vec![
            ("a", Some(3_i64)),
            ("b", None),
            ("c", Some(3)),
            ("d", Some(2)),
        ];
        let index = KeyIndex::build(owners, |(_, fk)| fk.and_then(Key::single));

        assert_eq!(index.len(), 2);
        assert_eq!(index.skipped(), 1);
        assert_eq!(index.keys(), &[key(&[3]), key(&[2])]);
        let bucket: Vec<_> = index.get(&key(&[3])).unwrap().iter().map(|o| o.0).collect();
        assert_eq!(bucket, vec!["a", "c"]);
        assert!(!index.contains(&key(&[1])));
    }

    #[test]
    fn test_text_keys() {
        let index = KeyIndex::build(vec!["x", "y", "x"], |s| Key::single(*s));
        assert_eq!(index.len(), 2);
        assert_eq!(index.get(&Key::single("x").unwrap()).unwrap().len(), 2);
    }
}
