//! Result rows as returned by a dataset.

use crate::Result;
use crate::error::{Error, TypeError};
use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Separator between a table alias and a column name in graph-join projections
/// (`artist__name`).
pub const ALIAS_SEPARATOR: &str = "__";

/// Column metadata shared across all rows in a result set.
///
/// This struct is wrapped in `Arc` so all rows from the same query share
/// the same column information.
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    /// Column names in order
    names: Vec<String>,
    /// Name -> index mapping for O(1) lookup
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create new column info from a list of column names.
    pub fn new(names: Vec<String>) -> Self {
        let name_to_index = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        Self {
            names,
            name_to_index,
        }
    }

    /// Get the number of columns.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no columns.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get all column names.
    pub fn names(&self) -> &[String] {
        &self.names
    }
}

/// A single row returned from a dataset.
#[derive(Debug, Clone)]
pub struct Row {
    /// Column values in order
    values: Vec<Value>,
    /// Shared column metadata
    columns: Arc<ColumnInfo>,
}

impl Row {
    /// Create a new row with the given columns and values.
    ///
    /// For multiple rows from the same result set, prefer `with_columns`
    /// to share the column metadata.
    pub fn new(column_names: Vec<String>, values: Vec<Value>) -> Self {
        let columns = Arc::new(ColumnInfo::new(column_names));
        Self { values, columns }
    }

    /// Create a new row with shared column metadata.
    pub fn with_columns(columns: Arc<ColumnInfo>, values: Vec<Value>) -> Self {
        Self { values, columns }
    }

    /// Build a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (names, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self::new(names, values)
    }

    /// Get the shared column metadata.
    pub fn column_info(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    /// Get the number of columns in this row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if this row is empty.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Get a value by column index.
    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    /// Get a value by column name.
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns.index_of(name).and_then(|i| self.values.get(i))
    }

    /// Check if a column exists by name.
    pub fn contains_column(&self, name: &str) -> bool {
        self.columns.index_of(name).is_some()
    }

    /// Get a typed value by column name.
    pub fn get_named<T>(&self, name: &str) -> Result<T>
    where
        T: TryFrom<Value, Error = Error>,
    {
        let value = self.get_by_name(name).ok_or_else(|| {
            Error::Type(TypeError {
                expected: std::any::type_name::<T>(),
                actual: format!("column '{}' not found", name),
                column: Some(name.to_string()),
            })
        })?;
        T::try_from(value.clone()).map_err(|e| match e {
            Error::Type(mut te) => {
                te.column = Some(name.to_string());
                Error::Type(te)
            }
            e => e,
        })
    }

    /// Set a column value, appending the column if it does not exist yet.
    pub fn set(&mut self, name: &str, value: Value) {
        if let Some(idx) = self.columns.index_of(name) {
            self.values[idx] = value;
            return;
        }
        let mut names = self.columns.names().to_vec();
        names.push(name.to_string());
        self.columns = Arc::new(ColumnInfo::new(names));
        self.values.push(value);
    }

    /// Get all column names.
    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.names().iter().map(String::as_str)
    }

    /// Iterate over (column_name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns
            .names()
            .iter()
            .map(String::as_str)
            .zip(self.values.iter())
    }

    /// Extract the columns projected under `alias` (`alias__column`) into a
    /// new row with the prefix stripped.
    ///
    /// Returns `None` when the row carries no column for that alias.
    pub fn split_alias(&self, alias: &str) -> Option<Row> {
        let prefix = format!("{alias}{ALIAS_SEPARATOR}");
        let (names, values): (Vec<String>, Vec<Value>) = self
            .iter()
            .filter_map(|(name, value)| {
                name.strip_prefix(&prefix)
                    .map(|col| (col.to_string(), value.clone()))
            })
            .unzip();
        if names.is_empty() {
            None
        } else {
            Some(Row::new(names, values))
        }
    }

    /// True when every value in the row is NULL (an unmatched outer join side).
    pub fn all_null(&self) -> bool {
        self.values.iter().all(Value::is_null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_by_name() {
        let row = Row::from_pairs([("id", Value::BigInt(1)), ("name", "Ann".into())]);
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(1)));
        assert!(row.get_by_name("missing").is_none());
        let name: String = row.get_named("name").unwrap();
        assert_eq!(name, "Ann");
    }

    #[test]
    fn test_get_named_wrong_type_reports_column() {
        let row = Row::from_pairs([("id", Value::Text("x".into()))]);
        let err = row.get_named::<i64>("id").unwrap_err();
        match err {
            Error::Type(te) => assert_eq!(te.column.as_deref(), Some("id")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_set_existing_and_new_column() {
        let mut row = Row::from_pairs([("id", Value::BigInt(1))]);
        row.set("id", Value::BigInt(2));
        row.set("artist_id", Value::BigInt(9));
        assert_eq!(row.get_by_name("id"), Some(&Value::BigInt(2)));
        assert_eq!(row.get_by_name("artist_id"), Some(&Value::BigInt(9)));
        assert_eq!(row.len(), 2);
    }

    #[test]
    fn test_split_alias() {
        let row = Row::from_pairs([
            ("albums__id", Value::BigInt(1)),
            ("albums__name", Value::Text("A".into())),
            ("artist__id", Value::Null),
        ]);
        let album = row.split_alias("albums").unwrap();
        assert_eq!(album.len(), 2);
        assert_eq!(album.get_by_name("name"), Some(&Value::Text("A".into())));
        assert!(row.split_alias("artist").unwrap().all_null());
        assert!(row.split_alias("tracks").is_none());
    }
}
