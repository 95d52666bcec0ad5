//! Record type metadata.

/// Static description of a record type: its name, backing table, primary key
/// and column list.
///
/// `ModelInfo` values are declared once (usually as `const`s) and registered
/// with the session registry; every loaded [`Record`](crate::Record) carries
/// a copy so that keys can be extracted without a registry lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelInfo {
    /// Type name used for registry lookups and polymorphic discriminators.
    pub name: &'static str,
    /// Table (or view) the records are read from.
    pub table: &'static str,
    /// Primary key columns, in declared order.
    pub primary_key: &'static [&'static str],
    /// All columns; used to build aliased graph-join projections.
    pub columns: &'static [&'static str],
}

impl ModelInfo {
    /// Create metadata with an `id` primary key and no declared columns.
    #[must_use]
    pub const fn new(name: &'static str, table: &'static str) -> Self {
        Self {
            name,
            table,
            primary_key: &["id"],
            columns: &[],
        }
    }

    /// Set the primary key columns (composite keys list several).
    #[must_use]
    pub const fn primary_key(mut self, columns: &'static [&'static str]) -> Self {
        self.primary_key = columns;
        self
    }

    /// Set the column list.
    #[must_use]
    pub const fn columns(mut self, columns: &'static [&'static str]) -> Self {
        self.columns = columns;
        self
    }

    /// Number of primary key columns.
    #[must_use]
    pub const fn key_arity(&self) -> usize {
        self.primary_key.len()
    }

    /// Check whether a column is declared on this type.
    #[must_use]
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.contains(&name)
    }
}
