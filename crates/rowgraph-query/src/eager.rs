//! Eager-load request trees.
//!
//! An [`EagerTree`] names the associations to resolve for a set of records
//! and, per association, the nested associations to resolve on the loaded
//! targets. Trees are built per call and discarded afterwards.
//!
//! ```ignore
//! let tree = EagerTree::new()
//!     .include_path("albums.tracks")
//!     .include_path("albums.tags")
//!     .include("label");
//! ```

use crate::expr::Expr;

/// A requested association with its nested request.
#[derive(Debug, Clone, PartialEq)]
pub struct EagerEntry {
    /// Association name on the owning type.
    pub name: String,
    /// Extra filter for this association's query (ANDed with the
    /// association's own filter).
    pub filter: Option<Expr>,
    /// Associations to load on the targets.
    pub nested: EagerTree,
}

/// Association name → nested request tree, in request order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EagerTree {
    entries: Vec<EagerEntry>,
}

impl EagerTree {
    /// Create an empty tree.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Include one association.
    #[must_use]
    pub fn include(self, name: impl Into<String>) -> Self {
        self.include_with(name, EagerTree::new())
    }

    /// Include an association and a nested request for its targets.
    #[must_use]
    pub fn include_with(mut self, name: impl Into<String>, nested: EagerTree) -> Self {
        self.merge_entry(EagerEntry {
            name: name.into(),
            filter: None,
            nested,
        });
        self
    }

    /// Include an association with an extra per-call filter.
    #[must_use]
    pub fn include_filtered(
        mut self,
        name: impl Into<String>,
        filter: Expr,
        nested: EagerTree,
    ) -> Self {
        self.merge_entry(EagerEntry {
            name: name.into(),
            filter: Some(filter),
            nested,
        });
        self
    }

    /// Include a dotted path (e.g., "albums.tracks.genre").
    ///
    /// Empty segments are ignored; paths sharing a prefix merge.
    #[must_use]
    pub fn include_path(mut self, path: &str) -> Self {
        let parts: Vec<&str> = path
            .trim()
            .split('.')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        if let Some(entry) = Self::build_nested_path(&parts) {
            self.merge_entry(entry);
        }
        self
    }

    fn build_nested_path(parts: &[&str]) -> Option<EagerEntry> {
        let (first, rest) = parts.split_first()?;
        let mut nested = EagerTree::new();
        if let Some(child) = Self::build_nested_path(rest) {
            nested.entries.push(child);
        }
        Some(EagerEntry {
            name: (*first).to_string(),
            filter: None,
            nested,
        })
    }

    fn merge_entry(&mut self, entry: EagerEntry) {
        match self.entries.iter_mut().find(|e| e.name == entry.name) {
            Some(existing) => {
                existing.filter = match (existing.filter.take(), entry.filter) {
                    (Some(a), Some(b)) => Some(a.and(b)),
                    (a, b) => a.or(b),
                };
                for child in entry.nested.entries {
                    existing.nested.merge_entry(child);
                }
            }
            None => self.entries.push(entry),
        }
    }

    /// Merge another tree into this one.
    #[must_use]
    pub fn merge(mut self, other: EagerTree) -> Self {
        for entry in other.entries {
            self.merge_entry(entry);
        }
        self
    }

    /// Requested associations in order.
    pub fn entries(&self) -> &[EagerEntry] {
        &self.entries
    }

    /// Look up the request for `name`.
    pub fn get(&self, name: &str) -> Option<&EagerEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    /// Check if nothing is requested.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of associations requested at this level.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Deepest nesting level (0 for an empty tree).
    pub fn depth(&self) -> usize {
        self.entries
            .iter()
            .map(|e| 1 + e.nested.depth())
            .max()
            .unwrap_or(0)
    }
}
