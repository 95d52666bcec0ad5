//! ORDER BY clause types.

use crate::expr::{Dialect, Expr};
use rowgraph_core::Value;

/// ORDER BY clause.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    /// Sort expression (usually a column).
    pub expr: Expr,
    /// Sort direction.
    pub direction: OrderDirection,
    /// Explicit NULL placement.
    pub nulls: Option<NullsOrder>,
}

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

/// NULLS FIRST/LAST ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NullsOrder {
    First,
    Last,
}

impl OrderBy {
    /// Create an ORDER BY item.
    pub fn new(expr: Expr, direction: OrderDirection) -> Self {
        Self {
            expr,
            direction,
            nulls: None,
        }
    }

    /// Create an ascending order by clause on a column.
    pub fn asc(column: impl Into<String>) -> Self {
        Self::new(Expr::col(column), OrderDirection::Asc)
    }

    /// Create a descending order by clause on a column.
    pub fn desc(column: impl Into<String>) -> Self {
        Self::new(Expr::col(column), OrderDirection::Desc)
    }

    /// Set NULLS FIRST.
    pub fn nulls_first(mut self) -> Self {
        self.nulls = Some(NullsOrder::First);
        self
    }

    /// Set NULLS LAST.
    pub fn nulls_last(mut self) -> Self {
        self.nulls = Some(NullsOrder::Last);
        self
    }

    /// Same ordering with unqualified columns pointed at `table`.
    #[must_use]
    pub fn qualify(&self, table: &str) -> Self {
        Self {
            expr: self.expr.qualify(table),
            direction: self.direction,
            nulls: self.nulls,
        }
    }

    /// Whether NULLs sort before non-NULL values.
    ///
    /// Without an explicit placement NULLs sort last ascending and first
    /// descending (PostgreSQL semantics).
    pub fn nulls_sort_first(&self) -> bool {
        match (self.nulls, self.direction) {
            (Some(NullsOrder::First), _) => true,
            (Some(NullsOrder::Last), _) => false,
            (None, OrderDirection::Asc) => false,
            (None, OrderDirection::Desc) => true,
        }
    }

    /// Generate SQL for this ORDER BY item.
    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        let mut sql = self.expr.build_with_dialect(dialect, params, offset);

        sql.push_str(match self.direction {
            OrderDirection::Asc => " ASC",
            OrderDirection::Desc => " DESC",
        });

        if let Some(nulls) = self.nulls {
            sql.push_str(match nulls {
                NullsOrder::First => " NULLS FIRST",
                NullsOrder::Last => " NULLS LAST",
            });
        }

        sql
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_by_sql() {
        let mut params = Vec::new();
        let sql = OrderBy::desc("position")
            .nulls_last()
            .build_with_dialect(Dialect::Postgres, &mut params, 0);
        assert_eq!(sql, "\"position\" DESC NULLS LAST");
    }

    #[test]
    fn test_default_null_placement() {
        assert!(!OrderBy::asc("a").nulls_sort_first());
        assert!(OrderBy::desc("a").nulls_sort_first());
        assert!(OrderBy::asc("a").nulls_first().nulls_sort_first());
    }
}
