//! JOIN clause types.

use crate::expr::{Dialect, Expr};
use rowgraph_core::Value;

/// A JOIN clause.
#[derive(Debug, Clone, PartialEq)]
pub struct Join {
    /// Type of join
    pub join_type: JoinType,
    /// Table to join
    pub table: String,
    /// Optional table alias
    pub alias: Option<String>,
    /// How rows are matched
    pub condition: JoinCondition,
}

/// Types of SQL joins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    #[default]
    Left,
    Right,
    Full,
    Cross,
}

impl JoinType {
    /// Get the SQL keyword for this join type.
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Full => "FULL JOIN",
            JoinType::Cross => "CROSS JOIN",
        }
    }

    /// Whether unmatched rows of the left side are kept.
    pub const fn keeps_left(&self) -> bool {
        matches!(self, JoinType::Left | JoinType::Full)
    }

    /// Whether unmatched rows of the joined table are kept.
    pub const fn keeps_right(&self) -> bool {
        matches!(self, JoinType::Right | JoinType::Full)
    }
}

/// Join condition.
#[derive(Debug, Clone, PartialEq)]
pub enum JoinCondition {
    /// `ON <expr>`
    On(Expr),
    /// `USING (col, ...)`: equality on same-named columns
    Using(Vec<String>),
    /// `NATURAL`: equality on every shared column name
    Natural,
    /// No condition (cross product)
    None,
}

impl Join {
    /// Create a join of any type with an ON condition.
    pub fn new(join_type: JoinType, table: impl Into<String>, on: Expr) -> Self {
        Self {
            join_type,
            table: table.into(),
            alias: None,
            condition: JoinCondition::On(on),
        }
    }

    /// Create an INNER JOIN.
    pub fn inner(table: impl Into<String>, on: Expr) -> Self {
        Self::new(JoinType::Inner, table, on)
    }

    /// Create a LEFT JOIN.
    pub fn left(table: impl Into<String>, on: Expr) -> Self {
        Self::new(JoinType::Left, table, on)
    }

    /// Create a RIGHT JOIN.
    pub fn right(table: impl Into<String>, on: Expr) -> Self {
        Self::new(JoinType::Right, table, on)
    }

    /// Create a FULL OUTER JOIN.
    pub fn full(table: impl Into<String>, on: Expr) -> Self {
        Self::new(JoinType::Full, table, on)
    }

    /// Create a CROSS JOIN.
    pub fn cross(table: impl Into<String>) -> Self {
        Self {
            join_type: JoinType::Cross,
            table: table.into(),
            alias: None,
            condition: JoinCondition::None,
        }
    }

    /// Create a `JOIN ... USING (columns)`.
    pub fn using(join_type: JoinType, table: impl Into<String>, columns: Vec<String>) -> Self {
        Self {
            join_type,
            table: table.into(),
            alias: None,
            condition: JoinCondition::Using(columns),
        }
    }

    /// Create a `NATURAL ... JOIN`.
    pub fn natural(join_type: JoinType, table: impl Into<String>) -> Self {
        Self {
            join_type,
            table: table.into(),
            alias: None,
            condition: JoinCondition::Natural,
        }
    }

    /// Set an alias for the joined table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the joined table is referenced by (alias, else table name).
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Generate SQL and collect parameters with a specific dialect.
    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        let natural = if self.condition == JoinCondition::Natural {
            " NATURAL"
        } else {
            ""
        };
        let mut sql = format!(
            "{} {} {}",
            natural,
            self.join_type.as_str(),
            dialect.quote_identifier(&self.table)
        );

        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&dialect.quote_identifier(alias));
        }

        match &self.condition {
            JoinCondition::On(on) => {
                let on_sql = on.build_with_dialect(dialect, params, offset);
                sql.push_str(" ON ");
                sql.push_str(&on_sql);
            }
            JoinCondition::Using(columns) => {
                let cols: Vec<_> = columns
                    .iter()
                    .map(|c| dialect.quote_identifier(c))
                    .collect();
                sql.push_str(&format!(" USING ({})", cols.join(", ")));
            }
            JoinCondition::Natural | JoinCondition::None => {}
        }

        sql
    }
}
