//! SQL expressions for filters, join conditions and projections.
//!
//! Expressions are plain data: they render to SQL for a given [`Dialect`]
//! and are evaluated directly by [`MemoryDataset`](crate::MemoryDataset).

use crate::clause::{OrderBy, OrderDirection};
use rowgraph_core::Value;

/// SQL dialect for generating dialect-specific SQL.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Dialect {
    /// PostgreSQL dialect (uses $1, $2 placeholders)
    #[default]
    Postgres,
    /// SQLite dialect (uses ?1, ?2 placeholders)
    Sqlite,
    /// MySQL dialect (uses ? placeholders)
    Mysql,
}

impl Dialect {
    /// Generate a placeholder for the given parameter index (1-based).
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${index}"),
            Dialect::Sqlite => format!("?{index}"),
            Dialect::Mysql => "?".to_string(),
        }
    }

    /// Quote an identifier for this dialect.
    ///
    /// Embedded quote characters are doubled.
    pub fn quote_identifier(self, name: &str) -> String {
        match self {
            Dialect::Postgres | Dialect::Sqlite => {
                let escaped = name.replace('"', "\"\"");
                format!("\"{}\"", escaped)
            }
            Dialect::Mysql => {
                let escaped = name.replace('`', "``");
                format!("`{}`", escaped)
            }
        }
    }
}

/// A SQL expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Column reference with optional table qualifier
    Column {
        /// Optional table name or alias
        table: Option<String>,
        /// Column name
        name: String,
    },

    /// Literal value, bound as a parameter
    Literal(Value),

    /// Binary operation (e.g., a = b, a AND b)
    Binary {
        left: Box<Expr>,
        op: BinaryOp,
        right: Box<Expr>,
    },

    /// NOT expr
    Not(Box<Expr>),

    /// Function call; aggregates are `COUNT`, `SUM`, `MIN`, `MAX`, `AVG`
    Function { name: String, args: Vec<Expr> },

    /// Special aggregate: COUNT(*)
    CountStar,

    /// IN expression
    In {
        expr: Box<Expr>,
        values: Vec<Expr>,
        negated: bool,
    },

    /// Row-value IN: `(a, b) IN ((1, 2), (3, 4))`
    InTuple {
        exprs: Vec<Expr>,
        rows: Vec<Vec<Value>>,
    },

    /// IS NULL / IS NOT NULL
    IsNull { expr: Box<Expr>, negated: bool },

    /// Raw SQL fragment (escape hatch)
    Raw(String),

    /// Parenthesized expression
    Paren(Box<Expr>),
}

/// Binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Equal (=)
    Eq,
    /// Not equal (<>)
    Ne,
    /// Less than (<)
    Lt,
    /// Less than or equal (<=)
    Le,
    /// Greater than (>)
    Gt,
    /// Greater than or equal (>=)
    Ge,
    /// Logical AND
    And,
    /// Logical OR
    Or,
}

impl BinaryOp {
    /// Get the SQL representation of this operator.
    pub const fn as_str(&self) -> &'static str {
        match self {
            BinaryOp::Eq => "=",
            BinaryOp::Ne => "<>",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "AND",
            BinaryOp::Or => "OR",
        }
    }

    /// Whether this is a logical connective.
    pub const fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

impl Expr {
    // ==================== Constructors ====================

    /// Create a column reference expression.
    pub fn col(name: impl Into<String>) -> Self {
        Expr::Column {
            table: None,
            name: name.into(),
        }
    }

    /// Create a qualified column reference (table.column).
    pub fn qualified(table: impl Into<String>, column: impl Into<String>) -> Self {
        Expr::Column {
            table: Some(table.into()),
            name: column.into(),
        }
    }

    /// Create a literal value expression.
    pub fn lit(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    /// Create a raw SQL expression (escape hatch).
    pub fn raw(sql: impl Into<String>) -> Self {
        Expr::Raw(sql.into())
    }

    /// Conjunction of every expression; `None` for an empty input.
    pub fn all(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs.into_iter().reduce(|a, b| a.and(b))
    }

    /// Disjunction of every expression; `None` for an empty input.
    pub fn any(exprs: impl IntoIterator<Item = Expr>) -> Option<Self> {
        exprs
            .into_iter()
            .reduce(|a, b| Expr::Paren(Box::new(a.or(b))))
    }

    // ==================== Comparison Operators ====================

    fn binary(self, op: BinaryOp, other: impl Into<Expr>) -> Self {
        Expr::Binary {
            left: Box::new(self),
            op,
            right: Box::new(other.into()),
        }
    }

    /// Equal to (=)
    pub fn eq(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Eq, other)
    }

    /// Not equal to (<>)
    pub fn ne(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ne, other)
    }

    /// Less than (<)
    pub fn lt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Lt, other)
    }

    /// Less than or equal to (<=)
    pub fn le(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Le, other)
    }

    /// Greater than (>)
    pub fn gt(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Gt, other)
    }

    /// Greater than or equal to (>=)
    pub fn ge(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Ge, other)
    }

    // ==================== Logical Operators ====================

    /// Logical AND
    pub fn and(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::And, other)
    }

    /// Logical OR
    pub fn or(self, other: impl Into<Expr>) -> Self {
        self.binary(BinaryOp::Or, other)
    }

    /// Logical NOT
    pub fn not(self) -> Self {
        Expr::Not(Box::new(self))
    }

    // ==================== Null Checks ====================

    /// IS NULL
    pub fn is_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: false,
        }
    }

    /// IS NOT NULL
    pub fn is_not_null(self) -> Self {
        Expr::IsNull {
            expr: Box::new(self),
            negated: true,
        }
    }

    // ==================== Membership ====================

    /// IN list
    pub fn in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: false,
        }
    }

    /// NOT IN list
    pub fn not_in_list(self, values: Vec<impl Into<Expr>>) -> Self {
        Expr::In {
            expr: Box::new(self),
            values: values.into_iter().map(Into::into).collect(),
            negated: true,
        }
    }

    /// Key membership over one or more columns.
    ///
    /// A single column renders as `col IN (...)`, several as a row-value
    /// `(a, b) IN ((..), (..))`. Every row must have one value per column.
    pub fn key_in(columns: Vec<Expr>, rows: Vec<Vec<Value>>) -> Self {
        if columns.len() == 1 {
            let mut columns = columns;
            let column = columns.remove(0);
            let values = rows
                .into_iter()
                .filter_map(|row| row.into_iter().next())
                .map(Expr::Literal)
                .collect::<Vec<_>>();
            return Expr::In {
                expr: Box::new(column),
                values,
                negated: false,
            };
        }
        Expr::InTuple {
            exprs: columns,
            rows,
        }
    }

    // ==================== Aggregates ====================

    /// COUNT(*)
    pub fn count_star() -> Self {
        Expr::CountStar
    }

    /// COUNT(expr)
    pub fn count(self) -> Self {
        Expr::function("COUNT", vec![self])
    }

    /// SUM(expr)
    pub fn sum(self) -> Self {
        Expr::function("SUM", vec![self])
    }

    /// AVG(expr)
    pub fn avg(self) -> Self {
        Expr::function("AVG", vec![self])
    }

    /// MIN(expr)
    pub fn min(self) -> Self {
        Expr::function("MIN", vec![self])
    }

    /// MAX(expr)
    pub fn max(self) -> Self {
        Expr::function("MAX", vec![self])
    }

    /// Generic function call.
    pub fn function(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::Function {
            name: name.into(),
            args,
        }
    }

    /// True for aggregate calls (`COUNT(*)` and the aggregate functions).
    pub fn is_aggregate(&self) -> bool {
        match self {
            Expr::CountStar => true,
            Expr::Function { name, .. } => {
                matches!(
                    name.to_ascii_uppercase().as_str(),
                    "COUNT" | "SUM" | "AVG" | "MIN" | "MAX"
                )
            }
            _ => false,
        }
    }

    // ==================== Ordering ====================

    /// Create an ascending ORDER BY expression.
    pub fn asc(self) -> OrderBy {
        OrderBy::new(self, OrderDirection::Asc)
    }

    /// Create a descending ORDER BY expression.
    pub fn desc(self) -> OrderBy {
        OrderBy::new(self, OrderDirection::Desc)
    }

    // ==================== Utility ====================

    /// Wrap expression in parentheses.
    pub fn paren(self) -> Self {
        Expr::Paren(Box::new(self))
    }

    /// Qualify every unqualified column reference with `table`.
    ///
    /// Association filters are written against the target type's columns;
    /// when the target is joined under an alias the references must point
    /// at that alias.
    #[must_use]
    pub fn qualify(&self, table: &str) -> Expr {
        let q = |e: &Expr| Box::new(e.qualify(table));
        match self {
            Expr::Column { table: None, name } => Expr::qualified(table, name.clone()),
            Expr::Column { .. } | Expr::Literal(_) | Expr::Raw(_) | Expr::CountStar => {
                self.clone()
            }
            Expr::Binary { left, op, right } => Expr::Binary {
                left: q(left),
                op: *op,
                right: q(right),
            },
            Expr::Not(inner) => Expr::Not(q(inner)),
            Expr::Function { name, args } => Expr::Function {
                name: name.clone(),
                args: args.iter().map(|a| a.qualify(table)).collect(),
            },
            Expr::In {
                expr,
                values,
                negated,
            } => Expr::In {
                expr: q(expr),
                values: values.iter().map(|v| v.qualify(table)).collect(),
                negated: *negated,
            },
            Expr::InTuple { exprs, rows } => Expr::InTuple {
                exprs: exprs.iter().map(|e| e.qualify(table)).collect(),
                rows: rows.clone(),
            },
            Expr::IsNull { expr, negated } => Expr::IsNull {
                expr: q(expr),
                negated: *negated,
            },
            Expr::Paren(inner) => Expr::Paren(q(inner)),
        }
    }

    // ==================== SQL Generation ====================

    /// Build SQL string and collect parameters (default PostgreSQL dialect).
    pub fn build(&self, params: &mut Vec<Value>, offset: usize) -> String {
        self.build_with_dialect(Dialect::Postgres, params, offset)
    }

    /// Build SQL string with specific dialect.
    pub fn build_with_dialect(
        &self,
        dialect: Dialect,
        params: &mut Vec<Value>,
        offset: usize,
    ) -> String {
        match self {
            Expr::Column { table, name } => {
                if let Some(t) = table {
                    format!(
                        "{}.{}",
                        dialect.quote_identifier(t),
                        dialect.quote_identifier(name)
                    )
                } else {
                    dialect.quote_identifier(name)
                }
            }

            Expr::Literal(value) => {
                params.push(value.clone());
                dialect.placeholder(offset + params.len())
            }

            Expr::Binary { left, op, right } => {
                let left_sql = left.build_with_dialect(dialect, params, offset);
                let right_sql = right.build_with_dialect(dialect, params, offset);
                format!("{left_sql} {} {right_sql}", op.as_str())
            }

            Expr::Not(expr) => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                format!("NOT {expr_sql}")
            }

            Expr::Function { name, args } => {
                let arg_sqls: Vec<_> = args
                    .iter()
                    .map(|a| a.build_with_dialect(dialect, params, offset))
                    .collect();
                format!("{name}({})", arg_sqls.join(", "))
            }

            Expr::CountStar => "COUNT(*)".to_string(),

            Expr::In {
                expr,
                values,
                negated,
            } => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                let not_str = if *negated { "NOT " } else { "" };
                if values.is_empty() {
                    // `x IN ()` is invalid SQL; an empty list matches nothing.
                    return if *negated { "1 = 1" } else { "1 = 0" }.to_string();
                }
                let value_sqls: Vec<_> = values
                    .iter()
                    .map(|v| v.build_with_dialect(dialect, params, offset))
                    .collect();
                format!("{expr_sql} {not_str}IN ({})", value_sqls.join(", "))
            }

            Expr::InTuple { exprs, rows } => {
                if rows.is_empty() {
                    return "1 = 0".to_string();
                }
                let cols: Vec<_> = exprs
                    .iter()
                    .map(|e| e.build_with_dialect(dialect, params, offset))
                    .collect();
                let tuples: Vec<_> = rows
                    .iter()
                    .map(|row| {
                        let parts: Vec<_> = row
                            .iter()
                            .map(|v| {
                                params.push(v.clone());
                                dialect.placeholder(offset + params.len())
                            })
                            .collect();
                        format!("({})", parts.join(", "))
                    })
                    .collect();
                format!("({}) IN ({})", cols.join(", "), tuples.join(", "))
            }

            Expr::IsNull { expr, negated } => {
                let expr_sql = expr.build_with_dialect(dialect, params, offset);
                let not_str = if *negated { " NOT" } else { "" };
                format!("{expr_sql} IS{not_str} NULL")
            }

            Expr::Raw(sql) => sql.clone(),

            Expr::Paren(expr) => {
                let inner = expr.build_with_dialect(dialect, params, offset);
                format!("({inner})")
            }
        }
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Literal(v)
    }
}

impl From<&str> for Expr {
    fn from(s: &str) -> Self {
        Expr::Literal(Value::Text(s.to_string()))
    }
}

impl From<String> for Expr {
    fn from(s: String) -> Self {
        Expr::Literal(Value::Text(s))
    }
}

impl From<i32> for Expr {
    fn from(n: i32) -> Self {
        Expr::Literal(Value::Int(n))
    }
}

impl From<i64> for Expr {
    fn from(n: i64) -> Self {
        Expr::Literal(Value::BigInt(n))
    }
}

impl From<bool> for Expr {
    fn from(b: bool) -> Self {
        Expr::Literal(Value::Bool(b))
    }
}

impl From<f64> for Expr {
    fn from(n: f64) -> Self {
        Expr::Literal(Value::Double(n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_equality() {
        let mut params = Vec::new();
        let sql = Expr::qualified("albums", "artist_id")
            .eq(Expr::qualified("artists", "id"))
            .build(&mut params, 0);
        assert_eq!(sql, "\"albums\".\"artist_id\" = \"artists\".\"id\"");
        assert!(params.is_empty());
    }

    #[test]
    fn test_in_list_placeholders_per_dialect() {
        let expr = Expr::col("id").in_list(vec![1_i64, 2, 3]);

        let mut params = Vec::new();
        let pg = expr.build_with_dialect(Dialect::Postgres, &mut params, 0);
        assert_eq!(pg, "\"id\" IN ($1, $2, $3)");
        assert_eq!(params.len(), 3);

        let mut params = Vec::new();
        let my = expr.build_with_dialect(Dialect::Mysql, &mut params, 0);
        assert_eq!(my, "`id` IN (?, ?, ?)");
    }

    #[test]
    fn test_empty_in_matches_nothing() {
        let mut params = Vec::new();
        let sql = Expr::col("id")
            .in_list(Vec::<Expr>::new())
            .build(&mut params, 0);
        assert_eq!(sql, "1 = 0");
    }

    #[test]
    fn test_key_in_composite() {
        let expr = Expr::key_in(
            vec![Expr::col("a"), Expr::col("b")],
            vec![
                vec![Value::BigInt(1), Value::BigInt(2)],
                vec![Value::BigInt(3), Value::BigInt(4)],
            ],
        );
        let mut params = Vec::new();
        let sql = expr.build_with_dialect(Dialect::Sqlite, &mut params, 0);
        assert_eq!(sql, "(\"a\", \"b\") IN ((?1, ?2), (?3, ?4))");
        assert_eq!(params.len(), 4);
    }

    #[test]
    fn test_key_in_single_column_uses_plain_in() {
        let expr = Expr::key_in(vec![Expr::col("id")], vec![vec![Value::BigInt(7)]]);
        assert!(matches!(expr, Expr::In { .. }));
    }

    #[test]
    fn test_any_wraps_disjunctions() {
        let expr = Expr::any(vec![
            Expr::col("a").eq(1_i64),
            Expr::col("b").eq(1_i64),
        ])
        .unwrap();
        let mut params = Vec::new();
        let sql = expr.build(&mut params, 0);
        assert_eq!(sql, "(\"a\" = $1 OR \"b\" = $2)");
    }

    #[test]
    fn test_qualify_only_touches_bare_columns() {
        let expr = Expr::col("published")
            .eq(true)
            .and(Expr::qualified("artists", "id").is_not_null());
        let qualified = expr.qualify("albums_0");
        let mut params = Vec::new();
        let sql = qualified.build(&mut params, 0);
        assert_eq!(
            sql,
            "\"albums_0\".\"published\" = $1 AND \"artists\".\"id\" IS NOT NULL"
        );
    }

    #[test]
    fn test_aggregate_detection() {
        assert!(Expr::count_star().is_aggregate());
        assert!(Expr::col("x").sum().is_aggregate());
        assert!(!Expr::col("x").is_aggregate());
    }
}
