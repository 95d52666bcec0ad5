//! The query model handed to a [`Dataset`](crate::Dataset).
//!
//! A `Query` is a single SELECT: one base table, an ordered list of joins,
//! an optional filter, grouping, ordering and a limit. Loaders build these
//! values; datasets either render them with [`Query::to_sql`] or evaluate
//! them directly.

use crate::clause::OrderBy;
use crate::expr::{Dialect, Expr};
use crate::join::Join;
use rowgraph_core::Value;

/// One item of the SELECT list.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectItem {
    /// `table.*` for a table name or alias
    AllFrom(String),
    /// `expr [AS alias]`
    Expr { expr: Expr, alias: Option<String> },
}

impl SelectItem {
    /// Aliased expression.
    pub fn aliased(expr: Expr, alias: impl Into<String>) -> Self {
        SelectItem::Expr {
            expr,
            alias: Some(alias.into()),
        }
    }

    /// Name the output column carries.
    ///
    /// Aliased items use their alias; bare columns use the column name;
    /// anything else uses its SQL text.
    pub fn output_name(&self) -> Option<String> {
        match self {
            SelectItem::AllFrom(_) => None,
            SelectItem::Expr {
                alias: Some(alias), ..
            } => Some(alias.clone()),
            SelectItem::Expr {
                expr: Expr::Column { name, .. },
                alias: None,
            } => Some(name.clone()),
            SelectItem::Expr { expr, alias: None } => {
                let mut params = Vec::new();
                Some(expr.build(&mut params, 0))
            }
        }
    }
}

/// A SELECT query.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    /// Base table
    pub table: String,
    /// Optional alias for the base table
    pub alias: Option<String>,
    /// SELECT list; empty means `<base>.*`
    pub columns: Vec<SelectItem>,
    /// DISTINCT flag
    pub distinct: bool,
    /// Joins, applied in order
    pub joins: Vec<Join>,
    /// WHERE clause
    pub filter: Option<Expr>,
    /// GROUP BY expressions
    pub group_by: Vec<Expr>,
    /// ORDER BY items
    pub order_by: Vec<OrderBy>,
    /// LIMIT
    pub limit: Option<u64>,
}

impl Query {
    /// `SELECT table.* FROM table`.
    pub fn from(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: None,
            columns: Vec::new(),
            distinct: false,
            joins: Vec::new(),
            filter: None,
            group_by: Vec::new(),
            order_by: Vec::new(),
            limit: None,
        }
    }

    /// Set an alias for the base table.
    pub fn alias(mut self, alias: impl Into<String>) -> Self {
        self.alias = Some(alias.into());
        self
    }

    /// Name the base table is referenced by.
    pub fn reference_name(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.table)
    }

    /// Append a SELECT item.
    pub fn select(mut self, item: SelectItem) -> Self {
        self.columns.push(item);
        self
    }

    /// Append `table.*`.
    pub fn select_all_from(self, table: impl Into<String>) -> Self {
        self.select(SelectItem::AllFrom(table.into()))
    }

    /// Append `expr AS alias`.
    pub fn select_as(self, expr: Expr, alias: impl Into<String>) -> Self {
        self.select(SelectItem::aliased(expr, alias))
    }

    /// Mark the query DISTINCT.
    pub fn distinct(mut self) -> Self {
        self.distinct = true;
        self
    }

    /// Append a join.
    pub fn join(mut self, join: Join) -> Self {
        self.joins.push(join);
        self
    }

    /// AND a condition into the WHERE clause.
    pub fn filter(mut self, expr: Expr) -> Self {
        self.filter = Some(match self.filter.take() {
            Some(existing) => existing.and(expr),
            None => expr,
        });
        self
    }

    /// Append a GROUP BY expression.
    pub fn group_by(mut self, expr: Expr) -> Self {
        self.group_by.push(expr);
        self
    }

    /// Append an ORDER BY item.
    pub fn order_by(mut self, order: OrderBy) -> Self {
        self.order_by.push(order);
        self
    }

    /// Set LIMIT.
    pub fn limit(mut self, n: u64) -> Self {
        self.limit = Some(n);
        self
    }

    /// True when any SELECT item is an aggregate or GROUP BY is set.
    pub fn is_grouped(&self) -> bool {
        !self.group_by.is_empty()
            || self.columns.iter().any(|item| match item {
                SelectItem::Expr { expr, .. } => expr.is_aggregate(),
                SelectItem::AllFrom(_) => false,
            })
    }

    /// Render SQL with the default dialect.
    pub fn to_sql(&self) -> (String, Vec<Value>) {
        self.to_sql_with_dialect(Dialect::default())
    }

    /// Render SQL and collect parameters for `dialect`.
    pub fn to_sql_with_dialect(&self, dialect: Dialect) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }

        if self.columns.is_empty() {
            sql.push_str(&format!(
                "{}.*",
                dialect.quote_identifier(self.reference_name())
            ));
        } else {
            let items: Vec<String> = self
                .columns
                .iter()
                .map(|item| match item {
                    SelectItem::AllFrom(t) => format!("{}.*", dialect.quote_identifier(t)),
                    SelectItem::Expr { expr, alias } => {
                        let expr_sql = expr.build_with_dialect(dialect, &mut params, 0);
                        match alias {
                            Some(a) => format!("{expr_sql} AS {}", dialect.quote_identifier(a)),
                            None => expr_sql,
                        }
                    }
                })
                .collect();
            sql.push_str(&items.join(", "));
        }

        sql.push_str(" FROM ");
        sql.push_str(&dialect.quote_identifier(&self.table));
        if let Some(alias) = &self.alias {
            sql.push_str(" AS ");
            sql.push_str(&dialect.quote_identifier(alias));
        }

        for join in &self.joins {
            sql.push_str(&join.build_with_dialect(dialect, &mut params, 0));
        }

        if let Some(filter) = &self.filter {
            sql.push_str(" WHERE ");
            sql.push_str(&filter.build_with_dialect(dialect, &mut params, 0));
        }

        if !self.group_by.is_empty() {
            let groups: Vec<_> = self
                .group_by
                .iter()
                .map(|g| g.build_with_dialect(dialect, &mut params, 0))
                .collect();
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }

        if !self.order_by.is_empty() {
            let orders: Vec<_> = self
                .order_by
                .iter()
                .map(|o| o.build_with_dialect(dialect, &mut params, 0))
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&orders.join(", "));
        }

        if let Some(limit) = self.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        (sql, params)
    }
}
