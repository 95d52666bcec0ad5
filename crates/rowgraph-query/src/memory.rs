//! In-memory dataset.
//!
//! `MemoryDataset` stores rows per table and evaluates [`Query`] values
//! directly: joins of every kind (including USING / NATURAL / CROSS),
//! three-valued filters, grouping with aggregates, ordering, DISTINCT and
//! LIMIT. Every executed query is logged so callers can assert how many
//! round trips an operation took.

use crate::clause::OrderBy;
use crate::dataset::{BoxFuture, Dataset};
use crate::expr::{BinaryOp, Expr};
use crate::join::{Join, JoinCondition};
use crate::query::{Query, SelectItem};
use rowgraph_core::error::{QueryError, QueryErrorKind};
use rowgraph_core::{ColumnInfo, Cx, Error, Outcome, Result, Row, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

#[derive(Debug, Default, Clone)]
struct Table {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl Table {
    fn absorb_columns(&mut self, row: &Row) {
        for name in row.column_names() {
            if !self.columns.iter().any(|c| c == name) {
                self.columns.push(name.to_string());
            }
        }
    }
}

/// One FROM item in scope: its reference name and column list.
#[derive(Debug, Clone)]
struct Source {
    name: String,
    columns: Vec<String>,
}

/// Joined tuple; `None` marks a NULL-extended side of an outer join.
type Tuple = Vec<Option<Row>>;

/// An in-memory table store that evaluates queries.
#[derive(Debug, Default)]
pub struct MemoryDataset {
    tables: RwLock<HashMap<String, Table>>,
    log: Mutex<Vec<Query>>,
    failing: Mutex<HashSet<String>>,
}

impl MemoryDataset {
    /// Create an empty dataset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a table's columns up front (useful for empty tables).
    pub fn define(&self, table: &str, columns: &[&str]) {
        let mut tables = self.tables_mut();
        let entry = tables.entry(table.to_string()).or_default();
        for c in columns {
            if !entry.columns.iter().any(|existing| existing == c) {
                entry.columns.push((*c).to_string());
            }
        }
    }

    /// Append a row to `table`.
    pub fn insert(&self, table: &str, row: Row) {
        let mut tables = self.tables_mut();
        let entry = tables.entry(table.to_string()).or_default();
        entry.absorb_columns(&row);
        entry.rows.push(row);
    }

    /// Append a row built from `(column, value)` pairs.
    pub fn insert_pairs<I, K, V>(&self, table: &str, pairs: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.insert(table, Row::from_pairs(pairs));
    }

    /// Set `column` to `value` on every row of `table` where `key_column`
    /// equals `key`. Returns the number of rows changed.
    pub fn update(
        &self,
        table: &str,
        key_column: &str,
        key: &Value,
        column: &str,
        value: Value,
    ) -> usize {
        let mut tables = self.tables_mut();
        let Some(entry) = tables.get_mut(table) else {
            return 0;
        };
        let mut changed = 0;
        for row in &mut entry.rows {
            if row.get_by_name(key_column).is_some_and(|v| v.sql_eq(key)) {
                row.set(column, value.clone());
                changed += 1;
            }
        }
        if changed > 0 && !entry.columns.iter().any(|c| c == column) {
            entry.columns.push(column.to_string());
        }
        changed
    }

    /// Number of rows currently stored in `table`.
    pub fn row_count(&self, table: &str) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(table)
            .map_or(0, |t| t.rows.len())
    }

    /// Make every query touching `table` fail with a database error.
    pub fn fail_on(&self, table: &str) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(table.to_string());
    }

    /// Stop failing queries.
    pub fn clear_failures(&self) {
        self.failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of queries executed (including failed ones).
    pub fn query_count(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Executed queries in order.
    pub fn queries(&self) -> Vec<Query> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Forget the query log.
    pub fn reset_log(&self) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn tables_mut(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Table>> {
        self.tables.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Evaluate `query` synchronously. Does not touch the query log.
    pub fn execute(&self, query: &Query) -> Result<Vec<Row>> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let touched = std::iter::once(&query.table).chain(query.joins.iter().map(|j| &j.table));
        for table in touched {
            if failing.contains(table) {
                return Err(query_error(
                    QueryErrorKind::Database,
                    query,
                    format!("simulated failure reading '{table}'"),
                ));
            }
        }

        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let base = tables.get(&query.table).ok_or_else(|| {
            query_error(
                QueryErrorKind::NotFound,
                query,
                format!("no such table: {}", query.table),
            )
        })?;

        let mut layout = vec![Source {
            name: query.reference_name().to_string(),
            columns: base.columns.clone(),
        }];
        let mut tuples: Vec<Tuple> = base.rows.iter().map(|r| vec![Some(r.clone())]).collect();

        for join in &query.joins {
            let right = tables.get(&join.table).ok_or_else(|| {
                query_error(
                    QueryErrorKind::NotFound,
                    query,
                    format!("no such table: {}", join.table),
                )
            })?;
            tuples = apply_join(&layout, tuples, join, right).map_err(|e| with_sql(e, query))?;
            layout.push(Source {
                name: join.reference_name().to_string(),
                columns: right.columns.clone(),
            });
        }
        drop(tables);

        if let Some(filter) = &query.filter {
            let mut kept = Vec::with_capacity(tuples.len());
            for tuple in tuples {
                if truthy(&eval(filter, &layout, &tuple).map_err(|e| with_sql(e, query))?) {
                    kept.push(tuple);
                }
            }
            tuples = kept;
        }

        let names = output_names(query, &layout);
        let columns = Arc::new(ColumnInfo::new(names));

        let mut rows = if query.is_grouped() {
            project_groups(query, &layout, tuples, &columns).map_err(|e| with_sql(e, query))?
        } else {
            project_rows(query, &layout, tuples, &columns).map_err(|e| with_sql(e, query))?
        };

        if query.distinct {
            let mut unique: Vec<Row> = Vec::with_capacity(rows.len());
            for row in rows {
                if !unique
                    .iter()
                    .any(|u| u.iter().map(|(_, v)| v).eq(row.iter().map(|(_, v)| v)))
                {
                    unique.push(row);
                }
            }
            rows = unique;
        }

        if let Some(limit) = query.limit {
            rows.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
        }

        Ok(rows)
    }
}

impl Dataset for MemoryDataset {
    fn fetch<'a>(&'a self, _cx: &'a Cx, query: &'a Query) -> BoxFuture<'a, Vec<Row>> {
        Box::pin(async move {
            let (sql, params) = query.to_sql();
            tracing::trace!(sql = %sql, params = params.len(), "Executing query");
            self.log
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(query.clone());
            match self.execute(query) {
                Ok(rows) => Outcome::Ok(rows),
                Err(e) => Outcome::Err(e),
            }
        })
    }
}

fn query_error(kind: QueryErrorKind, query: &Query, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(query.to_sql().0),
        message,
        source: None,
    })
}

fn unsupported(message: impl Into<String>) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Unsupported,
        sql: None,
        message: message.into(),
        source: None,
    })
}

fn with_sql(err: Error, query: &Query) -> Error {
    match err {
        Error::Query(mut q) if q.sql.is_none() => {
            q.sql = Some(query.to_sql().0);
            Error::Query(q)
        }
        other => other,
    }
}

fn truthy(value: &Value) -> bool {
    value.as_bool() == Some(true)
}

// ==================== Joins ====================

fn apply_join(
    layout: &[Source],
    left: Vec<Tuple>,
    join: &Join,
    right: &Table,
) -> Result<Vec<Tuple>> {
    let mut extended = layout.to_vec();
    extended.push(Source {
        name: join.reference_name().to_string(),
        columns: right.columns.clone(),
    });

    let shared: Vec<String> = match &join.condition {
        JoinCondition::Using(cols) => cols.clone(),
        JoinCondition::Natural => right
            .columns
            .iter()
            .filter(|c| layout.iter().any(|s| s.columns.contains(c)))
            .cloned()
            .collect(),
        JoinCondition::On(_) | JoinCondition::None => Vec::new(),
    };

    let matches = |candidate: &Tuple| -> Result<bool> {
        match &join.condition {
            JoinCondition::On(expr) => Ok(truthy(&eval(expr, &extended, candidate)?)),
            JoinCondition::Using(_) | JoinCondition::Natural => {
                let right_row = candidate.last().and_then(Option::as_ref);
                for col in &shared {
                    let left_value = resolve(layout, &candidate[..layout.len()], None, col)?;
                    let right_value = right_row
                        .and_then(|r| r.get_by_name(col))
                        .cloned()
                        .unwrap_or(Value::Null);
                    if !left_value.sql_eq(&right_value) {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            JoinCondition::None => Ok(true),
        }
    };

    let mut out = Vec::new();
    let mut right_matched = vec![false; right.rows.len()];
    for tuple in left {
        let mut matched = false;
        for (i, row) in right.rows.iter().enumerate() {
            let mut candidate = tuple.clone();
            candidate.push(Some(row.clone()));
            if matches(&candidate)? {
                matched = true;
                right_matched[i] = true;
                out.push(candidate);
            }
        }
        if !matched && join.join_type.keeps_left() {
            let mut padded = tuple;
            padded.push(None);
            out.push(padded);
        }
    }

    if join.join_type.keeps_right() {
        for (i, row) in right.rows.iter().enumerate() {
            if !right_matched[i] {
                let mut padded: Tuple = vec![None; layout.len()];
                padded.push(Some(row.clone()));
                out.push(padded);
            }
        }
    }

    Ok(out)
}

// ==================== Expression evaluation ====================

fn resolve(layout: &[Source], tuple: &[Option<Row>], table: Option<&str>, name: &str) -> Result<Value> {
    let position = match table {
        Some(t) => layout
            .iter()
            .position(|s| s.name == t)
            .ok_or_else(|| unsupported(format!("unknown table reference '{t}'")))?,
        None => layout
            .iter()
            .position(|s| s.columns.iter().any(|c| c == name))
            .ok_or_else(|| unsupported(format!("unknown column '{name}'")))?,
    };
    let source = &layout[position];
    match tuple.get(position).and_then(Option::as_ref) {
        Some(row) => match row.get_by_name(name) {
            Some(v) => Ok(v.clone()),
            None if source.columns.iter().any(|c| c == name) => Ok(Value::Null),
            None => Err(unsupported(format!(
                "unknown column '{}.{name}'",
                source.name
            ))),
        },
        None => Ok(Value::Null),
    }
}

fn to_bool(v: &Value) -> Option<bool> {
    if v.is_null() { None } else { v.as_bool() }
}

fn from_bool(b: Option<bool>) -> Value {
    b.map_or(Value::Null, Value::Bool)
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Value {
    let Some(ord) = left.sql_cmp(right) else {
        return Value::Null;
    };
    Value::Bool(match op {
        BinaryOp::Eq => ord == Ordering::Equal,
        BinaryOp::Ne => ord != Ordering::Equal,
        BinaryOp::Lt => ord == Ordering::Less,
        BinaryOp::Le => ord != Ordering::Greater,
        BinaryOp::Gt => ord == Ordering::Greater,
        BinaryOp::Ge => ord != Ordering::Less,
        BinaryOp::And | BinaryOp::Or => false,
    })
}

fn logical(op: BinaryOp, left: &Value, right: &Value) -> Value {
    let (l, r) = (to_bool(left), to_bool(right));
    from_bool(match op {
        BinaryOp::And => match (l, r) {
            (Some(false), _) | (_, Some(false)) => Some(false),
            (Some(true), Some(true)) => Some(true),
            _ => None,
        },
        _ => match (l, r) {
            (Some(true), _) | (_, Some(true)) => Some(true),
            (Some(false), Some(false)) => Some(false),
            _ => None,
        },
    })
}

fn eval(expr: &Expr, layout: &[Source], tuple: &[Option<Row>]) -> Result<Value> {
    match expr {
        Expr::Column { table, name } => resolve(layout, tuple, table.as_deref(), name),
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Binary { left, op, right } => {
            let l = eval(left, layout, tuple)?;
            let r = eval(right, layout, tuple)?;
            if op.is_logical() {
                Ok(logical(*op, &l, &r))
            } else {
                Ok(compare(*op, &l, &r))
            }
        }
        Expr::Not(inner) => Ok(from_bool(to_bool(&eval(inner, layout, tuple)?).map(|b| !b))),
        Expr::In {
            expr,
            values,
            negated,
        } => {
            let v = eval(expr, layout, tuple)?;
            if v.is_null() {
                return Ok(Value::Null);
            }
            let mut saw_null = false;
            for candidate in values {
                let c = eval(candidate, layout, tuple)?;
                if c.is_null() {
                    saw_null = true;
                } else if v.sql_eq(&c) {
                    return Ok(Value::Bool(!negated));
                }
            }
            Ok(if saw_null {
                Value::Null
            } else {
                Value::Bool(*negated)
            })
        }
        Expr::InTuple { exprs, rows } => {
            let mut values = Vec::with_capacity(exprs.len());
            for e in exprs {
                let v = eval(e, layout, tuple)?;
                if v.is_null() {
                    return Ok(Value::Null);
                }
                values.push(v);
            }
            let hit = rows.iter().any(|row| {
                row.len() == values.len() && row.iter().zip(&values).all(|(a, b)| a.sql_eq(b))
            });
            Ok(Value::Bool(hit))
        }
        Expr::IsNull { expr, negated } => {
            let v = eval(expr, layout, tuple)?;
            Ok(Value::Bool(v.is_null() != *negated))
        }
        Expr::Function { name, args } => {
            if expr.is_aggregate() {
                return Err(unsupported(format!(
                    "aggregate {name} used outside of a grouped query"
                )));
            }
            let mut values = Vec::with_capacity(args.len());
            for a in args {
                values.push(eval(a, layout, tuple)?);
            }
            scalar_function(name, values)
        }
        Expr::CountStar => Err(unsupported("COUNT(*) used outside of a grouped query")),
        Expr::Raw(sql) => match sql.trim().to_ascii_uppercase().as_str() {
            "TRUE" | "1 = 1" | "1=1" => Ok(Value::Bool(true)),
            "FALSE" | "1 = 0" | "1=0" => Ok(Value::Bool(false)),
            other => Err(unsupported(format!("cannot evaluate raw SQL '{other}'"))),
        },
        Expr::Paren(inner) => eval(inner, layout, tuple),
    }
}

fn scalar_function(name: &str, args: Vec<Value>) -> Result<Value> {
    match name.to_ascii_uppercase().as_str() {
        "COALESCE" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "LOWER" => Ok(match args.into_iter().next() {
            Some(Value::Text(s)) => Value::Text(s.to_lowercase()),
            Some(other) => other,
            None => Value::Null,
        }),
        "UPPER" => Ok(match args.into_iter().next() {
            Some(Value::Text(s)) => Value::Text(s.to_uppercase()),
            Some(other) => other,
            None => Value::Null,
        }),
        other => Err(unsupported(format!("unsupported function {other}"))),
    }
}

fn aggregate(expr: &Expr, layout: &[Source], group: &[Tuple]) -> Result<Value> {
    let Expr::Function { name, args } = expr else {
        return Ok(Value::BigInt(i64::try_from(group.len()).unwrap_or(i64::MAX)));
    };
    let arg = args
        .first()
        .ok_or_else(|| unsupported(format!("{name} requires an argument")))?;
    let mut values = Vec::with_capacity(group.len());
    for tuple in group {
        let v = eval(arg, layout, tuple)?;
        if !v.is_null() {
            values.push(v);
        }
    }
    match name.to_ascii_uppercase().as_str() {
        "COUNT" => Ok(Value::BigInt(i64::try_from(values.len()).unwrap_or(i64::MAX))),
        "SUM" => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            if values.iter().all(|v| v.as_i64().is_some()) {
                Ok(Value::BigInt(values.iter().filter_map(Value::as_i64).sum()))
            } else {
                Ok(Value::Double(values.iter().filter_map(Value::as_f64).sum()))
            }
        }
        "AVG" => {
            if values.is_empty() {
                return Ok(Value::Null);
            }
            let total: f64 = values.iter().filter_map(Value::as_f64).sum();
            Ok(Value::Double(total / values.len() as f64))
        }
        "MIN" | "MAX" => {
            let want = if name.eq_ignore_ascii_case("MIN") {
                Ordering::Less
            } else {
                Ordering::Greater
            };
            let mut best: Option<Value> = None;
            for v in values {
                best = match best {
                    Some(b) if v.sql_cmp(&b) != Some(want) => Some(b),
                    _ => Some(v),
                };
            }
            Ok(best.unwrap_or(Value::Null))
        }
        other => Err(unsupported(format!("unsupported aggregate {other}"))),
    }
}

fn eval_grouped(expr: &Expr, layout: &[Source], group: &[Tuple]) -> Result<Value> {
    if expr.is_aggregate() {
        return aggregate(expr, layout, group);
    }
    match group.first() {
        Some(first) => eval(expr, layout, first),
        None => Ok(Value::Null),
    }
}

// ==================== Projection ====================

fn output_names(query: &Query, layout: &[Source]) -> Vec<String> {
    let default_items = [SelectItem::AllFrom(query.reference_name().to_string())];
    let items: &[SelectItem] = if query.columns.is_empty() {
        &default_items
    } else {
        &query.columns
    };
    let mut names = Vec::new();
    for item in items {
        match item {
            SelectItem::AllFrom(t) => {
                if let Some(source) = layout.iter().find(|s| &s.name == t) {
                    names.extend(source.columns.iter().cloned());
                }
            }
            other => names.extend(other.output_name()),
        }
    }
    names
}

fn project(
    query: &Query,
    layout: &[Source],
    columns: &Arc<ColumnInfo>,
    mut value_of: impl FnMut(&Expr) -> Result<Value>,
    tuple: Option<&Tuple>,
) -> Result<Row> {
    let default_items = [SelectItem::AllFrom(query.reference_name().to_string())];
    let items: &[SelectItem] = if query.columns.is_empty() {
        &default_items
    } else {
        &query.columns
    };
    let mut values = Vec::with_capacity(columns.len());
    for item in items {
        match item {
            SelectItem::AllFrom(t) => {
                let Some(position) = layout.iter().position(|s| &s.name == t) else {
                    return Err(unsupported(format!("unknown table reference '{t}'")));
                };
                let row = tuple.and_then(|tp| tp.get(position)).and_then(Option::as_ref);
                for col in &layout[position].columns {
                    values.push(
                        row.and_then(|r| r.get_by_name(col))
                            .cloned()
                            .unwrap_or(Value::Null),
                    );
                }
            }
            SelectItem::Expr { expr, .. } => values.push(value_of(expr)?),
        }
    }
    Ok(Row::with_columns(Arc::clone(columns), values))
}

fn sort_rows<T>(
    order_by: &[OrderBy],
    items: Vec<(T, Row)>,
    mut key_of: impl FnMut(&Expr, &T, &Row) -> Result<Value>,
) -> Result<Vec<Row>> {
    if order_by.is_empty() {
        return Ok(items.into_iter().map(|(_, row)| row).collect());
    }
    let mut keyed = Vec::with_capacity(items.len());
    for (source, row) in items {
        let mut keys = Vec::with_capacity(order_by.len());
        for o in order_by {
            keys.push(key_of(&o.expr, &source, &row)?);
        }
        keyed.push((keys, row));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        for (i, o) in order_by.iter().enumerate() {
            let ord = match (a[i].is_null(), b[i].is_null()) {
                (true, true) => Ordering::Equal,
                (true, false) if o.nulls_sort_first() => Ordering::Less,
                (true, false) => Ordering::Greater,
                (false, true) if o.nulls_sort_first() => Ordering::Greater,
                (false, true) => Ordering::Less,
                (false, false) => {
                    let natural = a[i].sql_cmp(&b[i]).unwrap_or(Ordering::Equal);
                    match o.direction {
                        crate::clause::OrderDirection::Asc => natural,
                        crate::clause::OrderDirection::Desc => natural.reverse(),
                    }
                }
            };
            if ord != Ordering::Equal {
                return ord;
            }
        }
        Ordering::Equal
    });
    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}

/// ORDER BY may name an output column (`value`) rather than a source column.
fn output_fallback(expr: &Expr, row: &Row, err: Error) -> Result<Value> {
    match expr {
        Expr::Column { table: None, name } => row.get_by_name(name).cloned().ok_or(err),
        _ => Err(err),
    }
}

fn project_rows(
    query: &Query,
    layout: &[Source],
    tuples: Vec<Tuple>,
    columns: &Arc<ColumnInfo>,
) -> Result<Vec<Row>> {
    let mut items = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        let row = project(query, layout, columns, |e| eval(e, layout, &tuple), Some(&tuple))?;
        items.push((tuple, row));
    }
    sort_rows(&query.order_by, items, |expr, tuple, row| {
        eval(expr, layout, tuple).or_else(|e| output_fallback(expr, row, e))
    })
}

fn project_groups(
    query: &Query,
    layout: &[Source],
    tuples: Vec<Tuple>,
    columns: &Arc<ColumnInfo>,
) -> Result<Vec<Row>> {
    let mut groups: Vec<(Vec<Value>, Vec<Tuple>)> = Vec::new();
    if query.group_by.is_empty() {
        groups.push((Vec::new(), tuples));
    } else {
        for tuple in tuples {
            let mut key = Vec::with_capacity(query.group_by.len());
            for g in &query.group_by {
                key.push(eval(g, layout, &tuple)?);
            }
            let existing = groups.iter_mut().find(|(k, _)| {
                k.iter()
                    .zip(&key)
                    .all(|(a, b)| (a.is_null() && b.is_null()) || a.sql_eq(b))
            });
            match existing {
                Some((_, members)) => members.push(tuple),
                None => groups.push((key, vec![tuple])),
            }
        }
    }

    let mut items = Vec::with_capacity(groups.len());
    for (_, members) in groups {
        let row = project(
            query,
            layout,
            columns,
            |e| eval_grouped(e, layout, &members),
            members.first(),
        )?;
        items.push((members, row));
    }
    sort_rows(&query.order_by, items, |expr, members, row| {
        eval_grouped(expr, layout, members).or_else(|e| output_fallback(expr, row, e))
    })
}
