//! In-memory [`PgClient`] for tests.
//!
//! Interprets the subset of Postgres statements issued by the event store,
//! projector and shadow reads: `INSERT ... ON CONFLICT`, `SELECT` with simple
//! `WHERE`/`ORDER BY`/`LIMIT`/`OFFSET`, `TRUNCATE`, and `BEGIN`/`COMMIT`/`ROLLBACK`
//! with snapshot rollback. Unique keys and foreign keys of the remote schema
//! are enforced. Every statement is recorded, and the client can be switched
//! into an outage mode or told to fail statements carrying a given parameter.

use std::collections::BTreeSet;

use async_trait::async_trait;
use harness_mem_core::{now_rfc3339, Row, SqlValue};
use parking_lot::Mutex;

use crate::postgres::PgClient;
use crate::StorageError;

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedStatement {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

#[derive(Debug, Clone, Default)]
struct Tables {
    sessions: Vec<Row>,
    events: Vec<Row>,
    observations: Vec<Row>,
    tags: Vec<Row>,
}

impl Tables {
    fn table_mut(&mut self, name: &str) -> Result<&mut Vec<Row>, StorageError> {
        match name {
            "mem_sessions" => Ok(&mut self.sessions),
            "mem_events" => Ok(&mut self.events),
            "mem_observations" => Ok(&mut self.observations),
            "mem_tags" => Ok(&mut self.tags),
            other => Err(unsupported(&format!("table {other}"))),
        }
    }

    fn table(&self, name: &str) -> Result<&Vec<Row>, StorageError> {
        match name {
            "mem_sessions" => Ok(&self.sessions),
            "mem_events" => Ok(&self.events),
            "mem_observations" => Ok(&self.observations),
            "mem_tags" => Ok(&self.tags),
            other => Err(unsupported(&format!("table {other}"))),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    tables: Tables,
    snapshot: Option<Tables>,
    statements: Vec<RecordedStatement>,
    unavailable: bool,
    poisoned_params: BTreeSet<String>,
    close_calls: usize,
}

#[derive(Debug, Default)]
pub struct MemoryPgClient {
    state: Mutex<State>,
}

impl MemoryPgClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every statement fails as if the server were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    /// Fail any statement that binds `value` as a text parameter.
    pub fn fail_statements_with_param(&self, value: &str) {
        self.state.lock().poisoned_params.insert(value.to_string());
    }

    pub fn clear_failures(&self) {
        self.state.lock().poisoned_params.clear();
    }

    #[must_use]
    pub fn statements(&self) -> Vec<RecordedStatement> {
        self.state.lock().statements.clone()
    }

    /// Rows of `table` in insertion order. Unknown tables yield nothing.
    #[must_use]
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state.lock().tables.table(table).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    /// Insert an observation directly, bypassing foreign keys. Used to shape
    /// shadow-read results.
    pub fn seed_observation(&self, id: &str, project: &str, workspace_uid: &str, text: &str) {
        let row = Row::new()
            .with("id", id)
            .with("project", project)
            .with("workspace_uid", workspace_uid)
            .with("title", SqlValue::Null)
            .with("content", text)
            .with("content_redacted", text);
        self.state.lock().tables.observations.push(row);
    }

    fn dispatch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        let mut state = self.state.lock();
        state.statements.push(RecordedStatement { sql: sql.to_string(), params: params.to_vec() });

        if state.unavailable {
            return Err(StorageError::Remote("connection refused".to_string()));
        }
        if let Some(value) = params
            .iter()
            .filter_map(SqlValue::as_str)
            .find(|value| state.poisoned_params.contains(*value))
        {
            return Err(StorageError::Remote(format!("injected failure for {value}")));
        }

        let normalized = normalize(sql);
        let upper = normalized.to_ascii_uppercase();
        let keyword = upper.split(' ').next().unwrap_or_default();
        match keyword {
            "BEGIN" => {
                state.snapshot = Some(state.tables.clone());
                Ok(Vec::new())
            }
            "COMMIT" => {
                state.snapshot = None;
                Ok(Vec::new())
            }
            "ROLLBACK" => {
                if let Some(snapshot) = state.snapshot.take() {
                    state.tables = snapshot;
                }
                Ok(Vec::new())
            }
            "CREATE" | "ALTER" => Ok(Vec::new()),
            "TRUNCATE" => {
                truncate(&mut state.tables, &normalized);
                Ok(Vec::new())
            }
            "INSERT" => insert(&mut state.tables, &normalized, &upper, params),
            "SELECT" => select(&state.tables, &normalized, &upper, params),
            _ => Err(unsupported(&normalized)),
        }
    }
}

#[async_trait]
impl PgClient for MemoryPgClient {
    async fn fetch(&self, sql: &str, params: &[SqlValue]) -> Result<Vec<Row>, StorageError> {
        self.dispatch(sql, params)
    }

    async fn execute(&self, sql: &str, params: &[SqlValue]) -> Result<u64, StorageError> {
        let rows = self.dispatch(sql, params)?;
        Ok(u64::try_from(rows.len()).unwrap_or(u64::MAX))
    }

    async fn execute_batch(&self, sql: &str) -> Result<(), StorageError> {
        for statement in sql.split(';').map(str::trim).filter(|stmt| !stmt.is_empty()) {
            self.dispatch(statement, &[])?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.state.lock().close_calls += 1;
        Ok(())
    }
}

fn unsupported(what: &str) -> StorageError {
    StorageError::Remote(format!("MemoryPgClient does not support: {what}"))
}

fn normalize(sql: &str) -> String {
    sql.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn truncate(tables: &mut Tables, sql: &str) {
    for name in sql["TRUNCATE".len()..].split(',').map(str::trim) {
        let name = name.split(' ').next().unwrap_or_default();
        if let Ok(table) = tables.table_mut(name) {
            table.clear();
        }
    }
}

fn unique_keys(table: &str) -> &'static [&'static [&'static str]] {
    match table {
        "mem_sessions" => &[&["session_id"]],
        "mem_events" => &[&["event_id"], &["dedupe_hash"]],
        "mem_observations" => &[&["id"]],
        "mem_tags" => &[&["observation_id", "tag", "tag_type"]],
        _ => &[],
    }
}

fn foreign_keys(table: &str) -> &'static [(&'static str, &'static str, &'static str)] {
    match table {
        "mem_events" => &[("session_id", "mem_sessions", "session_id")],
        "mem_observations" => &[("session_id", "mem_sessions", "session_id")],
        "mem_tags" => &[("observation_id", "mem_observations", "id")],
        _ => &[],
    }
}

/// Columns named by `ON CONFLICT (...)`, upper-cased. `None` when the clause
/// has no explicit target.
fn conflict_target(conflict: &str) -> Option<Vec<String>> {
    let after = conflict.split_once("ON CONFLICT")?.1.trim_start();
    let inner = after.strip_prefix('(')?.split_once(')')?.0;
    Some(inner.split(',').map(|column| column.trim().to_string()).collect())
}

/// Returns one row per inserted or updated row, so `execute` reports the
/// affected count.
fn insert(
    tables: &mut Tables,
    sql: &str,
    upper: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let into = upper.find(" INTO ").ok_or_else(|| unsupported(sql))? + " INTO ".len();
    let open = into + sql[into..].find('(').ok_or_else(|| unsupported(sql))?;
    let table = sql[into..open].trim().to_string();
    let close = open + sql[open..].find(')').ok_or_else(|| unsupported(sql))?;
    let columns: Vec<&str> = sql[open + 1..close].split(',').map(str::trim).collect();

    let values_at = upper.find("VALUES").ok_or_else(|| unsupported(sql))?;
    let (values_sql, rest_start) = parenthesized(sql, values_at).ok_or_else(|| unsupported(sql))?;
    let expressions = split_top_level(values_sql);
    if expressions.len() != columns.len() {
        return Err(unsupported(&format!("column/value mismatch in {sql}")));
    }

    let mut row = Row::new();
    for (column, expr) in columns.iter().zip(&expressions) {
        row.insert(*column, eval(expr, params)?);
    }

    for (column, parent_table, parent_column) in foreign_keys(&table) {
        let value = row.get(column).cloned().unwrap_or(SqlValue::Null);
        if value.is_null() {
            continue;
        }
        let parent_exists = tables
            .table(parent_table)?
            .iter()
            .any(|parent| parent.get(parent_column) == Some(&value));
        if !parent_exists {
            return Err(StorageError::Remote(format!(
                "insert or update on table \"{table}\" violates foreign key constraint on {column}"
            )));
        }
    }

    let conflict = &upper[rest_start..];
    let keys = unique_keys(&table);
    let arbiters: Vec<&[&str]> = match conflict_target(conflict) {
        Some(columns) => keys
            .iter()
            .copied()
            .filter(|key| {
                key.iter().map(|column| column.to_ascii_uppercase()).eq(columns.iter().cloned())
            })
            .collect(),
        None if conflict.contains("ON CONFLICT") => keys.to_vec(),
        None => Vec::new(),
    };
    let target = tables.table_mut(&table)?;
    let position = |key: &[&str]| {
        target
            .iter()
            .position(|candidate| key.iter().all(|column| candidate.get(column) == row.get(column)))
    };
    let arbitrated = arbiters.iter().find_map(|key| position(*key));
    let violated = keys.iter().any(|key| position(*key).is_some());

    let Some(index) = arbitrated else {
        if violated {
            return Err(StorageError::Remote(format!(
                "duplicate key value violates unique constraint on {table}"
            )));
        }
        target.push(row.clone());
        return Ok(vec![row]);
    };

    if conflict.contains("DO NOTHING") {
        return Ok(Vec::new());
    }
    let Some(set_at) = conflict.find("DO UPDATE SET ") else {
        return Err(StorageError::Remote(format!(
            "duplicate key value violates unique constraint on {table}"
        )));
    };
    let assignments = &sql[rest_start + set_at + "DO UPDATE SET ".len()..];
    for assignment in split_top_level(assignments) {
        let Some((column, expr)) = assignment.split_once('=') else {
            continue;
        };
        let column = column.trim();
        let expr = expr.trim();
        let excluded = expr.strip_prefix("EXCLUDED.").or_else(|| expr.strip_prefix("excluded."));
        let value = match excluded {
            Some(source) => row.get(source.trim()).cloned().unwrap_or(SqlValue::Null),
            None => eval(expr, params)?,
        };
        target[index].insert(column, value);
    }
    Ok(vec![target[index].clone()])
}

fn select(
    tables: &Tables,
    sql: &str,
    upper: &str,
    params: &[SqlValue],
) -> Result<Vec<Row>, StorageError> {
    let from = upper.find(" FROM ").ok_or_else(|| unsupported(sql))?;
    let projection: Vec<&str> = sql["SELECT ".len()..from].split(',').map(str::trim).collect();
    let after_from = &sql[from + " FROM ".len()..];
    let table = after_from.split(' ').next().unwrap_or_default();
    let clauses_at = from + " FROM ".len() + table.len();
    let clauses = &upper[clauses_at..];

    let where_end = [" ORDER BY ", " LIMIT ", " OFFSET "]
        .iter()
        .filter_map(|keyword| clauses.find(keyword))
        .min()
        .unwrap_or(clauses.len());
    let conditions = match clauses.find(" WHERE ") {
        Some(at) => {
            split_conditions(&sql[clauses_at + at + " WHERE ".len()..clauses_at + where_end])
        }
        None => Vec::new(),
    };

    let mut rows = Vec::new();
    for row in tables.table(table)? {
        if matches_all(row, &conditions, params)? {
            rows.push(row.clone());
        }
    }

    if let Some(at) = clauses.find(" ORDER BY TS ") {
        let descending = clauses[at..].starts_with(" ORDER BY TS DESC");
        rows.sort_by(|left, right| {
            let ordering = left.text("ts").cmp(&right.text("ts"));
            if descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    let offset = clause_number(sql, clauses, clauses_at, " OFFSET ", params)?.unwrap_or(0);
    let limit = clause_number(sql, clauses, clauses_at, " LIMIT ", params)?.unwrap_or(usize::MAX);
    let rows = rows.into_iter().skip(offset).take(limit);

    if projection == ["*"] {
        return Ok(rows.collect());
    }
    Ok(rows
        .map(|row| {
            projection
                .iter()
                .map(|column| {
                    (column.to_string(), row.get(column).cloned().unwrap_or(SqlValue::Null))
                })
                .collect()
        })
        .collect())
}

fn split_conditions(where_sql: &str) -> Vec<String> {
    let mut conditions = Vec::new();
    let mut rest = where_sql;
    loop {
        let upper = rest.to_ascii_uppercase();
        match upper.find(" AND ") {
            Some(at) => {
                conditions.push(rest[..at].trim().to_string());
                rest = &rest[at + " AND ".len()..];
            }
            None => {
                conditions.push(rest.trim().to_string());
                return conditions;
            }
        }
    }
}

fn matches_all(
    row: &Row,
    conditions: &[String],
    params: &[SqlValue],
) -> Result<bool, StorageError> {
    for condition in conditions {
        if condition.starts_with("search_vector @@") {
            let query = param_in(condition, params)?;
            let haystack = format!(
                "{} {}",
                row.text("title").unwrap_or_default(),
                row.text("content_redacted").unwrap_or_default()
            )
            .to_lowercase();
            let terms = query.as_str().unwrap_or_default().to_lowercase();
            if !terms.split_whitespace().any(|term| haystack.contains(term)) {
                return Ok(false);
            }
            continue;
        }

        let (column, op, expr) = [">=", "<=", "="]
            .iter()
            .find_map(|op| {
                condition.split_once(op).map(|(column, expr)| (column.trim(), *op, expr.trim()))
            })
            .ok_or_else(|| unsupported(condition))?;
        let expected = eval(expr, params)?;
        let actual = row.get(column).cloned().unwrap_or(SqlValue::Null);
        let holds = match (actual.as_str(), expected.as_str()) {
            (Some(actual), Some(expected)) => match op {
                ">=" => actual >= expected,
                "<=" => actual <= expected,
                _ => actual == expected,
            },
            _ => op == "=" && actual == expected,
        };
        if !holds {
            return Ok(false);
        }
    }
    Ok(true)
}

fn clause_number(
    sql: &str,
    clauses: &str,
    clauses_at: usize,
    keyword: &str,
    params: &[SqlValue],
) -> Result<Option<usize>, StorageError> {
    let Some(at) = clauses.find(keyword) else {
        return Ok(None);
    };
    let start = clauses_at + at + keyword.len();
    let token = sql[start..].split(' ').next().unwrap_or_default();
    let value = eval(token, params)?;
    let number = match value {
        SqlValue::Integer(value) => usize::try_from(value).unwrap_or(0),
        SqlValue::Text(value) => value.parse().unwrap_or(0),
        _ => 0,
    };
    Ok(Some(number))
}

fn param_in(condition: &str, params: &[SqlValue]) -> Result<SqlValue, StorageError> {
    let at = condition.find('$').ok_or_else(|| unsupported(condition))?;
    let digits: String = condition[at + 1..].chars().take_while(char::is_ascii_digit).collect();
    eval(&format!("${digits}"), params)
}

fn eval(expr: &str, params: &[SqlValue]) -> Result<SqlValue, StorageError> {
    let expr = expr.trim();
    let expr = expr.split("::").next().unwrap_or(expr).trim();
    if let Some(index) = expr.strip_prefix('$') {
        let index: usize = index.parse().map_err(|_| unsupported(expr))?;
        return params
            .get(index.wrapping_sub(1))
            .cloned()
            .ok_or_else(|| StorageError::Remote(format!("missing parameter ${index}")));
    }
    if expr.eq_ignore_ascii_case("NOW()") {
        return Ok(SqlValue::Text(now_rfc3339()?));
    }
    if expr.eq_ignore_ascii_case("NULL") {
        return Ok(SqlValue::Null);
    }
    if let Some(literal) = expr.strip_prefix('\'').and_then(|rest| rest.strip_suffix('\'')) {
        return Ok(SqlValue::Text(literal.replace("''", "'")));
    }
    if let Ok(value) = expr.parse::<i64>() {
        return Ok(SqlValue::Integer(value));
    }
    Err(unsupported(expr))
}

/// Contents of the first parenthesised group at or after `from`, plus the
/// byte offset just past its closing parenthesis.
fn parenthesized(sql: &str, from: usize) -> Option<(&str, usize)> {
    let open = from + sql[from..].find('(')?;
    let mut depth = 0_usize;
    let mut quoted = false;
    for (offset, ch) in sql[open..].char_indices() {
        match ch {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => {
                depth -= 1;
                if depth == 0 {
                    let close = open + offset;
                    return Some((&sql[open + 1..close], close + 1));
                }
            }
            _ => {}
        }
    }
    None
}

fn split_top_level(list: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut depth = 0_i32;
    let mut quoted = false;
    for ch in list.chars() {
        match ch {
            '\'' => quoted = !quoted,
            '(' if !quoted => depth += 1,
            ')' if !quoted => depth -= 1,
            ',' if !quoted && depth == 0 => {
                parts.push(current.trim().to_string());
                current.clear();
                continue;
            }
            _ => {}
        }
        current.push(ch);
    }
    if !current.trim().is_empty() {
        parts.push(current.trim().to_string());
    }
    parts
}
