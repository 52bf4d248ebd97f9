//! Statement execution against a single SQLite connection.
//!
//! These functions are shared by one-shot statements (borrowed pooled
//! connection) and transactions (connection owned by a transaction handle).

use std::sync::atomic::{AtomicU64, Ordering};

use r2d2::{Pool, PooledConnection};
use rusqlite::{Connection, Statement};
use tracing::{debug, instrument};

use crate::engine::factory::SqliteManager;
use crate::engine::value::{
    ColumnInfo, ExecResult, Params, QueryResult, RowBatch, SqlValue, TypedQueryResult,
};
use crate::engine::AccessMode;
use crate::error::ServerError;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Physical handle for one (database, mode) pair: a bounded pool of SQLite
/// connections sharing the same open flags and initialization. Clones share
/// the pool; it closes when the last clone is dropped.
#[derive(Clone)]
pub struct SqliteHandle {
    id: u64,
    database: String,
    mode: AccessMode,
    pool: Pool<SqliteManager>,
}

impl SqliteHandle {
    pub(crate) fn new(database: String, mode: AccessMode, pool: Pool<SqliteManager>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            database,
            mode,
            pool,
        }
    }

    /// Process-unique id; equal ids mean the same underlying pool.
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Check out a connection, blocking up to the pool's connection timeout.
    pub fn checkout(&self) -> Result<PooledConnection<SqliteManager>, ServerError> {
        self.pool.get().map_err(ServerError::from_pool)
    }

    pub fn idle_connections(&self) -> u32 {
        self.pool.state().idle_connections
    }

    pub fn open_connections(&self) -> u32 {
        self.pool.state().connections
    }
}

fn guard_sql(sql: &str) -> Result<(), ServerError> {
    if sql.contains('\0') {
        return Err(ServerError::InvalidParameter(
            "SQL contains null bytes".to_string(),
        ));
    }
    if sql.trim().is_empty() {
        return Err(ServerError::InvalidParameter("empty SQL statement".to_string()));
    }
    Ok(())
}

fn bind(stmt: &mut Statement<'_>, params: &Params) -> Result<(), ServerError> {
    match params {
        Params::Positional(values) => {
            let expected = stmt.parameter_count();
            if values.len() != expected {
                return Err(ServerError::InvalidParameter(format!(
                    "statement expects {expected} parameters, got {}",
                    values.len()
                )));
            }
            for (idx, value) in values.iter().enumerate() {
                stmt.raw_bind_parameter(idx + 1, value)?;
            }
        }
        Params::Named(values) => {
            for (name, value) in values {
                let key = if name.starts_with([':', '@', '$']) {
                    name.clone()
                } else {
                    format!(":{name}")
                };
                let idx = stmt.parameter_index(&key)?.ok_or_else(|| {
                    ServerError::InvalidParameter(format!("unknown named parameter {key}"))
                })?;
                stmt.raw_bind_parameter(idx, value)?;
            }
        }
    }
    Ok(())
}

fn column_infos(stmt: &Statement<'_>) -> Vec<ColumnInfo> {
    stmt.columns()
        .into_iter()
        .map(|col| ColumnInfo {
            name: col.name().to_string(),
            decl_type: col.decl_type().map(str::to_string),
        })
        .collect()
}

/// Run a statement and hand each row to `sink`. Returns the column metadata.
fn for_each_row(
    conn: &Connection,
    sql: &str,
    params: &Params,
    mut sink: impl FnMut(Vec<SqlValue>) -> Result<(), ServerError>,
) -> Result<Vec<ColumnInfo>, ServerError> {
    guard_sql(sql)?;
    let mut stmt = conn.prepare(sql)?;
    bind(&mut stmt, params)?;
    let columns = column_infos(&stmt);
    let width = columns.len();
    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(SqlValue::from(row.get_ref(idx)?));
        }
        sink(values)?;
    }
    Ok(columns)
}

#[instrument(skip(conn, params), fields(sql = %sql))]
pub fn query(conn: &Connection, sql: &str, params: &Params) -> Result<QueryResult, ServerError> {
    let mut rows = Vec::new();
    let columns = for_each_row(conn, sql, params, |row| {
        rows.push(row);
        Ok(())
    })?;
    debug!(rows = rows.len(), "executed query");
    Ok(QueryResult {
        columns: columns.into_iter().map(|c| c.name).collect(),
        rows,
    })
}

#[instrument(skip(conn, params), fields(sql = %sql))]
pub fn typed_query(
    conn: &Connection,
    sql: &str,
    params: &Params,
) -> Result<TypedQueryResult, ServerError> {
    let mut rows = Vec::new();
    let columns = for_each_row(conn, sql, params, |row| {
        rows.push(row);
        Ok(())
    })?;
    debug!(rows = rows.len(), "executed typed query");
    Ok(TypedQueryResult { columns, rows })
}

/// Query split into batches of at most `batch_rows` rows. Always yields at
/// least one batch so an empty result still carries its columns.
pub fn query_batches(
    conn: &Connection,
    sql: &str,
    params: &Params,
    batch_rows: usize,
    typed: bool,
) -> Result<Vec<RowBatch>, ServerError> {
    let mut batches = Vec::new();
    stream_batches(conn, sql, params, batch_rows, typed, |batch| {
        batches.push(batch);
        Ok(())
    })?;
    Ok(batches)
}

/// Like [`query_batches`], but hands every batch to `emit` while rows are
/// still being read. One full batch is held back so the final one can be
/// flagged `last`. Returns the number of batches emitted.
#[instrument(skip(conn, params, emit), fields(sql = %sql))]
pub fn stream_batches(
    conn: &Connection,
    sql: &str,
    params: &Params,
    batch_rows: usize,
    typed: bool,
    mut emit: impl FnMut(RowBatch) -> Result<(), ServerError>,
) -> Result<usize, ServerError> {
    let batch_rows = batch_rows.max(1);
    guard_sql(sql)?;
    let mut stmt = conn.prepare(sql)?;
    bind(&mut stmt, params)?;
    let mut columns = column_infos(&stmt);
    if !typed {
        for column in &mut columns {
            column.decl_type = None;
        }
    }
    let width = columns.len();
    let mut columns = Some(columns);
    let mut emitted = 0usize;
    let mut pending: Option<Vec<Vec<SqlValue>>> = None;
    let mut current = Vec::with_capacity(batch_rows);

    let mut rows = stmt.raw_query();
    while let Some(row) = rows.next()? {
        let mut values = Vec::with_capacity(width);
        for idx in 0..width {
            values.push(SqlValue::from(row.get_ref(idx)?));
        }
        current.push(values);
        if current.len() == batch_rows {
            let full = std::mem::replace(&mut current, Vec::with_capacity(batch_rows));
            if let Some(ready) = pending.replace(full) {
                emit(RowBatch {
                    columns: columns.take(),
                    rows: ready,
                    last: false,
                })?;
                emitted += 1;
            }
        }
    }

    let tail = match (pending, current.is_empty()) {
        (Some(held), true) => vec![held],
        (Some(held), false) => vec![held, current],
        (None, _) => vec![current],
    };
    let total = tail.len();
    for (idx, batch) in tail.into_iter().enumerate() {
        emit(RowBatch {
            columns: columns.take(),
            rows: batch,
            last: idx + 1 == total,
        })?;
        emitted += 1;
    }
    debug!(batches = emitted, "executed streamed query");
    Ok(emitted)
}

#[instrument(skip(conn, params), fields(sql = %sql))]
pub fn exec(conn: &Connection, sql: &str, params: &Params) -> Result<ExecResult, ServerError> {
    guard_sql(sql)?;
    let mut stmt = conn.prepare(sql)?;
    bind(&mut stmt, params)?;
    let affected = stmt.raw_execute()?;
    debug!(affected, "executed statement");
    Ok(ExecResult {
        rows_affected: affected as u64,
        last_insert_rowid: conn.last_insert_rowid(),
    })
}

/// Run `sql` once per parameter set, in order, stopping at the first failure.
pub fn exec_many(
    conn: &Connection,
    sql: &str,
    param_sets: &[Params],
) -> Result<Vec<ExecResult>, ServerError> {
    if param_sets.is_empty() {
        return Ok(vec![exec(conn, sql, &Params::default())?]);
    }
    param_sets
        .iter()
        .map(|params| exec(conn, sql, params))
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use anyhow::{anyhow, Result};

    use super::*;

    fn sample() -> Result<Connection> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO items (name) VALUES ('a'), ('b'), ('c');",
        )?;
        Ok(conn)
    }

    #[test]
    fn query_returns_columns_and_rows() -> Result<()> {
        let conn = sample()?;
        let result = query(
            &conn,
            "SELECT id, name FROM items WHERE id > ? ORDER BY id",
            &Params::Positional(vec![SqlValue::Integer(1)]),
        )?;
        assert_eq!(result.columns, vec!["id", "name"]);
        assert_eq!(result.rows.len(), 2);
        assert_eq!(result.rows[0][1], SqlValue::Text("b".into()));
        Ok(())
    }

    #[test]
    fn typed_query_reports_declared_types() -> Result<()> {
        let conn = sample()?;
        let result = typed_query(&conn, "SELECT id, name, 1 + 1 AS two FROM items", &Params::default())?;
        let types: Vec<Option<&str>> = result
            .columns
            .iter()
            .map(|c| c.decl_type.as_deref())
            .collect();
        assert_eq!(types, vec![Some("INTEGER"), Some("TEXT"), None]);
        Ok(())
    }

    #[test]
    fn named_parameters_accept_bare_and_prefixed_keys() -> Result<()> {
        let conn = sample()?;
        let mut named = BTreeMap::new();
        named.insert("name".to_string(), SqlValue::Text("d".into()));
        let result = exec(&conn, "INSERT INTO items (name) VALUES (:name)", &Params::Named(named))?;
        assert_eq!(result.rows_affected, 1);
        assert_eq!(result.last_insert_rowid, 4);

        let mut unknown = BTreeMap::new();
        unknown.insert("@missing".to_string(), SqlValue::Null);
        let err = exec(&conn, "INSERT INTO items (name) VALUES (:name)", &Params::Named(unknown))
            .err()
            .ok_or_else(|| anyhow!("expected unknown parameter error"))?;
        assert!(matches!(err, ServerError::InvalidParameter(_)));
        Ok(())
    }

    #[test]
    fn parameter_count_mismatch_is_rejected() -> Result<()> {
        let conn = sample()?;
        let err = query(&conn, "SELECT * FROM items WHERE id = ?", &Params::default())
            .err()
            .ok_or_else(|| anyhow!("expected arity error"))?;
        assert!(err.is_soft());
        Ok(())
    }

    #[test]
    fn batches_split_rows_and_mark_the_last() -> Result<()> {
        let conn = sample()?;
        let batches = query_batches(&conn, "SELECT name FROM items ORDER BY id", &Params::default(), 2, false)?;
        assert_eq!(batches.len(), 2);
        assert!(batches[0].columns.is_some());
        assert!(batches[1].columns.is_none());
        assert_eq!(batches[0].rows.len(), 2);
        assert!(!batches[0].last);
        assert!(batches[1].last);

        let empty = query_batches(&conn, "SELECT name FROM items WHERE 0", &Params::default(), 2, true)?;
        assert_eq!(empty.len(), 1);
        assert!(empty[0].rows.is_empty());
        assert!(empty[0].last);
        Ok(())
    }

    #[test]
    fn streamed_batches_arrive_before_the_query_finishes() -> Result<()> {
        let conn = sample()?;
        let mut seen = Vec::new();
        let emitted = stream_batches(&conn, "SELECT name FROM items ORDER BY id", &Params::default(), 1, true, |batch| {
            seen.push((batch.rows.len(), batch.columns.is_some(), batch.last));
            Ok(())
        })?;
        assert_eq!(emitted, 3);
        assert_eq!(seen, vec![(1, true, false), (1, false, false), (1, false, true)]);

        // a failing sink stops the query at the first batch handed over
        let mut calls = 0;
        let err = stream_batches(&conn, "SELECT name FROM items", &Params::default(), 1, false, |_| {
            calls += 1;
            Err(ServerError::Cancelled)
        })
        .err()
        .ok_or_else(|| anyhow!("expected the sink error"))?;
        assert!(matches!(err, ServerError::Cancelled));
        assert_eq!(calls, 1);
        Ok(())
    }

    #[test]
    fn exec_many_runs_each_parameter_set() -> Result<()> {
        let conn = sample()?;
        let results = exec_many(
            &conn,
            "DELETE FROM items WHERE id = ?",
            &[
                Params::Positional(vec![SqlValue::Integer(1)]),
                Params::Positional(vec![SqlValue::Integer(42)]),
            ],
        )?;
        let affected: Vec<u64> = results.iter().map(|r| r.rows_affected).collect();
        assert_eq!(affected, vec![1, 0]);
        Ok(())
    }

    #[test]
    fn null_bytes_and_blank_sql_are_rejected() -> Result<()> {
        let conn = sample()?;
        assert!(exec(&conn, "SELECT 1\0", &Params::default()).is_err());
        assert!(exec(&conn, "   ", &Params::default()).is_err());
        Ok(())
    }
}
