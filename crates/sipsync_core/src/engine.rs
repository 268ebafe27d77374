//! Embedded relational engine capability.
//!
//! The cache only needs four primitives from the engine: execute a
//! statement, fetch all rows, fetch one row and run a closure inside a
//! transaction. [`SqlEngine`] captures them so repositories stay independent
//! of the concrete store. [`SqliteEngine`] is the SQLite implementation.
//!
//! # Invariants
//!
//! - `run_in_transaction` commits when the closure returns `Ok` and rolls
//!   back every statement it executed when it returns `Err`
//! - inside a transaction, statements must go through the executor handed to
//!   the closure; calling the engine directly from inside would deadlock

use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use rusqlite::types::{ToSqlOutput, Value as SqliteValue, ValueRef};
use rusqlite::{Connection, ToSql};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// A single SQL parameter or column value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL `NULL`.
    Null,
    /// 64-bit integer.
    Integer(i64),
    /// 64-bit float.
    Real(f64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl SqlValue {
    /// Returns true for `NULL`.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }

    /// Returns the text content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            SqlValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the integer content, if this is an integer value.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SqlValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the value as a float, widening integers.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SqlValue::Real(f) => Some(*f),
            SqlValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }
}

impl From<&str> for SqlValue {
    fn from(value: &str) -> Self {
        SqlValue::Text(value.to_string())
    }
}

impl From<String> for SqlValue {
    fn from(value: String) -> Self {
        SqlValue::Text(value)
    }
}

impl From<i64> for SqlValue {
    fn from(value: i64) -> Self {
        SqlValue::Integer(value)
    }
}

impl From<u32> for SqlValue {
    fn from(value: u32) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl From<f64> for SqlValue {
    fn from(value: f64) -> Self {
        SqlValue::Real(value)
    }
}

impl From<bool> for SqlValue {
    fn from(value: bool) -> Self {
        SqlValue::Integer(i64::from(value))
    }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(SqlValue::Null, Into::into)
    }
}

impl ToSql for SqlValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self {
            SqlValue::Null => ToSqlOutput::Borrowed(ValueRef::Null),
            SqlValue::Integer(i) => ToSqlOutput::Borrowed(ValueRef::Integer(*i)),
            SqlValue::Real(f) => ToSqlOutput::Borrowed(ValueRef::Real(*f)),
            SqlValue::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
            SqlValue::Blob(b) => ToSqlOutput::Borrowed(ValueRef::Blob(b)),
        })
    }
}

impl From<SqliteValue> for SqlValue {
    fn from(value: SqliteValue) -> Self {
        match value {
            SqliteValue::Null => SqlValue::Null,
            SqliteValue::Integer(i) => SqlValue::Integer(i),
            SqliteValue::Real(f) => SqlValue::Real(f),
            SqliteValue::Text(s) => SqlValue::Text(s),
            SqliteValue::Blob(b) => SqlValue::Blob(b),
        }
    }
}

/// A result row with named columns.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Row {
    /// Creates a row from parallel column and value lists.
    pub fn new(columns: Vec<String>, values: Vec<SqlValue>) -> Self {
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the value of `column`, if present.
    pub fn get(&self, column: &str) -> Option<&SqlValue> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|i| &self.values[i])
    }

    /// Returns the value at position `index`.
    pub fn get_index(&self, index: usize) -> Option<&SqlValue> {
        self.values.get(index)
    }

    /// Returns `column` as text; `NULL` and missing columns yield `None`.
    pub fn text(&self, column: &str) -> Option<String> {
        self.get(column).and_then(SqlValue::as_str).map(str::to_string)
    }

    /// Returns `column` as an integer.
    pub fn integer(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(SqlValue::as_i64)
    }

    /// Returns `column` as a float.
    pub fn real(&self, column: &str) -> Option<f64> {
        self.get(column).and_then(SqlValue::as_f64)
    }
}

/// Statement-level access to the engine.
pub trait SqlExecutor {
    /// Executes a statement and returns the number of rows changed.
    fn execute(&self, sql: &str, params: &[SqlValue]) -> CoreResult<usize>;

    /// Runs a query and returns every row.
    fn query_all(&self, sql: &str, params: &[SqlValue]) -> CoreResult<Vec<Row>>;

    /// Runs a query and returns the first row, if any.
    fn query_one(&self, sql: &str, params: &[SqlValue]) -> CoreResult<Option<Row>> {
        Ok(self.query_all(sql, params)?.into_iter().next())
    }
}

/// The embedded engine capability consumed by the cache.
pub trait SqlEngine: SqlExecutor + Send + Sync {
    /// Runs `f` inside one transaction.
    ///
    /// Commits if `f` returns `Ok`, rolls back if it returns `Err`.
    fn run_in_transaction(
        &self,
        f: &mut dyn FnMut(&dyn SqlExecutor) -> CoreResult<()>,
    ) -> CoreResult<()>;
}

impl SqlExecutor for Connection {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> CoreResult<usize> {
        let mut stmt = self.prepare_cached(sql)?;
        Ok(stmt.execute(rusqlite::params_from_iter(params.iter()))?)
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> CoreResult<Vec<Row>> {
        let mut stmt = self.prepare_cached(sql)?;
        let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
        let width = columns.len();

        let mut rows = stmt.query(rusqlite::params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                values.push(SqlValue::from(row.get::<_, SqliteValue>(i)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }
}

/// SQLite implementation of [`SqlEngine`].
///
/// SQLite serializes writers itself; the connection mutex only makes the
/// handle shareable across tasks.
pub struct SqliteEngine {
    conn: Mutex<Connection>,
    location: String,
}

impl std::fmt::Debug for SqliteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteEngine")
            .field("location", &self.location)
            .finish()
    }
}

impl SqliteEngine {
    /// Opens (or creates) a database file.
    pub fn open(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Self::configure(&conn)?;
        debug!(path = %path.display(), journal_mode = %mode, "opened sqlite cache database");
        Ok(Self {
            conn: Mutex::new(conn),
            location: path.display().to_string(),
        })
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            location: ":memory:".to_string(),
        })
    }

    /// Returns the file path, or `:memory:`.
    pub fn location(&self) -> &str {
        &self.location
    }

    fn configure(conn: &Connection) -> CoreResult<()> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Ok(())
    }
}

impl SqlExecutor for SqliteEngine {
    fn execute(&self, sql: &str, params: &[SqlValue]) -> CoreResult<usize> {
        SqlExecutor::execute(&*self.conn.lock(), sql, params)
    }

    fn query_all(&self, sql: &str, params: &[SqlValue]) -> CoreResult<Vec<Row>> {
        SqlExecutor::query_all(&*self.conn.lock(), sql, params)
    }
}

impl SqlEngine for SqliteEngine {
    fn run_in_transaction(
        &self,
        f: &mut dyn FnMut(&dyn SqlExecutor) -> CoreResult<()>,
    ) -> CoreResult<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        match f(&*tx) {
            Ok(()) => {
                tx.commit()?;
                Ok(())
            }
            Err(err) => {
                debug!(error = %err, "rolling back transaction");
                tx.rollback()?;
                Err(err)
            }
        }
    }
}

/// Returns true if `table` exists.
pub fn table_exists<E: SqlExecutor + ?Sized>(executor: &E, table: &str) -> CoreResult<bool> {
    let row = executor.query_one(
        "SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1",
        &[SqlValue::from(table)],
    )?;
    Ok(row.is_some())
}

/// Returns the number of rows in `table`.
pub fn count_rows<E: SqlExecutor + ?Sized>(executor: &E, table: &str) -> CoreResult<u64> {
    let row = executor.query_one(&format!("SELECT COUNT(*) AS n FROM {table}"), &[])?;
    row.and_then(|r| r.integer("n"))
        .map(|n| n as u64)
        .ok_or_else(|| CoreError::invalid_row(table, "COUNT(*) returned no value"))
}
