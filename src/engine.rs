//! Execution collaborator interface and the bundled SQLite implementation.
//! The engine registers the `dfc_abort` scalar function whose evaluation
//! raises a fatal error carrying a KILL policy's description.

use std::path::Path;

use rusqlite::Connection;
use rusqlite::functions::FunctionFlags;
use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{DfcError, Result};

const ABORT_PREFIX: &str = "dfc policy abort: ";

/// A single result cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Integer(i) => *i != 0,
            Value::Real(r) => *r != 0.0,
            Value::Text(s) => !s.is_empty(),
            Value::Blob(b) => !b.is_empty(),
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Integer(i) => Some(*i as f64),
            Value::Real(r) => Some(*r),
            _ => None,
        }
    }
}

impl From<ValueRef<'_>> for Value {
    fn from(value: ValueRef<'_>) -> Self {
        match value {
            ValueRef::Null => Value::Null,
            ValueRef::Integer(i) => Value::Integer(i),
            ValueRef::Real(r) => Value::Real(r),
            ValueRef::Text(t) => Value::Text(String::from_utf8_lossy(t).into_owned()),
            ValueRef::Blob(b) => Value::Blob(b.to_vec()),
        }
    }
}

/// Result rows with their column names in projection order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Rows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The relational backend transformed SQL is handed to. Catalog access is
/// part of the same collaborator.
pub trait Engine: Catalog {
    fn execute(&self, sql: &str) -> Result<Rows>;
}

/// SQLite-backed engine. A fired `dfc_abort` surfaces as
/// [`DfcError::ExecutionAbort`] with the policy description.
pub struct SqliteEngine {
    conn: Connection,
}

impl SqliteEngine {
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // Not deterministic: it must run once per candidate row.
        conn.create_scalar_function("dfc_abort", 1, FunctionFlags::SQLITE_UTF8, |ctx| {
            let message: String = ctx.get(0)?;
            Err::<bool, _>(rusqlite::Error::UserFunctionError(
                format!("{ABORT_PREFIX}{message}").into(),
            ))
        })?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Engine for SqliteEngine {
    fn execute(&self, sql: &str) -> Result<Rows> {
        log::debug!("executing: {sql}");
        run_query(&self.conn, sql).map_err(map_engine_error)
    }
}

fn run_query(conn: &Connection, sql: &str) -> rusqlite::Result<Rows> {
    let mut stmt = conn.prepare(sql)?;
    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut raw = stmt.query([])?;
    while let Some(row) = raw.next()? {
        let mut values = Vec::with_capacity(width);
        for index in 0..width {
            values.push(Value::from(row.get_ref(index)?));
        }
        rows.push(values);
    }
    Ok(Rows { columns, rows })
}

fn map_engine_error(err: rusqlite::Error) -> DfcError {
    let message = err.to_string();
    match message.find(ABORT_PREFIX) {
        Some(position) => {
            DfcError::ExecutionAbort(message[position + ABORT_PREFIX.len()..].to_string())
        }
        None => DfcError::Engine(err),
    }
}

impl Catalog for SqliteEngine {
    fn table_exists(&self, table: &str) -> Result<bool> {
        let mut stmt = self.conn.prepare(
            "SELECT 1 FROM sqlite_master WHERE type IN ('table', 'view') AND lower(name) = ?1",
        )?;
        Ok(stmt.exists([table.to_lowercase()])?)
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM pragma_table_info(?1) WHERE lower(name) = ?2")?;
        Ok(stmt.exists(rusqlite::params![table, column.to_lowercase()])?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> SqliteEngine {
        let engine = SqliteEngine::open_in_memory().unwrap();
        engine
            .execute("CREATE TABLE foo (id INTEGER, name TEXT)")
            .unwrap();
        engine
            .execute("INSERT INTO foo VALUES (1, 'Alice'), (2, 'Bob'), (3, 'Charlie')")
            .unwrap();
        engine
    }

    #[test]
    fn executes_and_returns_typed_rows() {
        let rows = engine().execute("SELECT id, name FROM foo ORDER BY id").unwrap();
        assert_eq!(rows.columns, vec!["id", "name"]);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows.rows[0][0], Value::Integer(1));
        assert_eq!(rows.rows[0][1], Value::Text("Alice".into()));
    }

    #[test]
    fn abort_function_maps_to_execution_abort() {
        let err = engine()
            .execute("SELECT CASE WHEN id < 2 THEN TRUE ELSE dfc_abort('too big') END FROM foo")
            .unwrap_err();
        match err {
            DfcError::ExecutionAbort(message) => assert_eq!(message, "too big"),
            other => panic!("expected ExecutionAbort, got {other}"),
        }
    }

    #[test]
    fn abort_does_not_fire_when_all_rows_satisfy() {
        let rows = engine()
            .execute("SELECT CASE WHEN id < 10 THEN TRUE ELSE dfc_abort('x') END FROM foo")
            .unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn catalog_reports_tables_and_columns() {
        let engine = engine();
        assert!(engine.table_exists("foo").unwrap());
        assert!(engine.table_exists("FOO").unwrap());
        assert!(!engine.table_exists("missing").unwrap());
        assert!(engine.column_exists("foo", "id").unwrap());
        assert!(engine.column_exists("foo", "NAME").unwrap());
        assert!(!engine.column_exists("foo", "missing").unwrap());
    }

    #[test]
    fn truthiness_follows_sql_semantics() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Integer(0).is_truthy());
        assert!(Value::Integer(1).is_truthy());
        assert!(Value::Real(0.5).is_truthy());
    }
}
