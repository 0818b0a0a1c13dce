//! SQLite Execution Engine
//!
//! Local warehouse backend. Connections are opened read-only per call and
//! run on the blocking pool; dropping the call interrupts the statement.

use super::{ErrorClassifier, ExecutionReport, QueryExecutor, ResultSet};
use crate::error::{AgentError, Result};
use crate::schema::{ColumnSchema, SchemaContext, SchemaSource, TableSchema};
use async_trait::async_trait;
use rusqlite::types::ValueRef;
use rusqlite::{Connection, InterruptHandle, OpenFlags};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const SAMPLE_ROWS: usize = 3;

pub struct SqliteExecutor {
    path: PathBuf,
    max_rows: usize,
    classifier: ErrorClassifier,
}

impl SqliteExecutor {
    pub fn new(path: impl Into<PathBuf>, max_rows: usize) -> Self {
        Self {
            path: path.into(),
            max_rows,
            classifier: ErrorClassifier::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(path: &Path) -> rusqlite::Result<Connection> {
        Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
    }
}

/// Interrupts the running statement unless disarmed first
struct InterruptOnDrop(Option<InterruptHandle>);

impl InterruptOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        if let Some(handle) = self.0.take() {
            warn!("Interrupting SQLite statement on cancellation");
            handle.interrupt();
        }
    }
}

enum QueryFailure {
    Write,
    Sqlite(rusqlite::Error),
}

impl From<rusqlite::Error> for QueryFailure {
    fn from(e: rusqlite::Error) -> Self {
        QueryFailure::Sqlite(e)
    }
}

fn run_query(
    conn: &Connection,
    sql: &str,
    max_rows: usize,
) -> std::result::Result<ResultSet, QueryFailure> {
    let mut stmt = conn.prepare(sql)?;
    if !stmt.readonly() {
        return Err(QueryFailure::Write);
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|c| c.to_string()).collect();
    let width = columns.len();
    let mut result = ResultSet::new(columns, Vec::new());

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        if result.rows.len() == max_rows {
            result.truncated = true;
            break;
        }
        let mut cells = Vec::with_capacity(width);
        for i in 0..width {
            cells.push(cell_to_json(row.get_ref(i)?));
        }
        result.rows.push(cells);
    }
    Ok(result)
}

fn cell_to_json(value: ValueRef<'_>) -> Value {
    match value {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::from(i),
        ValueRef::Real(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        ValueRef::Text(t) => Value::String(String::from_utf8_lossy(t).to_string()),
        ValueRef::Blob(b) => Value::String(format!("<{} bytes>", b.len())),
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn describe(conn: &Connection) -> rusqlite::Result<Vec<TableSchema>> {
    let mut names_stmt = conn.prepare(
        "SELECT name FROM sqlite_master \
         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' \
         ORDER BY name",
    )?;
    let names: Vec<String> = names_stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;

    let mut tables = Vec::with_capacity(names.len());
    for name in names {
        let mut info = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(&name)))?;
        let columns: Vec<ColumnSchema> = info
            .query_map([], |row| {
                let mut column = ColumnSchema::new(
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                );
                column.primary_key = row.get::<_, i64>(5)? > 0;
                Ok(column)
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut table = TableSchema::new(name.clone(), columns);

        let mut fks = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(&name)))?;
        let foreign_keys: Vec<(String, String, String)> = fks
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(4)?.unwrap_or_else(|| "id".to_string()),
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        for (column, references_table, references_column) in foreign_keys {
            table = table.with_foreign_key(column, references_table, references_column);
        }

        let sample = run_query(
            conn,
            &format!("SELECT * FROM {} LIMIT {}", quote_ident(&name), SAMPLE_ROWS),
            SAMPLE_ROWS,
        );
        if let Ok(sample) = sample {
            table.sample_rows = sample.rows;
        }
        tables.push(table);
    }
    Ok(tables)
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    async fn execute(&self, sql: &str) -> ExecutionReport {
        let conn = match Self::open(&self.path) {
            Ok(conn) => conn,
            Err(e) => {
                return ExecutionReport::runtime_error(format!(
                    "failed to open {}: {}",
                    self.path.display(),
                    e
                ))
            }
        };

        let guard = InterruptOnDrop(Some(conn.get_interrupt_handle()));
        let sql = sql.to_string();
        let max_rows = self.max_rows;
        let joined = tokio::task::spawn_blocking(move || run_query(&conn, &sql, max_rows)).await;
        guard.disarm();

        match joined {
            Ok(Ok(result)) => ExecutionReport::rows(result),
            Ok(Err(QueryFailure::Write)) => ExecutionReport::syntax_error(
                "only read-only SELECT queries are permitted",
            ),
            Ok(Err(QueryFailure::Sqlite(e))) => {
                let message = e.to_string();
                ExecutionReport::failure(self.classifier.classify(&message), message)
            }
            Err(e) => ExecutionReport::runtime_error(format!("executor task failed: {}", e)),
        }
    }

    fn name(&self) -> &str {
        "sqlite"
    }
}

#[async_trait]
impl SchemaSource for SqliteExecutor {
    async fn describe_schema(&self) -> Result<SchemaContext> {
        let path = self.path.clone();
        let tables = tokio::task::spawn_blocking(move || {
            let conn = Self::open(&path)?;
            describe(&conn)
        })
        .await
        .map_err(|e| AgentError::Execution(format!("Schema task failed: {}", e)))?
        .map_err(|e| AgentError::Execution(format!("Failed to describe SQLite schema: {}", e)))?;

        info!("Described {} table(s) from {}", tables.len(), self.path.display());
        Ok(SchemaContext::new(tables))
    }
}
