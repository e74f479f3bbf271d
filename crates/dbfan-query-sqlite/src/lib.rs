//! SQLite backend for dbfan-query
//!
//! `rusqlite` is synchronous, so the connection lives behind a mutex and every
//! call runs on the blocking thread pool. Rows are read inside that call and
//! handed back as a `BufferedCursor`.

use async_trait::async_trait;
use dbfan_query::{
    effective_limit, BackendKind, BufferedCursor, Column, Connector, DataError, Executor, Query,
    Result, RowCursor, ScanKind, Statement, Value,
};
use rusqlite::types::{ToSqlOutput, Value as SqlValue, ValueRef};
use rusqlite::{params_from_iter, Connection, ToSql};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, warn};

/// In-memory database path
pub const MEMORY_PATH: &str = ":memory:";

/// Connection settings for one SQLite target
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteConfig {
    /// Database file, or `:memory:` for a private in-memory database
    pub path: String,
}

impl SqliteConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_memory() -> Self {
        Self::new(MEMORY_PATH)
    }
}

pub struct SqliteConnector {
    config: SqliteConfig,
}

impl SqliteConnector {
    pub fn new(config: SqliteConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for SqliteConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn describe(&self) -> String {
        format!("sqlite://{}", self.config.path)
    }

    async fn connect(&self) -> Result<Arc<dyn Executor>> {
        let path = self.config.path.clone();

        debug!("Opening SQLite database: {}", path);

        let connection = tokio::task::spawn_blocking(move || {
            let connection = if path == MEMORY_PATH {
                Connection::open_in_memory()
            } else {
                Connection::open(&path)
            }
            .map_err(|e| DataError::connection_failed(BackendKind::Sqlite, e))?;

            connection
                .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
                .map_err(|e| DataError::connection_failed(BackendKind::Sqlite, e))?;

            Ok::<_, DataError>(connection)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite open task failed: {}", e)))??;

        Ok(Arc::new(SqliteExecutor {
            connection: Arc::new(Mutex::new(Some(connection))),
        }))
    }
}

/// An open SQLite database
pub struct SqliteExecutor {
    connection: Arc<Mutex<Option<Connection>>>,
}

impl SqliteExecutor {
    /// Run `f` against the connection on the blocking pool
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let connection = self.connection.clone();

        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| DataError::Internal("SQLite connection lock poisoned".to_string()))?;
            let connection = guard
                .as_mut()
                .ok_or_else(|| DataError::query_failed("SQLite connection is closed"))?;
            f(connection)
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite task failed: {}", e)))?
    }
}

struct SqliteParam<'a>(&'a Value);

impl ToSql for SqliteParam<'_> {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(match self.0 {
            Value::Null => ToSqlOutput::Owned(SqlValue::Null),
            Value::Bool(b) => ToSqlOutput::Owned(SqlValue::Integer(i64::from(*b))),
            Value::Int(i) => ToSqlOutput::Owned(SqlValue::Integer(*i)),
            Value::Float(f) => ToSqlOutput::Owned(SqlValue::Real(*f)),
            Value::Text(s) => ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes())),
        })
    }
}

fn query_error(sql: &str, e: rusqlite::Error) -> DataError {
    error!("SQLite query failed: {}", e);
    error!("Failed SQL: {}", sql);
    DataError::query_failed(format!("{}\n\nQuery: {}", e, sql))
}

fn storage_type_name(value: &SqlValue) -> Option<&'static str> {
    match value {
        SqlValue::Integer(_) => Some("INTEGER"),
        SqlValue::Real(_) => Some("REAL"),
        SqlValue::Text(_) => Some("TEXT"),
        SqlValue::Blob(_) => Some("BLOB"),
        SqlValue::Null => None,
    }
}

/// Storage class shared by every non-null cell. Integers and reals widen to
/// REAL, any other mix to TEXT.
fn widened_storage_type<'a>(cells: impl Iterator<Item = &'a SqlValue>) -> Option<&'static str> {
    let mut widened: Option<&'static str> = None;

    for current in cells.filter_map(storage_type_name) {
        widened = Some(match (widened, current) {
            (None, current) => current,
            (Some(previous), current) if previous == current => previous,
            (Some("INTEGER"), "REAL") | (Some("REAL"), "INTEGER") => "REAL",
            _ => return Some("TEXT"),
        });
    }

    widened
}

/// SQLite only advises column types, so a declared type is kept only while
/// every buffered cell can be scanned as that type.
fn column_type_name<'a>(
    decl_type: Option<String>,
    mut cells: impl Iterator<Item = &'a SqlValue> + Clone,
) -> String {
    let widened = widened_storage_type(cells.clone());

    let Some(decl_type) = decl_type else {
        return widened.unwrap_or_default().to_string();
    };

    let declared_kind = ScanKind::for_type_name(&decl_type);
    let fits = cells.all(|cell| match declared_kind {
        ScanKind::Text => true,
        ScanKind::Int64 | ScanKind::Bool => {
            matches!(cell, SqlValue::Null | SqlValue::Integer(_))
        }
        ScanKind::Float64 => {
            matches!(cell, SqlValue::Null | SqlValue::Integer(_) | SqlValue::Real(_))
        }
    });

    match (fits, widened) {
        (true, _) => decl_type,
        (false, Some("REAL")) => "REAL".to_string(),
        (false, _) => "TEXT".to_string(),
    }
}

fn to_json(value: SqlValue, kind: ScanKind) -> serde_json::Value {
    use serde_json::Value as Json;

    match value {
        SqlValue::Null => Json::Null,
        // Booleans are stored as integers
        SqlValue::Integer(i) if kind == ScanKind::Bool => Json::Bool(i != 0),
        SqlValue::Integer(i) => Json::from(i),
        SqlValue::Real(f) => match serde_json::Number::from_f64(f) {
            Some(n) => Json::Number(n),
            None => Json::String(f.to_string()),
        },
        SqlValue::Text(s) => Json::String(s),
        SqlValue::Blob(bytes) => Json::String(bytes.iter().map(|b| format!("{:02x}", b)).collect()),
    }
}

/// Execute a query and read at most `limit` rows. The statement is finalized on return.
fn read_rows(
    connection: &Connection,
    sql: &str,
    params: &[Value],
    limit: usize,
) -> Result<BufferedCursor> {
    let mut statement = connection.prepare(sql).map_err(|e| query_error(sql, e))?;

    let declared: Vec<(String, Option<String>)> = statement
        .columns()
        .iter()
        .map(|column| {
            (
                column.name().to_string(),
                column.decl_type().map(str::to_string),
            )
        })
        .collect();

    let mut rows = statement
        .query(params_from_iter(params.iter().map(SqliteParam)))
        .map_err(|e| query_error(sql, e))?;

    let mut raw: Vec<Vec<SqlValue>> = Vec::new();
    while raw.len() < limit {
        let Some(row) = rows
            .next()
            .map_err(|e| DataError::read_failed(e.to_string()))?
        else {
            break;
        };

        let values = (0..declared.len())
            .map(|idx| row.get::<_, SqlValue>(idx))
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| DataError::read_failed(e.to_string()))?;
        raw.push(values);
    }

    let columns: Vec<Column> = declared
        .into_iter()
        .enumerate()
        .map(|(idx, (name, decl_type))| {
            let type_name = column_type_name(decl_type, raw.iter().map(|row| &row[idx]));
            Column::new(name, type_name)
        })
        .collect();

    let kinds: Vec<ScanKind> = columns
        .iter()
        .map(|column| ScanKind::for_type_name(&column.type_name))
        .collect();

    let rows = raw
        .into_iter()
        .map(|row| {
            row.into_iter()
                .zip(&kinds)
                .map(|(value, kind)| to_json(value, *kind))
                .collect()
        })
        .collect();

    Ok(BufferedCursor::new(columns, rows))
}

#[async_trait]
impl Executor for SqliteExecutor {
    async fn run_query(
        &self,
        query: &Query,
        params: &[Value],
        limit: usize,
    ) -> Result<Box<dyn RowCursor>> {
        let sql = query.require_text(BackendKind::Sqlite)?.to_string();
        let params = params.to_vec();
        let limit = effective_limit(limit);

        debug!("Executing SQL: {}", sql);

        let cursor = self
            .blocking(move |connection| read_rows(connection, &sql, &params, limit))
            .await?;

        Ok(Box::new(cursor))
    }

    async fn run_exec(&self, query: &Query, params: &[Value]) -> Result<u64> {
        let sql = query.require_text(BackendKind::Sqlite)?.to_string();
        let params = params.to_vec();

        let affected = self
            .blocking(move |connection| {
                connection
                    .execute(&sql, params_from_iter(params.iter().map(SqliteParam)))
                    .map_err(|e| query_error(&sql, e))
            })
            .await?;

        debug!("SQL affected {} rows", affected);
        Ok(affected as u64)
    }

    async fn run_in_transaction(&self, statements: &[Statement]) -> Result<u64> {
        let statements = statements
            .iter()
            .map(|statement| {
                statement
                    .query
                    .require_text(BackendKind::Sqlite)
                    .map(|sql| (sql.to_string(), statement.params.clone()))
            })
            .collect::<Result<Vec<_>>>()?;

        self.blocking(move |connection| {
            let transaction = connection
                .transaction()
                .map_err(|e| DataError::query_failed(format!("BEGIN failed: {}", e)))?;

            let mut total = 0u64;
            for (sql, params) in &statements {
                // An early return drops the transaction, which rolls it back
                total += transaction
                    .execute(sql, params_from_iter(params.iter().map(SqliteParam)))
                    .map_err(|e| query_error(sql, e))? as u64;
            }

            transaction
                .commit()
                .map_err(|e| DataError::query_failed(format!("COMMIT failed: {}", e)))?;

            debug!("Committed {} statements, {} rows affected", statements.len(), total);
            Ok(total)
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        let connection = self.connection.clone();

        tokio::task::spawn_blocking(move || {
            let taken = match connection.lock() {
                Ok(mut guard) => guard.take(),
                Err(_) => {
                    return Err(DataError::Internal(
                        "SQLite connection lock poisoned".to_string(),
                    ))
                }
            };

            if let Some(connection) = taken {
                if let Err((_, e)) = connection.close() {
                    warn!("Failed to close SQLite database cleanly: {}", e);
                    return Err(DataError::Internal(format!("SQLite close failed: {}", e)));
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| DataError::Internal(format!("SQLite task failed: {}", e)))?
    }
}
