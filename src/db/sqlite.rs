//! SQLite adapter
//!
//! rusqlite is synchronous, so every call runs on the blocking pool with the
//! connection behind a mutex. Cancellation goes through the connection's
//! interrupt handle, which is safe to use from any thread.

use crate::config::connections::Endpoint;
use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{
    ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary, expand_file_path,
};
use crate::db::schema::{Column, Index, Schema, SchemaTree, Table, Trigger};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConfigError, ConnectionError, ConnectionFailure, Result, StatementError, StatementResult,
    VizdbError,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::types::ValueRef;
use rusqlite::{Connection as RusqliteConnection, ErrorCode, InterruptHandle, OpenFlags};
use std::sync::Arc;

pub struct SqliteAdapter;

#[async_trait]
impl DriverAdapter for SqliteAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let Endpoint::File { path } = &target.endpoint else {
            return Err(VizdbError::Config(ConfigError::Invalid(
                "sqlite needs a file path".into(),
            )));
        };
        let path = expand_file_path(path)?;
        let read_only = matches!(target.option("mode"), Some("ro") | Some("readonly"));

        let conn = tokio::task::spawn_blocking(move || open(&path, read_only))
            .await
            .map_err(|e| ConnectionError::new(ConnectionFailure::HandshakeFailed, e.to_string()))??;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        Ok(Arc::new(SqliteConnection {
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
        }))
    }
}

fn open(path: &str, read_only: bool) -> Result<RusqliteConnection> {
    tracing::info!(path, read_only, "opening SQLite database");
    let mut flags = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    flags |= if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
    };

    if path != ":memory:"
        && !path.starts_with("file:")
        && let Some(parent) = std::path::Path::new(path).parent()
        && !parent.exists()
    {
        return Err(ConnectionError::new(
            ConnectionFailure::Unreachable,
            format!("directory does not exist: {}", parent.display()),
        )
        .into());
    }

    let conn = RusqliteConnection::open_with_flags(path, flags).map_err(connect_error)?;
    conn.pragma_update(None, "foreign_keys", "ON")
        .map_err(connect_error)?;
    // Reading the schema forces SQLite to look at the file header
    conn.query_row("SELECT count(*) FROM sqlite_master", [], |_| Ok(()))
        .map_err(connect_error)?;
    Ok(conn)
}

fn connect_error(e: rusqlite::Error) -> VizdbError {
    let kind = match e.sqlite_error_code() {
        Some(ErrorCode::CannotOpen) => ConnectionFailure::Unreachable,
        Some(ErrorCode::PermissionDenied) | Some(ErrorCode::AuthorizationForStatementDenied) => {
            ConnectionFailure::AuthRejected
        }
        _ => ConnectionFailure::HandshakeFailed,
    };
    ConnectionError::with_source(kind, e).into()
}

fn statement_error(e: rusqlite::Error) -> StatementError {
    let message = e.to_string();
    match e.sqlite_error_code() {
        Some(ErrorCode::PermissionDenied)
        | Some(ErrorCode::ReadOnly)
        | Some(ErrorCode::AuthorizationForStatementDenied) => StatementError::Permission(message),
        Some(ErrorCode::OperationInterrupted) => StatementError::Driver {
            message,
            code: Some("SQLITE_INTERRUPT".into()),
        },
        Some(ErrorCode::SystemIoFailure) | Some(ErrorCode::CannotOpen) => {
            StatementError::ConnectivityLost(message)
        }
        _ if message.contains("syntax error") || message.contains("incomplete input") => {
            StatementError::Syntax(message)
        }
        Some(code) => StatementError::Driver {
            message,
            code: Some(format!("{:?}", code)),
        },
        None => StatementError::driver(message),
    }
}

struct SqliteConnection {
    conn: Arc<Mutex<Option<RusqliteConnection>>>,
    interrupt: Arc<InterruptHandle>,
}

impl SqliteConnection {
    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> StatementResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&RusqliteConnection) -> StatementResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| StatementError::ConnectivityLost("connection is closed".into()))?;
            f(conn)
        })
        .await
        .map_err(|e| StatementError::driver(format!("SQLite task failed: {}", e)))?
    }
}

#[async_trait]
impl Connection for SqliteConnection {
    async fn execute(&self, req: ExecRequest) -> StatementResult<ExecSummary> {
        self.with_conn(move |conn| run_statement(conn, req)).await
    }

    async fn cancel(&self) -> StatementResult<()> {
        tracing::debug!("interrupting SQLite statement");
        self.interrupt.interrupt();
        Ok(())
    }

    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        let scope = schema.map(str::to_string);
        self.with_conn(move |conn| introspect(conn, features, scope.as_deref()))
            .await
    }

    async fn ping(&self) -> StatementResult<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))
                .map_err(statement_error)
        })
        .await
    }

    async fn close(&self) {
        let conn = self.conn.clone();
        let closed = tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take()
                && let Err((_, e)) = conn.close()
            {
                tracing::warn!(error = %e, "SQLite close failed");
            }
        })
        .await;
        if let Err(e) = closed {
            tracing::warn!(error = %e, "SQLite close task failed");
        }
    }
}

fn run_statement(conn: &RusqliteConnection, mut req: ExecRequest) -> StatementResult<ExecSummary> {
    let mut stmt = conn.prepare(&req.sql).map_err(statement_error)?;

    if stmt.column_count() == 0 {
        let affected = stmt.execute([]).map_err(statement_error)?;
        return Ok(req.sink.summary(Some(affected as u64)));
    }

    let columns: Vec<ColumnDef> = stmt
        .columns()
        .iter()
        .map(|col| {
            let data_type = col
                .decl_type()
                .map(DataType::from_declared)
                .unwrap_or_else(|| DataType::Unknown("dynamic".into()));
            ColumnDef::new(col.name(), data_type)
        })
        .collect();
    if req.sink.columns_blocking(columns.clone()).is_break() {
        return Ok(req.sink.summary(None));
    }

    let mut rows = stmt.query([]).map_err(statement_error)?;
    while let Some(row) = rows.next().map_err(statement_error)? {
        let values = columns
            .iter()
            .enumerate()
            .map(|(i, col)| match row.get_ref(i) {
                Ok(value) => value_ref_to_cell(value, &col.data_type),
                Err(_) => CellValue::Null,
            })
            .collect();
        if req.sink.push_blocking(Row::new(values)).is_break() {
            break;
        }
    }
    let _ = req.sink.flush_blocking();
    Ok(req.sink.summary(None))
}

/// Convert a SQLite value. Storage classes are dynamic, so the declared
/// column type only refines text values.
fn value_ref_to_cell(value: ValueRef<'_>, declared: &DataType) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Integer(i) if *declared == DataType::Boolean => CellValue::Boolean(i != 0),
        ValueRef::Integer(i) => CellValue::Integer(i),
        ValueRef::Real(f) => CellValue::Float(f),
        ValueRef::Text(bytes) => {
            let text = String::from_utf8_lossy(bytes).into_owned();
            match declared {
                DataType::Json | DataType::Jsonb => serde_json::from_str(&text)
                    .map(CellValue::Json)
                    .unwrap_or(CellValue::Text(text)),
                DataType::Date | DataType::Time | DataType::Timestamp | DataType::TimestampTz => {
                    CellValue::DateTime(text)
                }
                DataType::Uuid => CellValue::Uuid(text),
                _ => CellValue::Text(text),
            }
        }
        ValueRef::Blob(bytes) => CellValue::Binary(bytes.to_vec()),
    }
}

fn quote(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn introspect(
    conn: &RusqliteConnection,
    features: IntrospectionFeatures,
    scope: Option<&str>,
) -> StatementResult<SchemaTree> {
    // Attached databases are SQLite's schemas
    let mut names: Vec<String> = {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_database_list ORDER BY seq")
            .map_err(statement_error)?;
        let rows = stmt
            .query_map([], |r| r.get::<_, String>(0))
            .map_err(statement_error)?;
        rows.collect::<rusqlite::Result<_>>().map_err(statement_error)?
    };
    names.retain(|n| n != "temp" && scope.is_none_or(|s| s == n));

    let mut schemas = Vec::with_capacity(names.len());
    for name in names {
        schemas.push(introspect_schema(conn, features, &name)?);
    }
    Ok(SchemaTree { schemas })
}

fn introspect_schema(
    conn: &RusqliteConnection,
    features: IntrospectionFeatures,
    schema_name: &str,
) -> StatementResult<Schema> {
    let mut schema = Schema::named(schema_name);
    let master = format!("{}.sqlite_master", quote(schema_name));

    let objects: Vec<(String, String, String)> = {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT type, name, tbl_name FROM {} \
                 WHERE name NOT LIKE 'sqlite_%' ORDER BY name",
                master
            ))
            .map_err(statement_error)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .map_err(statement_error)?;
        rows.collect::<rusqlite::Result<_>>().map_err(statement_error)?
    };

    let mut column_stmt = conn
        .prepare("SELECT name, type, pk FROM pragma_table_info(?1, ?2) ORDER BY cid")
        .map_err(statement_error)?;
    let mut load_columns = |table: &str| -> StatementResult<Vec<Column>> {
        let rows = column_stmt
            .query_map([table, schema_name], |r| {
                let type_name: String = r.get(1)?;
                Ok(Column {
                    name: r.get(0)?,
                    data_type: DataType::from_declared(&type_name),
                    is_primary_key: r.get::<_, i64>(2)? > 0,
                })
            })
            .map_err(statement_error)?;
        rows.collect::<rusqlite::Result<_>>().map_err(statement_error)
    };

    for (kind, name, table_name) in &objects {
        match kind.as_str() {
            "table" => schema.tables.push(Table::new(name.clone(), load_columns(name)?)),
            "view" if features.views => {
                schema.views.push(Table::new(name.clone(), load_columns(name)?))
            }
            "trigger" if features.triggers => schema.triggers.push(Trigger {
                name: name.clone(),
                table_name: table_name.clone(),
            }),
            _ => {}
        }
    }

    if features.indexes {
        let mut list_stmt = conn
            .prepare("SELECT name, \"unique\" FROM pragma_index_list(?1, ?2) ORDER BY name")
            .map_err(statement_error)?;
        let mut info_stmt = conn
            .prepare("SELECT name FROM pragma_index_info(?1, ?2) ORDER BY seqno")
            .map_err(statement_error)?;
        for table in &schema.tables {
            let indexes: Vec<(String, bool)> = list_stmt
                .query_map([table.name.as_str(), schema_name], |r| {
                    Ok((r.get(0)?, r.get::<_, i64>(1)? != 0))
                })
                .map_err(statement_error)?
                .collect::<rusqlite::Result<_>>()
                .map_err(statement_error)?;
            for (index_name, is_unique) in indexes {
                let columns: Vec<String> = info_stmt
                    .query_map([index_name.as_str(), schema_name], |r| {
                        r.get::<_, Option<String>>(0)
                    })
                    .map_err(statement_error)?
                    .filter_map(|c| c.transpose())
                    .collect::<rusqlite::Result<_>>()
                    .map_err(statement_error)?;
                schema.indexes.push(Index {
                    name: index_name,
                    table_name: table.name.clone(),
                    columns,
                    is_unique,
                });
            }
        }
    }

    Ok(schema)
}
