//! DuckDB adapter
//!
//! Same shape as the SQLite adapter: the embedded engine runs on the blocking
//! pool. DuckDB has no interrupt hook here, so cancellation is local only.

use crate::config::connections::Endpoint;
use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{
    ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary, expand_file_path,
};
use crate::db::schema::{Column, Index, Schema, SchemaTree, Table};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConfigError, ConnectionError, ConnectionFailure, Result, StatementError, StatementResult,
    VizdbError,
};
use async_trait::async_trait;
use duckdb::types::{TimeUnit, ValueRef};
use duckdb::{AccessMode, Config};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Statements that produce a result set
const QUERY_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "VALUES", "TABLE", "FROM", "SHOW", "DESCRIBE", "SUMMARIZE", "PRAGMA",
    "EXPLAIN", "CALL",
];

pub struct DuckdbAdapter;

#[async_trait]
impl DriverAdapter for DuckdbAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Duckdb
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let Endpoint::File { path } = &target.endpoint else {
            return Err(VizdbError::Config(ConfigError::Invalid(
                "duckdb needs a file path".into(),
            )));
        };
        let path = expand_file_path(path)?;
        let read_only = matches!(target.option("mode"), Some("ro") | Some("readonly"));

        let conn = tokio::task::spawn_blocking(move || open(&path, read_only))
            .await
            .map_err(|e| ConnectionError::new(ConnectionFailure::HandshakeFailed, e.to_string()))??;

        Ok(Arc::new(DuckdbConnection {
            conn: Arc::new(Mutex::new(Some(conn))),
        }))
    }
}

fn open(path: &str, read_only: bool) -> Result<duckdb::Connection> {
    tracing::info!(path, read_only, "opening DuckDB database");
    if path == ":memory:" {
        return duckdb::Connection::open_in_memory().map_err(connect_error);
    }
    if let Some(parent) = std::path::Path::new(path).parent()
        && !parent.exists()
    {
        return Err(ConnectionError::new(
            ConnectionFailure::Unreachable,
            format!("directory does not exist: {}", parent.display()),
        )
        .into());
    }
    let mode = if read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    };
    let config = Config::default().access_mode(mode).map_err(connect_error)?;
    duckdb::Connection::open_with_flags(path, config).map_err(connect_error)
}

fn connect_error(e: duckdb::Error) -> VizdbError {
    let message = e.to_string();
    let kind = if message.contains("IO Error") || message.contains("No such file") {
        ConnectionFailure::Unreachable
    } else {
        ConnectionFailure::HandshakeFailed
    };
    ConnectionError::with_source(kind, e).into()
}

/// DuckDB messages start with their error class ("Parser Error: ...")
fn statement_error(e: duckdb::Error) -> StatementError {
    let message = e.to_string();
    let class = message
        .split_once(" Error:")
        .map(|(class, _)| class.trim().to_string());
    match class.as_deref() {
        Some("Parser") => StatementError::Syntax(message),
        Some("Permission") => StatementError::Permission(message),
        Some("Connection") | Some("IO") => StatementError::ConnectivityLost(message),
        _ => StatementError::Driver {
            message,
            code: class,
        },
    }
}

struct DuckdbConnection {
    conn: Arc<Mutex<Option<duckdb::Connection>>>,
}

impl DuckdbConnection {
    async fn with_conn<T, F>(&self, f: F) -> StatementResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&duckdb::Connection) -> StatementResult<T> + Send + 'static,
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
        .map_err(|e| StatementError::driver(format!("DuckDB task failed: {}", e)))?
    }
}

#[async_trait]
impl Connection for DuckdbConnection {
    async fn execute(&self, req: ExecRequest) -> StatementResult<ExecSummary> {
        self.with_conn(move |conn| run_statement(conn, req)).await
    }

    async fn cancel(&self) -> StatementResult<()> {
        // Local stop only; the sink observes the token between rows
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
            conn.execute_batch("SELECT 1").map_err(statement_error)
        })
        .await
    }

    async fn close(&self) {
        let conn = self.conn.clone();
        let closed = tokio::task::spawn_blocking(move || {
            if let Some(conn) = conn.lock().take()
                && let Err((_, e)) = conn.close()
            {
                tracing::warn!(error = %e, "DuckDB close failed");
            }
        })
        .await;
        if let Err(e) = closed {
            tracing::warn!(error = %e, "DuckDB close task failed");
        }
    }
}

fn run_statement(conn: &duckdb::Connection, mut req: ExecRequest) -> StatementResult<ExecSummary> {
    let returns_rows = crate::sql::leading_keyword(&req.sql)
        .is_some_and(|k| QUERY_KEYWORDS.contains(&k.as_str()));
    if !returns_rows {
        let affected = conn.execute(&req.sql, []).map_err(statement_error)?;
        return Ok(req.sink.summary(Some(affected as u64)));
    }

    let mut stmt = conn.prepare(&req.sql).map_err(statement_error)?;
    let mut rows = stmt.query([]).map_err(statement_error)?;

    // Column metadata is only known once the statement has run
    let columns: Vec<ColumnDef> = rows
        .as_ref()
        .map(|stmt| {
            stmt.column_names()
                .into_iter()
                .enumerate()
                .map(|(i, name)| {
                    let arrow_type = format!("{:?}", stmt.column_type(i));
                    ColumnDef::new(name, DataType::from_declared(&arrow_type))
                })
                .collect()
        })
        .unwrap_or_default();
    if req.sink.columns_blocking(columns.clone()).is_break() {
        return Ok(req.sink.summary(None));
    }

    while let Some(row) = rows.next().map_err(statement_error)? {
        let values = (0..columns.len())
            .map(|i| match row.get_ref(i) {
                Ok(value) => value_ref_to_cell(value),
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

fn to_micros(unit: TimeUnit, value: i64) -> i64 {
    match unit {
        TimeUnit::Second => value.saturating_mul(1_000_000),
        TimeUnit::Millisecond => value.saturating_mul(1_000),
        TimeUnit::Microsecond => value,
        TimeUnit::Nanosecond => value / 1_000,
    }
}

fn value_ref_to_cell(value: ValueRef<'_>) -> CellValue {
    match value {
        ValueRef::Null => CellValue::Null,
        ValueRef::Boolean(b) => CellValue::Boolean(b),
        ValueRef::TinyInt(i) => CellValue::Integer(i.into()),
        ValueRef::SmallInt(i) => CellValue::Integer(i.into()),
        ValueRef::Int(i) => CellValue::Integer(i.into()),
        ValueRef::BigInt(i) => CellValue::Integer(i),
        ValueRef::UTinyInt(i) => CellValue::Integer(i.into()),
        ValueRef::USmallInt(i) => CellValue::Integer(i.into()),
        ValueRef::UInt(i) => CellValue::Integer(i.into()),
        ValueRef::UBigInt(i) => i64::try_from(i)
            .map(CellValue::Integer)
            .unwrap_or_else(|_| CellValue::Text(i.to_string())),
        ValueRef::HugeInt(i) => i64::try_from(i)
            .map(CellValue::Integer)
            .unwrap_or_else(|_| CellValue::Text(i.to_string())),
        ValueRef::Float(f) => CellValue::Float(f.into()),
        ValueRef::Double(f) => CellValue::Float(f),
        ValueRef::Decimal(d) => CellValue::Text(d.to_string()),
        ValueRef::Text(bytes) => CellValue::Text(String::from_utf8_lossy(bytes).into_owned()),
        ValueRef::Blob(bytes) => CellValue::Binary(bytes.to_vec()),
        ValueRef::Date32(days) => chrono::NaiveDate::from_ymd_opt(1970, 1, 1)
            .and_then(|epoch| epoch.checked_add_signed(chrono::Duration::days(days.into())))
            .map(|d| CellValue::DateTime(d.to_string()))
            .unwrap_or_else(|| CellValue::Text(days.to_string())),
        ValueRef::Timestamp(unit, v) => chrono::DateTime::from_timestamp_micros(to_micros(unit, v))
            .map(|ts| CellValue::DateTime(ts.naive_utc().to_string()))
            .unwrap_or_else(|| CellValue::Text(v.to_string())),
        ValueRef::Time64(unit, v) => {
            let micros = to_micros(unit, v);
            let secs = u32::try_from(micros / 1_000_000).unwrap_or(0);
            let nanos = u32::try_from((micros % 1_000_000) * 1_000).unwrap_or(0);
            chrono::NaiveTime::from_num_seconds_from_midnight_opt(secs, nanos)
                .map(|t| CellValue::DateTime(t.to_string()))
                .unwrap_or_else(|| CellValue::Text(v.to_string()))
        }
        other => CellValue::Text(format!("{:?}", other.to_owned())),
    }
}

fn introspect(
    conn: &duckdb::Connection,
    features: IntrospectionFeatures,
    scope: Option<&str>,
) -> StatementResult<SchemaTree> {
    let scope_filter = |col: &str| match scope {
        Some(_) => format!("AND {} = ?", col),
        None => String::new(),
    };
    let params = || duckdb::params_from_iter(scope.iter());

    let mut stmt = conn
        .prepare(&format!(
            "SELECT schema_name FROM information_schema.schemata \
             WHERE catalog_name = current_database() \
               AND schema_name NOT IN ('information_schema', 'pg_catalog') {} \
             ORDER BY schema_name",
            scope_filter("schema_name")
        ))
        .map_err(statement_error)?;
    let mut schemas: Vec<Schema> = stmt
        .query_map(params(), |r| r.get::<_, String>(0))
        .map_err(statement_error)?
        .map(|name| name.map(Schema::named))
        .collect::<duckdb::Result<_>>()
        .map_err(statement_error)?;
    let by_name: HashMap<String, usize> = schemas
        .iter()
        .enumerate()
        .map(|(i, s)| (s.name.clone(), i))
        .collect();

    let mut stmt = conn
        .prepare(&format!(
            "SELECT kcu.table_schema, kcu.table_name, kcu.column_name \
             FROM information_schema.key_column_usage kcu \
             JOIN information_schema.table_constraints tc \
               ON tc.constraint_name = kcu.constraint_name \
              AND tc.table_schema = kcu.table_schema \
             WHERE tc.constraint_type = 'PRIMARY KEY' {}",
            scope_filter("kcu.table_schema")
        ))
        .map_err(statement_error)?;
    let primary_keys: HashSet<(String, String, String)> = stmt
        .query_map(params(), |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
        .map_err(statement_error)?
        .collect::<duckdb::Result<_>>()
        .map_err(statement_error)?;

    let table_types = if features.views {
        "('BASE TABLE', 'VIEW')"
    } else {
        "('BASE TABLE')"
    };
    let mut stmt = conn
        .prepare(&format!(
            "SELECT c.table_schema, c.table_name, t.table_type, c.column_name, c.data_type \
             FROM information_schema.columns c \
             JOIN information_schema.tables t \
               ON t.table_schema = c.table_schema AND t.table_name = c.table_name \
             WHERE c.table_catalog = current_database() AND t.table_type IN {} {} \
             ORDER BY c.table_schema, c.table_name, c.ordinal_position",
            table_types,
            scope_filter("c.table_schema")
        ))
        .map_err(statement_error)?;
    let column_rows: Vec<(String, String, String, String, String)> = stmt
        .query_map(params(), |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
        })
        .map_err(statement_error)?
        .collect::<duckdb::Result<_>>()
        .map_err(statement_error)?;

    let mut last: Option<(String, String)> = None;
    for (schema_name, table_name, table_type, column_name, data_type) in column_rows {
        let Some(&idx) = by_name.get(&schema_name) else {
            continue;
        };
        let target = if table_type == "VIEW" {
            &mut schemas[idx].views
        } else {
            &mut schemas[idx].tables
        };
        let same = last
            .as_ref()
            .is_some_and(|(s, t)| *s == schema_name && *t == table_name);
        if !same {
            target.push(Table::new(table_name.clone(), Vec::new()));
        }
        let key = (schema_name.clone(), table_name.clone(), column_name.clone());
        if let Some(table) = target.last_mut() {
            table.columns.push(Column {
                name: column_name,
                data_type: DataType::from_declared(&data_type),
                is_primary_key: primary_keys.contains(&key),
            });
        }
        last = Some((schema_name, table_name));
    }

    if features.indexes {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT schema_name, index_name, table_name, is_unique, CAST(expressions AS VARCHAR) \
                 FROM duckdb_indexes() WHERE database_name = current_database() {} \
                 ORDER BY schema_name, index_name",
                scope_filter("schema_name")
            ))
            .map_err(statement_error)?;
        let rows: Vec<(String, String, String, bool, Option<String>)> = stmt
            .query_map(params(), |r| {
                Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?))
            })
            .map_err(statement_error)?
            .collect::<duckdb::Result<_>>()
            .map_err(statement_error)?;
        for (schema_name, name, table_name, is_unique, expressions) in rows {
            if let Some(&idx) = by_name.get(&schema_name) {
                schemas[idx].indexes.push(Index {
                    name,
                    table_name,
                    columns: parse_index_expressions(expressions.as_deref().unwrap_or("")),
                    is_unique,
                });
            }
        }
    }

    if features.sequences {
        let mut stmt = conn
            .prepare(&format!(
                "SELECT schema_name, sequence_name FROM duckdb_sequences() \
                 WHERE database_name = current_database() {} \
                 ORDER BY schema_name, sequence_name",
                scope_filter("schema_name")
            ))
            .map_err(statement_error)?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params(), |r| Ok((r.get(0)?, r.get(1)?)))
            .map_err(statement_error)?
            .collect::<duckdb::Result<_>>()
            .map_err(statement_error)?;
        for (schema_name, name) in rows {
            if let Some(&idx) = by_name.get(&schema_name) {
                schemas[idx].sequences.push(name);
            }
        }
    }

    Ok(SchemaTree { schemas })
}

/// `duckdb_indexes().expressions` renders as `[a, "b c"]`
fn parse_index_expressions(raw: &str) -> Vec<String> {
    raw.trim()
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split(',')
        .map(|part| part.trim().trim_matches('\'').trim_matches('"').to_string())
        .filter(|part| !part.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::provider::collect_rows;
    use std::collections::BTreeMap;

    fn memory_target() -> ConnectTarget {
        ConnectTarget {
            kind: BackendKind::Duckdb,
            endpoint: Endpoint::File {
                path: ":memory:".into(),
            },
            database: None,
            username: None,
            secret: None,
            options: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn executes_ddl_and_queries() {
        let conn = DuckdbAdapter.connect(&memory_target()).await.unwrap();
        collect_rows(conn.as_ref(), "CREATE TABLE t (id INTEGER PRIMARY KEY, name VARCHAR)")
            .await
            .unwrap();
        collect_rows(conn.as_ref(), "INSERT INTO t VALUES (1, 'a'), (2, 'b')")
            .await
            .unwrap();

        let (columns, rows) = collect_rows(conn.as_ref(), "SELECT id, name FROM t ORDER BY id")
            .await
            .unwrap();
        assert_eq!(columns[0].name, "id");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].values, vec![CellValue::Integer(2), CellValue::Text("b".into())]);
    }

    #[tokio::test]
    async fn parser_errors_are_syntax_errors() {
        let conn = DuckdbAdapter.connect(&memory_target()).await.unwrap();
        let err = collect_rows(conn.as_ref(), "SELECT FROM WHERE").await.unwrap_err();
        assert!(matches!(err, StatementError::Syntax(_)), "{err:?}");
    }

    #[tokio::test]
    async fn introspection_reads_catalog() {
        let conn = DuckdbAdapter.connect(&memory_target()).await.unwrap();
        collect_rows(conn.as_ref(), "CREATE TABLE orders (id INTEGER PRIMARY KEY, total DOUBLE)")
            .await
            .unwrap();
        collect_rows(conn.as_ref(), "CREATE SEQUENCE order_ids").await.unwrap();

        let tree = conn
            .introspect(IntrospectionFeatures::ALL, Some("main"))
            .await
            .unwrap();
        let main = tree.schema("main").unwrap();
        assert_eq!(main.tables[0].name, "orders");
        assert!(main.tables[0].columns[0].is_primary_key);
        assert_eq!(main.sequences, vec!["order_ids".to_string()]);
    }

    #[test]
    fn index_expressions() {
        assert_eq!(parse_index_expressions("[a, \"b\"]"), vec!["a", "b"]);
        assert!(parse_index_expressions("").is_empty());
    }
}
