//! MySQL and MariaDB adapter
//!
//! One `mysql_async::Conn` per connection; rows are read with `query_iter` so
//! they are forwarded to the sink as the server sends them. Cancellation
//! issues `KILL QUERY <id>` from a second short-lived connection.

use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary};
use crate::db::schema::{Column, Index, Procedure, Schema, SchemaTree, Table, Trigger};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConfigError, ConnectionError, ConnectionFailure, Result, StatementError, StatementResult,
    VizdbError,
};
use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Schemas that are never shown
const SYSTEM_SCHEMAS: &str = "'information_schema', 'mysql', 'performance_schema', 'sys'";

/// Character set id MySQL reports for binary columns
const BINARY_CHARSET: u16 = 63;

pub struct MysqlAdapter {
    kind: BackendKind,
}

impl MysqlAdapter {
    pub fn new(kind: BackendKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl DriverAdapter for MysqlAdapter {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let (host, port) = target.endpoint.host_port().ok_or_else(|| {
            VizdbError::Config(ConfigError::Invalid(format!(
                "{} needs a host and port",
                self.kind
            )))
        })?;
        tracing::info!(kind = %self.kind, host, port, database = ?target.database, "connecting");

        let opts: Opts = OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port)
            .db_name(target.database.clone())
            .user(target.username.clone())
            .pass(target.secret.as_ref().map(|s| s.expose().to_string()))
            .into();

        let conn = Conn::new(opts.clone()).await.map_err(connect_error)?;
        let connection_id = conn.id();
        tracing::debug!(connection_id, "MySQL connection established");

        Ok(Arc::new(MysqlConnection {
            opts,
            connection_id,
            conn: Mutex::new(Some(conn)),
        }))
    }
}

fn connect_error(e: mysql_async::Error) -> VizdbError {
    let kind = match &e {
        // ER_ACCESS_DENIED_ERROR, ER_DBACCESS_DENIED_ERROR
        mysql_async::Error::Server(server) if server.code == 1045 || server.code == 1044 => {
            ConnectionFailure::AuthRejected
        }
        mysql_async::Error::Io(_) => ConnectionFailure::Unreachable,
        _ => ConnectionFailure::HandshakeFailed,
    };
    ConnectionError::with_source(kind, e).into()
}

fn statement_error(e: mysql_async::Error) -> StatementError {
    match e {
        mysql_async::Error::Server(server) => match server.code {
            1064 => StatementError::Syntax(server.message),
            1044 | 1142 | 1143 | 1227 | 1370 => StatementError::Permission(server.message),
            // ER_SERVER_SHUTDOWN, ER_CONNECTION_KILLED
            1053 | 1927 => StatementError::ConnectivityLost(server.message),
            code => StatementError::Driver {
                message: server.message,
                code: Some(code.to_string()),
            },
        },
        mysql_async::Error::Io(io) => StatementError::ConnectivityLost(io.to_string()),
        mysql_async::Error::Driver(driver) => {
            let message = driver.to_string();
            if matches!(driver, mysql_async::DriverError::ConnectionClosed) {
                StatementError::ConnectivityLost(message)
            } else {
                StatementError::driver(message)
            }
        }
        other => StatementError::driver(other.to_string()),
    }
}

struct MysqlConnection {
    opts: Opts,
    connection_id: u32,
    conn: Mutex<Option<Conn>>,
}

fn closed() -> StatementError {
    StatementError::ConnectivityLost("connection is closed".into())
}

/// Run a catalog query, binding the schema filter when one is given
async fn fetch<T>(conn: &mut Conn, sql: String, scope: Option<&str>) -> StatementResult<Vec<T>>
where
    T: FromRow + Send + 'static,
{
    let rows = match scope {
        Some(schema) => conn.exec(sql, (schema.to_string(),)).await,
        None => conn.query(sql).await,
    };
    rows.map_err(statement_error)
}

#[async_trait]
impl Connection for MysqlConnection {
    async fn execute(&self, mut req: ExecRequest) -> StatementResult<ExecSummary> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;

        let mut result = conn
            .query_iter(req.sql.as_str())
            .await
            .map_err(statement_error)?;

        let columns: Vec<ColumnDef> = result
            .columns()
            .map(|cols| {
                cols.iter()
                    .map(|c| {
                        let data_type = mysql_type_to_datatype(c.column_type(), c.character_set());
                        ColumnDef::new(c.name_str(), data_type)
                    })
                    .collect()
            })
            .unwrap_or_default();

        if columns.is_empty() {
            let affected = result.affected_rows();
            result.drop_result().await.map_err(statement_error)?;
            return Ok(req.sink.summary(Some(affected)));
        }

        let mut stopped = req.sink.columns(columns.clone()).await.is_break();

        while !stopped {
            let Some(mut mysql_row) = result.next().await.map_err(statement_error)? else {
                break;
            };
            let values = columns
                .iter()
                .enumerate()
                .map(|(idx, col)| {
                    let value = mysql_row
                        .take::<mysql_async::Value, _>(idx)
                        .unwrap_or(mysql_async::Value::NULL);
                    mysql_value_to_cell(value, &col.data_type)
                })
                .collect();
            stopped = req.sink.push(Row::new(values)).await.is_break();
        }

        // Leaves the connection ready for the next statement
        result.drop_result().await.map_err(statement_error)?;
        let _ = req.sink.flush().await;
        Ok(req.sink.summary(None))
    }

    async fn cancel(&self) -> StatementResult<()> {
        tracing::debug!(connection_id = self.connection_id, "sending KILL QUERY");
        let mut killer = Conn::new(self.opts.clone())
            .await
            .map_err(|e| StatementError::driver(format!("Cancel failed: {}", e)))?;
        let outcome = killer
            .query_drop(format!("KILL QUERY {}", self.connection_id))
            .await
            .map_err(|e| StatementError::driver(format!("Cancel failed: {}", e)));
        if let Err(e) = killer.disconnect().await {
            tracing::debug!(error = %e, "failed to close cancel connection");
        }
        outcome
    }

    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        let filter = |col: &str| match schema {
            Some(_) => format!("{} = ?", col),
            None => format!("{} NOT IN ({})", col, SYSTEM_SCHEMAS),
        };

        let schema_names: Vec<String> = fetch(
            conn,
            format!(
                "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA WHERE {} ORDER BY SCHEMA_NAME",
                filter("SCHEMA_NAME")
            ),
            schema,
        )
        .await?;

        let rel_types = if features.views {
            "('BASE TABLE', 'VIEW', 'SYSTEM VIEW')"
        } else {
            "('BASE TABLE')"
        };
        let column_rows: Vec<(String, String, String, String, String, String)> = fetch(
            conn,
            format!(
                "SELECT c.TABLE_SCHEMA, c.TABLE_NAME, t.TABLE_TYPE, c.COLUMN_NAME, \
                        c.COLUMN_TYPE, c.COLUMN_KEY \
                 FROM information_schema.COLUMNS c \
                 JOIN information_schema.TABLES t \
                   ON t.TABLE_SCHEMA = c.TABLE_SCHEMA AND t.TABLE_NAME = c.TABLE_NAME \
                 WHERE {} AND t.TABLE_TYPE IN {} \
                 ORDER BY c.TABLE_SCHEMA, c.TABLE_NAME, c.ORDINAL_POSITION",
                filter("c.TABLE_SCHEMA"),
                rel_types
            ),
            schema,
        )
        .await?;

        let mut schemas: Vec<Schema> = schema_names.into_iter().map(Schema::named).collect();
        let mut by_name: HashMap<String, usize> = schemas
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();
        let mut slot = |name: &str, schemas: &mut Vec<Schema>| -> usize {
            *by_name.entry(name.to_string()).or_insert_with(|| {
                schemas.push(Schema::named(name));
                schemas.len() - 1
            })
        };

        let mut last: Option<(String, String)> = None;
        for (schema_name, table_name, table_type, col_name, col_type, col_key) in column_rows {
            let idx = slot(&schema_name, &mut schemas);
            let is_view = table_type.ends_with("VIEW");
            let same = last
                .as_ref()
                .is_some_and(|(s, t)| *s == schema_name && *t == table_name);
            let target = if is_view {
                &mut schemas[idx].views
            } else {
                &mut schemas[idx].tables
            };
            if !same {
                target.push(Table::new(table_name.clone(), Vec::new()));
            }
            if let Some(table) = target.last_mut() {
                table.columns.push(Column {
                    name: col_name,
                    data_type: DataType::from_declared(&col_type),
                    is_primary_key: col_key == "PRI",
                });
            }
            last = Some((schema_name, table_name));
        }

        if features.indexes {
            let rows: Vec<(String, String, String, i64, String)> = fetch(
                conn,
                format!(
                    "SELECT TABLE_SCHEMA, TABLE_NAME, INDEX_NAME, NON_UNIQUE, COLUMN_NAME \
                     FROM information_schema.STATISTICS WHERE {} \
                     ORDER BY TABLE_SCHEMA, TABLE_NAME, INDEX_NAME, SEQ_IN_INDEX",
                    filter("TABLE_SCHEMA")
                ),
                schema,
            )
            .await?;
            for (schema_name, table_name, index_name, non_unique, column) in rows {
                let idx = slot(&schema_name, &mut schemas);
                let indexes = &mut schemas[idx].indexes;
                match indexes.last_mut() {
                    Some(ix) if ix.name == index_name && ix.table_name == table_name => {
                        ix.columns.push(column)
                    }
                    _ => indexes.push(Index {
                        name: index_name,
                        table_name,
                        columns: vec![column],
                        is_unique: non_unique == 0,
                    }),
                }
            }
        }

        if features.procedures {
            let rows: Vec<(String, String, Option<String>)> = fetch(
                conn,
                format!(
                    "SELECT r.ROUTINE_SCHEMA, r.ROUTINE_NAME, \
                            GROUP_CONCAT(CONCAT(p.PARAMETER_NAME, ' ', p.DTD_IDENTIFIER) \
                                         ORDER BY p.ORDINAL_POSITION SEPARATOR ', ') \
                     FROM information_schema.ROUTINES r \
                     LEFT JOIN information_schema.PARAMETERS p \
                       ON p.SPECIFIC_SCHEMA = r.ROUTINE_SCHEMA \
                      AND p.SPECIFIC_NAME = r.SPECIFIC_NAME \
                      AND p.ORDINAL_POSITION > 0 \
                     WHERE {} \
                     GROUP BY r.ROUTINE_SCHEMA, r.ROUTINE_NAME \
                     ORDER BY r.ROUTINE_SCHEMA, r.ROUTINE_NAME",
                    filter("r.ROUTINE_SCHEMA")
                ),
                schema,
            )
            .await?;
            for (schema_name, name, args) in rows {
                let idx = slot(&schema_name, &mut schemas);
                schemas[idx].procedures.push(Procedure {
                    name,
                    args: args.unwrap_or_default(),
                });
            }
        }

        if features.sequences {
            // MariaDB lists sequences as tables of type SEQUENCE
            let rows: Vec<(String, String)> = fetch(
                conn,
                format!(
                    "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES \
                     WHERE {} AND TABLE_TYPE = 'SEQUENCE' ORDER BY TABLE_SCHEMA, TABLE_NAME",
                    filter("TABLE_SCHEMA")
                ),
                schema,
            )
            .await?;
            for (schema_name, name) in rows {
                let idx = slot(&schema_name, &mut schemas);
                schemas[idx].sequences.push(name);
            }
        }

        if features.triggers {
            let rows: Vec<(String, String, String)> = fetch(
                conn,
                format!(
                    "SELECT TRIGGER_SCHEMA, TRIGGER_NAME, EVENT_OBJECT_TABLE \
                     FROM information_schema.TRIGGERS WHERE {} \
                     ORDER BY TRIGGER_SCHEMA, TRIGGER_NAME",
                    filter("TRIGGER_SCHEMA")
                ),
                schema,
            )
            .await?;
            for (schema_name, name, table_name) in rows {
                let idx = slot(&schema_name, &mut schemas);
                schemas[idx].triggers.push(Trigger { name, table_name });
            }
        }

        Ok(SchemaTree { schemas })
    }

    async fn ping(&self) -> StatementResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = guard.as_mut().ok_or_else(closed)?;
        conn.ping().await.map_err(statement_error)
    }

    async fn close(&self) {
        if let Some(conn) = self.conn.lock().await.take()
            && let Err(e) = conn.disconnect().await
        {
            tracing::debug!(error = %e, "MySQL disconnect failed");
        }
    }
}

fn mysql_type_to_datatype(column_type: ColumnType, charset: u16) -> DataType {
    use ColumnType::*;
    match column_type {
        MYSQL_TYPE_TINY | MYSQL_TYPE_SHORT => DataType::SmallInt,
        MYSQL_TYPE_INT24 | MYSQL_TYPE_LONG | MYSQL_TYPE_YEAR => DataType::Integer,
        MYSQL_TYPE_LONGLONG => DataType::BigInt,
        MYSQL_TYPE_FLOAT => DataType::Real,
        MYSQL_TYPE_DOUBLE => DataType::Double,
        MYSQL_TYPE_DECIMAL | MYSQL_TYPE_NEWDECIMAL => DataType::Numeric,
        MYSQL_TYPE_DATE | MYSQL_TYPE_NEWDATE => DataType::Date,
        MYSQL_TYPE_TIME | MYSQL_TYPE_TIME2 => DataType::Time,
        MYSQL_TYPE_DATETIME | MYSQL_TYPE_DATETIME2 | MYSQL_TYPE_TIMESTAMP
        | MYSQL_TYPE_TIMESTAMP2 => DataType::Timestamp,
        MYSQL_TYPE_JSON => DataType::Json,
        MYSQL_TYPE_BIT => DataType::Bytea,
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING | MYSQL_TYPE_STRING
            if charset == BINARY_CHARSET =>
        {
            DataType::Bytea
        }
        MYSQL_TYPE_VARCHAR | MYSQL_TYPE_VAR_STRING => DataType::Varchar(None),
        MYSQL_TYPE_STRING => DataType::Char(None),
        MYSQL_TYPE_TINY_BLOB | MYSQL_TYPE_MEDIUM_BLOB | MYSQL_TYPE_LONG_BLOB | MYSQL_TYPE_BLOB
        | MYSQL_TYPE_ENUM | MYSQL_TYPE_SET => DataType::Text,
        other => DataType::Unknown(format!("{:?}", other)),
    }
}

/// Convert a wire value. The text protocol sends most values as bytes, so
/// the column's type decides how they are parsed.
fn mysql_value_to_cell(value: mysql_async::Value, data_type: &DataType) -> CellValue {
    use mysql_async::Value;
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Integer(i),
        Value::UInt(u) => i64::try_from(u)
            .map(CellValue::Integer)
            .unwrap_or_else(|_| CellValue::Text(u.to_string())),
        Value::Float(f) => CellValue::Float(f.into()),
        Value::Double(d) => CellValue::Float(d),
        Value::Date(year, month, day, hour, min, sec, micro) => {
            if *data_type == DataType::Date {
                CellValue::DateTime(format!("{:04}-{:02}-{:02}", year, month, day))
            } else {
                CellValue::DateTime(format!(
                    "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:06}",
                    year, month, day, hour, min, sec, micro
                ))
            }
        }
        Value::Time(negative, days, hours, mins, secs, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = u32::from(hours) + days * 24;
            CellValue::DateTime(format!(
                "{}{:02}:{:02}:{:02}.{:06}",
                sign, hours, mins, secs, micros
            ))
        }
        Value::Bytes(bytes) => bytes_to_cell(bytes, data_type),
    }
}

fn bytes_to_cell(bytes: Vec<u8>, data_type: &DataType) -> CellValue {
    if *data_type == DataType::Bytea {
        return CellValue::Binary(bytes);
    }
    let text = match String::from_utf8(bytes) {
        Ok(text) => text,
        Err(e) => return CellValue::Binary(e.into_bytes()),
    };
    match data_type {
        DataType::SmallInt | DataType::Integer | DataType::BigInt => text
            .parse()
            .map(CellValue::Integer)
            .unwrap_or(CellValue::Text(text)),
        DataType::Real | DataType::Double => text
            .parse()
            .map(CellValue::Float)
            .unwrap_or(CellValue::Text(text)),
        DataType::Json => serde_json::from_str(&text)
            .map(CellValue::Json)
            .unwrap_or(CellValue::Text(text)),
        DataType::Date | DataType::Time | DataType::Timestamp => CellValue::DateTime(text),
        _ => CellValue::Text(text),
    }
}
