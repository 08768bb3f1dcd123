//! ClickHouse adapter over the HTTP interface
//!
//! Each statement is one POST tagged with a fresh `query_id`, which is what
//! `KILL QUERY` targets on cancel. Row-returning statements are read as
//! `JSONCompactEachRowWithNamesAndTypes`, one JSON array per line, so rows
//! are forwarded while the response body is still arriving.

use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary};
use crate::db::schema::{Column, Schema, SchemaTree, Table};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConfigError, ConnectionError, ConnectionFailure, Result, StatementError, StatementResult,
    VizdbError,
};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const FORMAT: &str = "JSONCompactEachRowWithNamesAndTypes";

/// Statements that return a result set
const QUERY_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXISTS", "EXPLAIN",
];

pub struct ClickhouseAdapter {
    http: reqwest::Client,
}

impl ClickhouseAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for ClickhouseAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverAdapter for ClickhouseAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Clickhouse
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let (host, port) = target.endpoint.host_port().ok_or_else(|| {
            VizdbError::Config(ConfigError::Invalid("clickhouse needs a host and port".into()))
        })?;
        let secure = matches!(target.option("secure"), Some("true") | Some("1"))
            || matches!(target.option("ssl"), Some("true") | Some("1"));
        let scheme = if secure { "https" } else { "http" };

        let conn = ClickhouseConnection {
            http: self.http.clone(),
            url: format!("{}://{}:{}/", scheme, host, port),
            user: target.username.clone().unwrap_or_else(|| "default".into()),
            key: target
                .secret
                .as_ref()
                .map(|s| s.expose().to_string())
                .unwrap_or_default(),
            database: target.database.clone().unwrap_or_else(|| "default".into()),
            running: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        tracing::info!(url = %conn.url, database = %conn.database, "connecting to ClickHouse");

        let response = conn
            .post("SELECT 1", &uuid::Uuid::new_v4().to_string(), &[])
            .await
            .map_err(|e| {
                let kind = if e.is_connect() || e.is_timeout() {
                    ConnectionFailure::Unreachable
                } else {
                    ConnectionFailure::HandshakeFailed
                };
                ConnectionError::with_source(kind, e)
            })?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let (code, message) = parse_exception(&body);
            // AUTHENTICATION_FAILED, REQUIRED_PASSWORD, UNKNOWN_USER
            let kind = if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN
                || matches!(code, Some(516) | Some(194) | Some(192))
            {
                ConnectionFailure::AuthRejected
            } else {
                ConnectionFailure::HandshakeFailed
            };
            return Err(ConnectionError::new(kind, message).into());
        }
        Ok(Arc::new(conn))
    }
}

/// Split `Code: 62. DB::Exception: Syntax error ...` into code and message
fn parse_exception(body: &str) -> (Option<u32>, String) {
    let message = body.trim().to_string();
    let code = message
        .strip_prefix("Code: ")
        .and_then(|rest| rest.split(|c: char| !c.is_ascii_digit()).next())
        .and_then(|digits| digits.parse().ok());
    (code, message)
}

fn exception_error(body: &str) -> StatementError {
    let (code, message) = parse_exception(body);
    match code {
        Some(62) => StatementError::Syntax(message),
        // ACCESS_DENIED, READONLY, NOT_ENOUGH_PRIVILEGES
        Some(497) | Some(164) | Some(516) => StatementError::Permission(message),
        Some(159) => StatementError::Timeout(message),
        code => StatementError::Driver {
            message,
            code: code.map(|c| c.to_string()),
        },
    }
}

fn transport_error(e: reqwest::Error) -> StatementError {
    StatementError::ConnectivityLost(e.to_string())
}

struct ClickhouseConnection {
    http: reqwest::Client,
    url: String,
    user: String,
    key: String,
    database: String,
    /// `query_id` of the statement in flight
    running: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl ClickhouseConnection {
    async fn post(
        &self,
        sql: &str,
        query_id: &str,
        params: &[(&str, &str)],
    ) -> std::result::Result<reqwest::Response, reqwest::Error> {
        let mut query: Vec<(String, String)> = vec![
            ("query_id".into(), query_id.into()),
            ("output_format_json_quote_64bit_integers".into(), "0".into()),
        ];
        for (name, value) in params {
            query.push((format!("param_{}", name), value.to_string()));
        }
        self.http
            .post(&self.url)
            .header("X-ClickHouse-User", &self.user)
            .header("X-ClickHouse-Key", &self.key)
            .header("X-ClickHouse-Database", &self.database)
            .query(&query)
            .body(sql.to_string())
            .send()
            .await
    }

    fn ensure_open(&self) -> StatementResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StatementError::ConnectivityLost("connection is closed".into()));
        }
        Ok(())
    }

    /// Run a catalog query and collect every row
    async fn fetch_all(
        &self,
        sql: &str,
        params: &[(&str, &str)],
    ) -> StatementResult<Vec<Vec<Json>>> {
        let body = format!("{} FORMAT JSONCompactEachRow", sql);
        let response = self
            .post(&body, &uuid::Uuid::new_v4().to_string(), params)
            .await
            .map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(exception_error(&text));
        }
        text.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(|_| exception_error(line)))
            .collect()
    }
}

#[async_trait]
impl Connection for ClickhouseConnection {
    async fn execute(&self, mut req: ExecRequest) -> StatementResult<ExecSummary> {
        self.ensure_open()?;
        let sql = req.sql.trim().trim_end_matches(';').trim_end();
        let returns_rows = crate::sql::leading_keyword(sql)
            .is_some_and(|k| QUERY_KEYWORDS.contains(&k.as_str()));
        let body = if returns_rows {
            format!("{}\nFORMAT {}", sql, FORMAT)
        } else {
            sql.to_string()
        };

        let query_id = uuid::Uuid::new_v4().to_string();
        *self.running.lock() = Some(query_id.clone());
        let outcome = self.stream(&body, &query_id, returns_rows, &mut req).await;
        *self.running.lock() = None;
        outcome
    }

    async fn cancel(&self) -> StatementResult<()> {
        let running = self.running.lock().clone();
        let Some(query_id) = running else {
            return Ok(());
        };
        tracing::debug!(%query_id, "sending KILL QUERY");
        let kill = format!("KILL QUERY WHERE query_id = '{}' ASYNC", query_id);
        let response = self
            .post(&kill, &uuid::Uuid::new_v4().to_string(), &[])
            .await
            .map_err(|e| StatementError::driver(format!("Cancel failed: {}", e)))?;
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StatementError::driver(format!("Cancel failed: {}", body.trim())));
        }
        Ok(())
    }

    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        self.ensure_open()?;
        let (filter, params): (&str, Vec<(&str, &str)>) = match schema {
            Some(s) => ("= {schema:String}", vec![("schema", s)]),
            None => (
                "NOT IN ('system', 'INFORMATION_SCHEMA', 'information_schema')",
                vec![],
            ),
        };

        let databases = self
            .fetch_all(
                &format!(
                    "SELECT name FROM system.databases WHERE name {} ORDER BY name",
                    filter
                ),
                &params,
            )
            .await?;
        let mut schemas: Vec<Schema> = databases
            .iter()
            .filter_map(|row| row.first().and_then(Json::as_str))
            .map(Schema::named)
            .collect();
        let by_name: HashMap<String, usize> = schemas
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.clone(), i))
            .collect();

        let engines = self
            .fetch_all(
                &format!(
                    "SELECT database, name, engine FROM system.tables \
                     WHERE database {} AND NOT is_temporary ORDER BY database, name",
                    filter
                ),
                &params,
            )
            .await?;
        let mut tables: HashMap<(String, String), Table> = HashMap::new();
        let mut order: Vec<(String, String, bool)> = Vec::new();
        for row in &engines {
            let [db, name, engine] = [0, 1, 2].map(|i| json_str(row, i));
            let is_view = engine.ends_with("View");
            if is_view && !features.views {
                continue;
            }
            order.push((db.clone(), name.clone(), is_view));
            tables.insert((db, name.clone()), Table::new(name, Vec::new()));
        }

        let columns = self
            .fetch_all(
                &format!(
                    "SELECT database, table, name, type, is_in_primary_key FROM system.columns \
                     WHERE database {} ORDER BY database, table, position",
                    filter
                ),
                &params,
            )
            .await?;
        for row in &columns {
            let key = (json_str(row, 0), json_str(row, 1));
            if let Some(table) = tables.get_mut(&key) {
                table.columns.push(Column {
                    name: json_str(row, 2),
                    data_type: DataType::from_declared(&json_str(row, 3)),
                    is_primary_key: row.get(4).and_then(Json::as_u64).unwrap_or(0) != 0,
                });
            }
        }

        for (db, name, is_view) in order {
            let (Some(&idx), Some(table)) = (by_name.get(&db), tables.remove(&(db, name))) else {
                continue;
            };
            if is_view {
                schemas[idx].views.push(table);
            } else {
                schemas[idx].tables.push(table);
            }
        }
        Ok(SchemaTree { schemas })
    }

    async fn ping(&self) -> StatementResult<()> {
        self.ensure_open()?;
        self.fetch_all("SELECT 1", &[]).await.map(|_| ())
    }

    async fn close(&self) {
        // Stateless over HTTP; pooled sockets go when the client is dropped
        self.closed.store(true, Ordering::SeqCst);
    }
}

impl ClickhouseConnection {
    async fn stream(
        &self,
        body: &str,
        query_id: &str,
        returns_rows: bool,
        req: &mut ExecRequest,
    ) -> StatementResult<ExecSummary> {
        let response = self
            .post(body, query_id, &[])
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.map_err(transport_error)?;
            return Err(exception_error(&text));
        }

        if !returns_rows {
            let written = response
                .headers()
                .get("X-ClickHouse-Summary")
                .and_then(|v| v.to_str().ok())
                .and_then(written_rows);
            return Ok(req.sink.summary(written));
        }

        let mut names: Option<Vec<String>> = None;
        let mut types: Vec<DataType> = Vec::new();
        let mut pending: Vec<u8> = Vec::new();
        let mut body = response.bytes_stream();

        'read: loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = req.cancel.cancelled() => break 'read,
            };
            let Some(chunk) = chunk else { break };
            pending.extend_from_slice(&chunk.map_err(transport_error)?);

            while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&line);
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                // Errors raised mid-stream arrive as plain text
                let Ok(Json::Array(values)) = serde_json::from_str::<Json>(line) else {
                    return Err(exception_error(line));
                };
                match &names {
                    None => {
                        names = Some(values.iter().map(|v| json_text(v)).collect());
                    }
                    Some(cols) if types.is_empty() && !cols.is_empty() => {
                        types = values
                            .iter()
                            .map(|v| DataType::from_declared(&json_text(v)))
                            .collect();
                        let columns = cols
                            .iter()
                            .zip(&types)
                            .map(|(name, ty)| ColumnDef::new(name.clone(), ty.clone()))
                            .collect();
                        if req.sink.columns(columns).await.is_break() {
                            break 'read;
                        }
                    }
                    Some(_) => {
                        let cells = values
                            .into_iter()
                            .zip(&types)
                            .map(|(v, ty)| json_to_cell(v, ty))
                            .collect();
                        if req.sink.push(Row::new(cells)).await.is_break() {
                            break 'read;
                        }
                    }
                }
            }
        }
        let _ = req.sink.flush().await;
        Ok(req.sink.summary(None))
    }
}

/// `written_rows` from the `X-ClickHouse-Summary` header
fn written_rows(summary: &str) -> Option<u64> {
    let parsed: Json = serde_json::from_str(summary).ok()?;
    match parsed.get("written_rows")? {
        Json::String(s) => s.parse().ok(),
        Json::Number(n) => n.as_u64(),
        _ => None,
    }
}

fn json_text(value: &Json) -> String {
    match value {
        Json::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn json_str(row: &[Json], idx: usize) -> String {
    row.get(idx).map(json_text).unwrap_or_default()
}

fn json_to_cell(value: Json, data_type: &DataType) -> CellValue {
    match (value, data_type) {
        (Json::Null, _) => CellValue::Null,
        (Json::Bool(b), _) => CellValue::Boolean(b),
        (Json::Number(n), _) => match n.as_i64() {
            Some(i) => CellValue::Integer(i),
            None => n
                .as_f64()
                .map(CellValue::Float)
                .unwrap_or_else(|| CellValue::Text(n.to_string())),
        },
        (Json::String(s), DataType::SmallInt | DataType::Integer | DataType::BigInt) => s
            .parse()
            .map(CellValue::Integer)
            .unwrap_or(CellValue::Text(s)),
        (
            Json::String(s),
            DataType::Date | DataType::Time | DataType::Timestamp | DataType::TimestampTz,
        ) => CellValue::DateTime(s),
        (Json::String(s), DataType::Uuid) => CellValue::Uuid(s),
        (Json::String(s), _) => CellValue::Text(s),
        (Json::Array(items), DataType::Array(inner)) => CellValue::Array(
            items
                .into_iter()
                .map(|item| json_to_cell(item, inner))
                .collect(),
        ),
        (other, _) => CellValue::Json(other),
    }
}
