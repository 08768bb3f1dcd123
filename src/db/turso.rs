//! Turso / libsql adapter over the hrana HTTP pipeline
//!
//! Statements go to `POST {base}/v2/pipeline`. The server hands back a baton
//! with every response; sending it with the next request keeps the same
//! server-side stream so transactions span statements.

use crate::config::Endpoint;
use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::provider::{
    ConnectTarget, Connection, DriverAdapter, ExecRequest, ExecSummary, collect_rows,
};
use crate::db::schema::{Column, Index, Schema, SchemaTree, Table, Trigger};
use crate::db::types::{CellValue, ColumnDef, DataType, Row};
use crate::error::{
    ConfigError, ConnectionError, ConnectionFailure, Result, StatementError, StatementResult,
    VizdbError,
};
use async_trait::async_trait;
use base64::Engine;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct TursoAdapter {
    http: reqwest::Client,
}

impl TursoAdapter {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
        }
    }
}

impl Default for TursoAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// `libsql://` becomes `https://`; bare hosts get https unless they are local
fn base_url(raw: &str) -> String {
    let raw = raw.trim().trim_end_matches('/');
    if let Some(rest) = raw.strip_prefix("libsql://") {
        return format!("https://{}", rest);
    }
    if raw.starts_with("http://") || raw.starts_with("https://") {
        return raw.to_string();
    }
    let local = raw.starts_with("localhost") || raw.starts_with("127.0.0.1");
    format!("{}://{}", if local { "http" } else { "https" }, raw)
}

#[async_trait]
impl DriverAdapter for TursoAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Turso
    }

    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        let url = match &target.endpoint {
            Endpoint::Url { url } => base_url(url),
            Endpoint::Tcp { host, port } => base_url(&format!("{}:{}", host, port)),
            Endpoint::File { .. } => {
                return Err(VizdbError::Config(ConfigError::Invalid(
                    "turso needs a database URL".into(),
                )));
            }
        };
        let conn = TursoConnection {
            http: self.http.clone(),
            pipeline: format!("{}/v2/pipeline", url),
            token: target.secret.as_ref().map(|s| s.expose().to_string()),
            baton: Mutex::new(None),
            closed: AtomicBool::new(false),
        };
        tracing::info!(%url, "connecting to Turso");

        match conn.run(vec![PipelineRequest::execute("SELECT 1")]).await {
            Ok(_) => Ok(Arc::new(conn)),
            Err(HranaError::Http(status, body)) => {
                let kind = if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    ConnectionFailure::AuthRejected
                } else {
                    ConnectionFailure::HandshakeFailed
                };
                Err(ConnectionError::new(kind, format!("{}: {}", status, body.trim())).into())
            }
            Err(HranaError::Transport(e)) => {
                let kind = if e.is_connect() || e.is_timeout() {
                    ConnectionFailure::Unreachable
                } else {
                    ConnectionFailure::HandshakeFailed
                };
                Err(ConnectionError::with_source(kind, e).into())
            }
            Err(HranaError::Statement(e)) => {
                Err(ConnectionError::new(ConnectionFailure::HandshakeFailed, e.to_string()).into())
            }
        }
    }
}

// Wire types for the hrana pipeline

#[derive(Debug, Serialize)]
struct PipelineBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    baton: Option<String>,
    requests: Vec<PipelineRequest>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum PipelineRequest {
    Execute { stmt: Stmt },
    Close,
}

impl PipelineRequest {
    fn execute(sql: &str) -> Self {
        Self::Execute {
            stmt: Stmt {
                sql: sql.to_string(),
                args: Vec::new(),
            },
        }
    }

    fn execute_with(sql: &str, args: &[&str]) -> Self {
        Self::Execute {
            stmt: Stmt {
                sql: sql.to_string(),
                args: args
                    .iter()
                    .map(|a| HranaValue::Text {
                        value: a.to_string(),
                    })
                    .collect(),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct Stmt {
    sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<HranaValue>,
}

#[derive(Debug, Deserialize)]
struct PipelineResponse {
    baton: Option<String>,
    results: Vec<StreamResult>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamResult {
    Ok { response: StreamResponse },
    Error { error: HranaStatementError },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum StreamResponse {
    Execute { result: StmtResult },
    Close,
}

#[derive(Debug, Deserialize)]
struct HranaStatementError {
    message: String,
    code: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StmtResult {
    #[serde(default)]
    cols: Vec<Col>,
    #[serde(default)]
    rows: Vec<Vec<HranaValue>>,
    #[serde(default)]
    affected_row_count: u64,
}

#[derive(Debug, Deserialize)]
struct Col {
    name: Option<String>,
    decltype: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum HranaValue {
    Null,
    /// Integers travel as strings to keep 64-bit precision
    Integer { value: String },
    Float { value: f64 },
    Text { value: String },
    Blob { base64: String },
}

impl HranaValue {
    fn into_cell(self) -> CellValue {
        match self {
            HranaValue::Null => CellValue::Null,
            HranaValue::Integer { value } => value
                .parse()
                .map(CellValue::Integer)
                .unwrap_or(CellValue::Text(value)),
            HranaValue::Float { value } => CellValue::Float(value),
            HranaValue::Text { value } => CellValue::Text(value),
            HranaValue::Blob { base64: encoded } => base64::engine::general_purpose::STANDARD_NO_PAD
                .decode(encoded.trim_end_matches('='))
                .map(CellValue::Binary)
                .unwrap_or(CellValue::Text(encoded)),
        }
    }
}

enum HranaError {
    Transport(reqwest::Error),
    Http(reqwest::StatusCode, String),
    Statement(StatementError),
}

impl From<HranaError> for StatementError {
    fn from(e: HranaError) -> Self {
        match e {
            HranaError::Transport(e) => StatementError::ConnectivityLost(e.to_string()),
            HranaError::Http(status, body) => {
                if status == reqwest::StatusCode::UNAUTHORIZED
                    || status == reqwest::StatusCode::FORBIDDEN
                {
                    StatementError::Permission(body)
                } else {
                    StatementError::Driver {
                        message: format!("{}: {}", status, body.trim()),
                        code: Some(status.as_u16().to_string()),
                    }
                }
            }
            HranaError::Statement(e) => e,
        }
    }
}

fn statement_error(error: HranaStatementError) -> StatementError {
    let code = error.code.unwrap_or_default();
    if code.starts_with("SQLITE_AUTH") || code.starts_with("SQLITE_PERM") {
        return StatementError::Permission(error.message);
    }
    if error.message.contains("syntax error") {
        return StatementError::Syntax(error.message);
    }
    StatementError::Driver {
        message: error.message,
        code: (!code.is_empty()).then_some(code),
    }
}

struct TursoConnection {
    http: reqwest::Client,
    pipeline: String,
    token: Option<String>,
    baton: Mutex<Option<String>>,
    closed: AtomicBool,
}

impl TursoConnection {
    /// Send one pipeline and return each execute result in order
    async fn run(
        &self,
        requests: Vec<PipelineRequest>,
    ) -> std::result::Result<Vec<StmtResult>, HranaError> {
        let body = PipelineBody {
            baton: self.baton.lock().clone(),
            requests,
        };
        let mut request = self.http.post(&self.pipeline).json(&body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(HranaError::Transport)?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            // The stream behind the baton is gone
            *self.baton.lock() = None;
            return Err(HranaError::Http(status, text));
        }
        let parsed: PipelineResponse = response.json().await.map_err(HranaError::Transport)?;
        *self.baton.lock() = parsed.baton;

        let mut results = Vec::new();
        for result in parsed.results {
            match result {
                StreamResult::Ok {
                    response: StreamResponse::Execute { result },
                } => results.push(result),
                StreamResult::Ok {
                    response: StreamResponse::Close,
                } => {}
                StreamResult::Error { error } => {
                    return Err(HranaError::Statement(statement_error(error)));
                }
            }
        }
        Ok(results)
    }

    async fn query(&self, sql: &str, args: &[&str]) -> StatementResult<Vec<Vec<CellValue>>> {
        let results = self.run(vec![PipelineRequest::execute_with(sql, args)]).await?;
        Ok(results
            .into_iter()
            .next()
            .unwrap_or_default()
            .rows
            .into_iter()
            .map(|row| row.into_iter().map(HranaValue::into_cell).collect())
            .collect())
    }

    fn ensure_open(&self) -> StatementResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StatementError::ConnectivityLost("connection is closed".into()));
        }
        Ok(())
    }
}

fn text(cells: &[CellValue], idx: usize) -> String {
    match cells.get(idx) {
        Some(CellValue::Text(s)) => s.clone(),
        Some(CellValue::Null) | None => String::new(),
        Some(other) => other.export_string(),
    }
}

#[async_trait]
impl Connection for TursoConnection {
    async fn execute(&self, mut req: ExecRequest) -> StatementResult<ExecSummary> {
        self.ensure_open()?;
        let call = self.run(vec![PipelineRequest::execute(&req.sql)]);
        let results = tokio::select! {
            results = call => results?,
            // Nothing to signal server-side; the response is dropped
            _ = req.cancel.cancelled() => return Ok(req.sink.summary(None)),
        };
        let result = results.into_iter().next().unwrap_or_default();
        if result.cols.is_empty() {
            return Ok(req.sink.summary(Some(result.affected_row_count)));
        }

        let columns = result
            .cols
            .iter()
            .enumerate()
            .map(|(i, col)| {
                let data_type = col
                    .decltype
                    .as_deref()
                    .map(DataType::from_declared)
                    .unwrap_or_else(|| DataType::Unknown("dynamic".into()));
                let name = col.name.clone().unwrap_or_else(|| format!("column{}", i + 1));
                ColumnDef::new(name, data_type)
            })
            .collect();
        if req.sink.columns(columns).await.is_continue() {
            for row in result.rows {
                let cells = row.into_iter().map(HranaValue::into_cell).collect();
                if req.sink.push(Row::new(cells)).await.is_break() {
                    break;
                }
            }
            let _ = req.sink.flush().await;
        }
        Ok(req.sink.summary(None))
    }

    async fn cancel(&self) -> StatementResult<()> {
        Ok(())
    }

    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        self.ensure_open()?;
        if schema.is_some_and(|s| s != "main") {
            return Ok(SchemaTree::default());
        }
        let mut main = Schema::named("main");

        let objects = self
            .query(
                "SELECT type, name, tbl_name FROM sqlite_master \
                 WHERE name NOT LIKE 'sqlite_%' AND name NOT LIKE '_litestream_%' \
                 ORDER BY type, name",
                &[],
            )
            .await?;
        for object in &objects {
            let (kind, name, table_name) = (text(object, 0), text(object, 1), text(object, 2));
            match kind.as_str() {
                "table" | "view" => {
                    if kind == "view" && !features.views {
                        continue;
                    }
                    let info = self
                        .query("SELECT name, type, pk FROM pragma_table_info(?)", &[&name])
                        .await?;
                    let columns = info
                        .iter()
                        .map(|c| Column {
                            name: text(c, 0),
                            data_type: DataType::from_declared(&text(c, 1)),
                            is_primary_key: matches!(c.get(2), Some(CellValue::Integer(pk)) if *pk > 0),
                        })
                        .collect();
                    let table = Table::new(name, columns);
                    if kind == "view" {
                        main.views.push(table);
                    } else {
                        main.tables.push(table);
                    }
                }
                "index" if features.indexes => {
                    let unique = self
                        .query(
                            "SELECT \"unique\" FROM pragma_index_list(?) WHERE name = ?",
                            &[&table_name, &name],
                        )
                        .await?;
                    let columns = self
                        .query("SELECT name FROM pragma_index_info(?)", &[&name])
                        .await?;
                    main.indexes.push(Index {
                        is_unique: matches!(
                            unique.first().and_then(|r| r.first()),
                            Some(CellValue::Integer(1))
                        ),
                        columns: columns.iter().map(|c| text(c, 0)).collect(),
                        name,
                        table_name,
                    });
                }
                "trigger" if features.triggers => main.triggers.push(Trigger { name, table_name }),
                _ => {}
            }
        }
        Ok(SchemaTree {
            schemas: vec![main],
        })
    }

    async fn ping(&self) -> StatementResult<()> {
        self.ensure_open()?;
        collect_rows(self, "SELECT 1").await.map(|_| ())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let has_stream = self.baton.lock().is_some();
        if has_stream {
            // Release the server-side stream; failure only leaks it until expiry
            if let Err(e) = self.run(vec![PipelineRequest::Close]).await {
                tracing::debug!(error = %StatementError::from(e), "closing hrana stream failed");
            }
        }
    }
}
