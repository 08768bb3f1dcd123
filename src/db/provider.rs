//! Driver adapter traits
//!
//! Defines the interface that all database backends must implement.
//! An adapter turns a resolved target into a live `Connection`; the
//! connection executes statements by streaming rows into a bounded sink.

use crate::config::connections::Endpoint;
use crate::credentials::Secret;
use crate::db::capability::{BackendKind, IntrospectionFeatures};
use crate::db::schema::SchemaTree;
use crate::db::types::{ColumnDef, Row};
use crate::error::{Result, StatementResult, VizdbError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::ops::ControlFlow;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Everything an adapter needs to open a physical connection
///
/// The endpoint has already been rewritten to the local tunnel port when a
/// tunnel is in front of the backend.
#[derive(Debug, Clone)]
pub struct ConnectTarget {
    pub kind: BackendKind,
    pub endpoint: Endpoint,
    pub database: Option<String>,
    pub username: Option<String>,
    pub secret: Option<Secret>,
    pub options: BTreeMap<String, String>,
}

impl ConnectTarget {
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

/// Items delivered on a statement's row stream
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Column metadata; sent once, before any batch
    Columns(Vec<ColumnDef>),
    Batch(Vec<Row>),
}

/// One statement handed to a connection
pub struct ExecRequest {
    pub sql: String,
    pub sink: RowSink,
    pub cancel: CancellationToken,
}

/// Outcome of a statement that ran to completion (or stopped early)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecSummary {
    /// Rows changed by DML, when the backend reports it
    pub rows_affected: Option<u64>,
    /// Rows delivered on the stream
    pub rows_streamed: u64,
}

/// Batching front of the bounded row channel
///
/// Adapters push rows one at a time; the sink groups them into batches and
/// reports `Break` once the statement's token is cancelled or the consumer
/// went away, which is the adapter's cue to stop reading.
pub struct RowSink {
    tx: Option<mpsc::Sender<StreamEvent>>,
    cancel: CancellationToken,
    batch_size: usize,
    pending: Vec<Row>,
    delivered: u64,
}

impl RowSink {
    pub fn new(
        tx: mpsc::Sender<StreamEvent>,
        cancel: CancellationToken,
        batch_size: usize,
    ) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            tx: Some(tx),
            cancel,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            delivered: 0,
        }
    }

    /// A sink that counts rows without delivering them (non-final script
    /// statements).
    pub fn discard(cancel: CancellationToken) -> Self {
        Self {
            tx: None,
            cancel,
            batch_size: 1024,
            pending: Vec::new(),
            delivered: 0,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub async fn columns(&mut self, columns: Vec<ColumnDef>) -> ControlFlow<()> {
        let Some(tx) = &self.tx else {
            return self.check();
        };
        if tx.send(StreamEvent::Columns(columns)).await.is_err() {
            return ControlFlow::Break(());
        }
        self.check()
    }

    pub async fn push(&mut self, row: Row) -> ControlFlow<()> {
        self.delivered += 1;
        if self.tx.is_none() {
            return self.check();
        }
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            return self.flush().await;
        }
        self.check()
    }

    /// Send any partial batch. Called once the backend is exhausted.
    pub async fn flush(&mut self) -> ControlFlow<()> {
        if let Some(tx) = &self.tx
            && !self.pending.is_empty()
        {
            let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
            tokio::select! {
                sent = tx.send(StreamEvent::Batch(batch)) => {
                    if sent.is_err() {
                        return ControlFlow::Break(());
                    }
                }
                _ = self.cancel.cancelled() => return ControlFlow::Break(()),
            }
        }
        self.check()
    }

    /// Blocking counterparts for adapters whose driver runs on a blocking thread
    pub fn columns_blocking(&mut self, columns: Vec<ColumnDef>) -> ControlFlow<()> {
        if self.tx.is_some() && self.send_blocking(StreamEvent::Columns(columns)).is_break() {
            return ControlFlow::Break(());
        }
        self.check()
    }

    pub fn push_blocking(&mut self, row: Row) -> ControlFlow<()> {
        self.delivered += 1;
        if self.tx.is_none() {
            return self.check();
        }
        self.pending.push(row);
        if self.pending.len() >= self.batch_size {
            return self.flush_blocking();
        }
        self.check()
    }

    pub fn flush_blocking(&mut self) -> ControlFlow<()> {
        if self.tx.is_some() && !self.pending.is_empty() {
            let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
            if self.send_blocking(StreamEvent::Batch(batch)).is_break() {
                return ControlFlow::Break(());
            }
        }
        self.check()
    }

    /// Park the blocking thread until the consumer takes `event`, the
    /// consumer goes away or the statement is cancelled
    fn send_blocking(&self, event: StreamEvent) -> ControlFlow<()> {
        let Some(tx) = &self.tx else {
            return ControlFlow::Continue(());
        };
        let cancel = &self.cancel;
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => ControlFlow::Break(()),
                sent = tx.send(event) => match sent {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(_) => ControlFlow::Break(()),
                },
            }
        })
    }

    fn check(&self) -> ControlFlow<()> {
        if self.cancel.is_cancelled() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    pub fn summary(&self, rows_affected: Option<u64>) -> ExecSummary {
        ExecSummary {
            rows_affected,
            rows_streamed: self.delivered,
        }
    }
}

impl Drop for RowSink {
    /// An adapter that bails out with an error leaves its last partial batch
    /// behind; it still belongs to the result.
    fn drop(&mut self) {
        if self.pending.is_empty() || self.cancel.is_cancelled() {
            return;
        }
        let Some(tx) = self.tx.take() else {
            return;
        };
        let batch = std::mem::take(&mut self.pending);
        match tx.try_send(StreamEvent::Batch(batch)) {
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                    tracing::debug!("no runtime to deliver the last row batch");
                    return;
                };
                let cancel = self.cancel.clone();
                runtime.spawn(async move {
                    tokio::select! {
                        _ = tx.send(event) => {}
                        _ = cancel.cancelled() => {}
                    }
                });
            }
        }
    }
}

/// A live physical connection
///
/// Calls other than `cancel` are serialized by the session; `cancel` may be
/// called concurrently with a running `execute`.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Run one statement, streaming its rows into `req.sink`
    async fn execute(&self, req: ExecRequest) -> StatementResult<ExecSummary>;

    /// Ask the backend to abort whatever statement is running. Backends
    /// without server-side cancellation treat this as a no-op.
    async fn cancel(&self) -> StatementResult<()>;

    /// List schema objects, restricted to one schema when `schema` is given
    async fn introspect(
        &self,
        features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree>;

    /// Lightweight validation round-trip
    async fn ping(&self) -> StatementResult<()>;

    /// Release the physical handle. Must be idempotent.
    async fn close(&self);
}

/// Opens connections for one backend kind
#[async_trait]
pub trait DriverAdapter: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// # Errors
    /// `VizdbError::Connection` for auth, network or handshake failures,
    /// `VizdbError::DriverMissing` when the driver is unavailable.
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn Connection>>;
}

/// Adapter for a kind whose driver was compiled out of this build
pub struct MissingDriver {
    kind: BackendKind,
    hint: String,
}

impl MissingDriver {
    pub fn new(kind: BackendKind, feature: &str) -> Self {
        Self {
            kind,
            hint: format!(
                "this build was compiled without the `{}` feature; rebuild with `--features {}`",
                feature, feature
            ),
        }
    }
}

#[async_trait]
impl DriverAdapter for MissingDriver {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self, _target: &ConnectTarget) -> Result<Arc<dyn Connection>> {
        Err(VizdbError::DriverMissing {
            kind: self.kind.to_string(),
            hint: self.hint.clone(),
        })
    }
}

/// Collect a fully-read statement into columns and rows. Used by
/// introspection helpers that reuse `execute`.
pub async fn collect_rows(
    conn: &dyn Connection,
    sql: &str,
) -> StatementResult<(Vec<ColumnDef>, Vec<Row>)> {
    let (columns, rows, outcome) = collect_partial(conn, sql).await;
    outcome?;
    Ok((columns, rows))
}

/// Like `collect_rows`, but rows delivered before a failure are returned
/// alongside it
pub async fn collect_partial(
    conn: &dyn Connection,
    sql: &str,
) -> (Vec<ColumnDef>, Vec<Row>, StatementResult<ExecSummary>) {
    let (tx, mut rx) = mpsc::channel(16);
    let cancel = CancellationToken::new();
    let req = ExecRequest {
        sql: sql.to_string(),
        sink: RowSink::new(tx, cancel.clone(), 512),
        cancel,
    };
    let reader = async {
        let mut columns = Vec::new();
        let mut rows = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                StreamEvent::Columns(c) => columns = c,
                StreamEvent::Batch(b) => rows.extend(b),
            }
        }
        (columns, rows)
    };
    let (outcome, (columns, rows)) = tokio::join!(conn.execute(req), reader);
    (columns, rows, outcome)
}

/// Expand `~/` and make relative paths absolute for file-based backends.
/// `:memory:` and `file:` URIs pass through.
pub fn expand_file_path(path: &Path) -> Result<String> {
    let text = path.to_string_lossy();
    if text == ":memory:" || text.starts_with("file:") {
        return Ok(text.into_owned());
    }
    let expanded = match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .ok_or(crate::error::ConfigError::NoHomeDir)?
            .join(rest),
        Err(_) => path.to_path_buf(),
    };
    let absolute = if expanded.is_relative() {
        std::env::current_dir()?.join(expanded)
    } else {
        expanded
    };
    Ok(absolute.to_string_lossy().into_owned())
}
