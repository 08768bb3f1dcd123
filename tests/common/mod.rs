//! Common test utilities and helpers
//!
//! A scripted in-process backend plus a tunnel manager that only records
//! what happens, so session, engine and virtualizer behavior can be tested
//! without a database server.
//!
//! The mock understands a handful of statements:
//!
//! - `SELECT ... FROM numbers` streams `rows` rows `(id, label)`; a trailing
//!   `LIMIT n OFFSET m` restricts the range
//!   and, with `fail_at` set, breaks off with that error once the stream
//!   reaches the given row id
//! - `SLEEP <ms>` ignores cancellation and returns after `ms`
//! - `WAIT` returns once the statement is cancelled
//! - `FAIL` fails with a syntax error, `LOSE` with lost connectivity
//! - anything else succeeds with one affected row

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use vizdb::config::{ConnectionProfile, Endpoint, TunnelAuth, TunnelSpec};
use vizdb::credentials::{CredentialStore, Secret};
use vizdb::db::capability::Pagination;
use vizdb::db::schema::{Column, Schema, SchemaTree, Table};
use vizdb::db::{
    BackendKind, CapabilityDescriptor, CellValue, ColumnDef, ConnectTarget, Connection, DataType,
    DriverAdapter, ExecRequest, ExecSummary, IntrospectionFeatures, ProviderRegistry, Row,
};
use vizdb::error::{StatementError, StatementResult, TunnelError};
use vizdb::session::{ConnectionManager, Session};
use vizdb::tunnel::{Tunnel, TunnelManager};

/// Shared, inspectable state of the mock backend
pub struct MockState {
    pub rows: usize,
    /// Row ids whose label contains `needle`
    pub needles: Vec<i64>,
    pub executed: Mutex<Vec<String>>,
    /// Backend cancel requests received, failed ones included
    pub cancels: AtomicUsize,
    /// Cancel requests still to fail before one succeeds
    pub cancel_failures: AtomicUsize,
    /// Row id at which `SELECT` streams stop with the error
    pub fail_at: Option<(usize, StatementError)>,
    pub closes: AtomicUsize,
    pub schema: Mutex<SchemaTree>,
    /// When set, introspection waits for a permit
    pub introspect_gate: Option<Arc<Semaphore>>,
    /// Ordered record of teardown steps, shared with the tunnel manager
    pub journal: Arc<Mutex<Vec<String>>>,
}

impl MockState {
    pub fn new(rows: usize) -> Self {
        Self {
            rows,
            needles: Vec::new(),
            executed: Mutex::new(Vec::new()),
            cancels: AtomicUsize::new(0),
            cancel_failures: AtomicUsize::new(0),
            fail_at: None,
            closes: AtomicUsize::new(0),
            schema: Mutex::new(test_schema()),
            introspect_gate: None,
            journal: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }
}

pub struct MockAdapter {
    pub state: Arc<MockState>,
}

#[async_trait]
impl DriverAdapter for MockAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Postgresql
    }

    async fn connect(&self, _target: &ConnectTarget) -> vizdb::Result<Arc<dyn Connection>> {
        Ok(Arc::new(MockConnection {
            state: self.state.clone(),
        }))
    }
}

pub struct MockConnection {
    state: Arc<MockState>,
}

pub fn label(state: &MockState, id: i64) -> String {
    if state.needles.contains(&id) {
        format!("needle-{}", id)
    } else {
        format!("row-{}", id)
    }
}

/// Trailing `LIMIT n OFFSET m`, if any
fn page_bounds(sql: &str) -> Option<(usize, usize)> {
    let words: Vec<&str> = sql.split_whitespace().collect();
    match words.as_slice() {
        [.., "LIMIT", n, "OFFSET", m] => Some((n.parse().ok()?, m.parse().ok()?)),
        _ => None,
    }
}

#[async_trait]
impl Connection for MockConnection {
    async fn execute(&self, mut req: ExecRequest) -> StatementResult<ExecSummary> {
        self.state.executed.lock().push(req.sql.clone());
        let sql = req.sql.trim().to_string();
        let upper = sql.to_ascii_uppercase();

        if upper.starts_with("SLEEP") {
            let ms: u64 = upper
                .split_whitespace()
                .nth(1)
                .and_then(|v| v.parse().ok())
                .unwrap_or(50);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(req.sink.summary(Some(0)));
        }
        if upper.starts_with("WAIT") {
            req.cancel.cancelled().await;
            return Ok(req.sink.summary(None));
        }
        if upper.starts_with("FAIL") {
            return Err(StatementError::Syntax("near FAIL".into()));
        }
        if upper.starts_with("LOSE") {
            return Err(StatementError::ConnectivityLost("connection reset".into()));
        }
        if !upper.starts_with("SELECT") {
            return Ok(req.sink.summary(Some(1)));
        }

        let (start, end) = match page_bounds(&upper) {
            Some((limit, offset)) => (offset, (offset + limit).min(self.state.rows)),
            None => (0, self.state.rows),
        };
        let columns = vec![
            ColumnDef::new("id", DataType::BigInt),
            ColumnDef::new("label", DataType::Text),
        ];
        if req.sink.columns(columns).await.is_break() {
            return Ok(req.sink.summary(None));
        }
        for id in start..end.max(start) {
            if let Some((at, error)) = &self.state.fail_at
                && id >= *at
            {
                let _ = req.sink.flush().await;
                return Err(error.clone());
            }
            let id = id as i64;
            let row = Row::new(vec![
                CellValue::Integer(id),
                CellValue::Text(label(&self.state, id)),
            ]);
            if let ControlFlow::Break(()) = req.sink.push(row).await {
                return Ok(req.sink.summary(None));
            }
        }
        let _ = req.sink.flush().await;
        Ok(req.sink.summary(None))
    }

    async fn cancel(&self) -> StatementResult<()> {
        self.state.cancels.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .state
            .cancel_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StatementError::driver("cancel request rejected"));
        }
        Ok(())
    }

    async fn introspect(
        &self,
        _features: IntrospectionFeatures,
        schema: Option<&str>,
    ) -> StatementResult<SchemaTree> {
        if let Some(gate) = &self.state.introspect_gate {
            let _permit = gate
                .acquire()
                .await
                .map_err(|_| StatementError::driver("gate closed"))?;
        }
        let mut tree = self.state.schema.lock().clone();
        if let Some(name) = schema {
            tree.schemas.retain(|s| s.name == name);
        }
        Ok(tree)
    }

    async fn ping(&self) -> StatementResult<()> {
        Ok(())
    }

    async fn close(&self) {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        self.state.journal.lock().push("connection.close".into());
    }
}

/// Tunnel manager that hands out fake local ports and records teardown
pub struct RecordingTunnels {
    pub journal: Arc<Mutex<Vec<String>>>,
    pub opened: AtomicUsize,
}

impl RecordingTunnels {
    pub fn new(journal: Arc<Mutex<Vec<String>>>) -> Self {
        Self {
            journal,
            opened: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl TunnelManager for RecordingTunnels {
    async fn open(
        &self,
        _spec: &TunnelSpec,
        _secret: Option<Secret>,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<Box<dyn Tunnel>, TunnelError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.journal
            .lock()
            .push(format!("tunnel.open {}:{}", remote_host, remote_port));
        Ok(Box::new(RecordedTunnel {
            journal: self.journal.clone(),
        }))
    }
}

struct RecordedTunnel {
    journal: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl Tunnel for RecordedTunnel {
    fn local_port(&self) -> u16 {
        40022
    }

    async fn close(&self) {
        self.journal.lock().push("tunnel.close".into());
    }
}

/// Descriptor for the mock: cancellable, natively paginated, no auth
pub fn mock_descriptor() -> CapabilityDescriptor {
    let mut descriptor = CapabilityDescriptor::builtin(BackendKind::Postgresql);
    descriptor.requires_auth = false;
    descriptor
}

/// Same backend, but without server-side cancellation or native paging
pub fn buffered_descriptor() -> CapabilityDescriptor {
    let mut descriptor = mock_descriptor();
    descriptor.supports_cancellation = false;
    descriptor.pagination = Pagination::ClientSide;
    descriptor
}

pub fn test_profile() -> ConnectionProfile {
    ConnectionProfile::new(
        "mock",
        BackendKind::Postgresql,
        Endpoint::Tcp {
            host: "db.internal".into(),
            port: 5432,
        },
    )
}

pub fn tunneled_profile() -> ConnectionProfile {
    let mut profile = test_profile();
    profile.tunnel = Some(TunnelSpec {
        host: "bastion.example.com".into(),
        port: 22,
        username: "ops".into(),
        auth: TunnelAuth::Key {
            key_path: "/home/ops/.ssh/id_ed25519".into(),
        },
        local_port: 0,
        credential_key: None,
    });
    profile
}

/// Manager wired to the mock backend and a recording tunnel manager
pub fn manager(
    state: Arc<MockState>,
    descriptor: CapabilityDescriptor,
) -> (ConnectionManager, Arc<RecordingTunnels>) {
    let mut registry = ProviderRegistry::new();
    registry.register(descriptor, Arc::new(MockAdapter { state: state.clone() }));
    let tunnels = Arc::new(RecordingTunnels::new(state.journal.clone()));
    let manager = ConnectionManager::new(
        Arc::new(registry),
        Arc::new(CredentialStore::in_memory()),
        tunnels.clone(),
    );
    (manager, tunnels)
}

/// An open session over the mock backend
pub async fn session(state: Arc<MockState>, descriptor: CapabilityDescriptor) -> Arc<Session> {
    let (manager, _) = manager(state, descriptor);
    manager
        .resolve(&test_profile())
        .await
        .expect("mock session")
}

pub fn table(name: &str, cols: &[&str]) -> Table {
    Table::new(
        name,
        cols.iter()
            .map(|c| Column::new(*c, DataType::Text))
            .collect(),
    )
}

/// Create a standard test schema for consistent testing
pub fn test_schema() -> SchemaTree {
    let mut public = Schema::named("public");
    public.tables = vec![
        table("users", &["id", "name", "email"]),
        table("user_roles", &["user_id", "role"]),
        table("settings", &["key", "value"]),
    ];
    SchemaTree {
        schemas: vec![public],
    }
}

pub fn ids(rows: &[Row]) -> Vec<i64> {
    rows.iter()
        .map(|r| match r.values[0] {
            CellValue::Integer(i) => i,
            ref other => panic!("unexpected cell {:?}", other),
        })
        .collect()
}

/// Poll `done` until it holds; panics after two seconds
pub async fn wait_until(mut done: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
