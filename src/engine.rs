//! Query execution engine
//!
//! `submit` claims the session's single statement slot, splits the script
//! and runs it on the worker pool. Rows of the final statement flow through
//! a bounded channel; the statement's status is published on a watch
//! channel and reaches a terminal value exactly once, after the slot has
//! been released.

use crate::config::Settings;
use crate::config::settings::CancelSettings;
use crate::db::capability::CancelPolicy;
use crate::db::provider::StreamEvent;
use crate::db::{Connection, ExecRequest, RowSink};
use crate::error::{Result, StatementError, VizdbError};
use crate::history::{HistoryEntry, HistoryOutcome, QueryHistory};
use crate::session::{Session, StatementSlot};
use crate::sql::{self, AlertMode, AlertSeverity};
use crate::workers::WorkerPool;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// What the caller will do with the rows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputShape {
    /// Browsed window by window; single queries may be paged natively
    Interactive,
    /// Drained once, front to back
    Export,
}

/// Schemas touched by successful DDL
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaChange {
    #[default]
    None,
    Schemas(Vec<String>),
    /// DDL ran but its schema could not be determined
    Unknown,
}

impl SchemaChange {
    fn record(&mut self, schema: Option<String>) {
        *self = match (std::mem::take(self), schema) {
            (SchemaChange::Unknown, _) | (_, None) => SchemaChange::Unknown,
            (SchemaChange::None, Some(s)) => SchemaChange::Schemas(vec![s]),
            (SchemaChange::Schemas(mut list), Some(s)) => {
                if !list.contains(&s) {
                    list.push(s);
                }
                SchemaChange::Schemas(list)
            }
        };
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementSummary {
    /// Statements of the script that completed
    pub statements: usize,
    /// Sum of the counts backends reported, if any did
    pub rows_affected: Option<u64>,
    /// Rows delivered by the final statement
    pub rows_streamed: u64,
    pub schema_change: SchemaChange,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StatementStatus {
    Pending,
    Running,
    Succeeded(StatementSummary),
    Failed(StatementError),
    Cancelled,
}

impl StatementStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, StatementStatus::Pending | StatementStatus::Running)
    }
}

/// Native paging plan for a single pageable query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagePlan {
    /// The query as written; pages wrap it
    pub sql: String,
    pub page_size: usize,
}

/// Result of a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelOutcome {
    /// The backend supports server-side cancellation
    pub backend_cancel: bool,
    /// The backend accepted the cancel request
    pub acknowledged: bool,
}

/// A submitted statement (or script)
pub struct Statement {
    id: Uuid,
    sql: String,
    started_at: DateTime<Utc>,
    shape: OutputShape,
    cancel: CancellationToken,
    status: watch::Receiver<StatementStatus>,
    session: Arc<Session>,
    paging: Option<PagePlan>,
    events: Option<mpsc::Receiver<StreamEvent>>,
}

impl Statement {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn shape(&self) -> OutputShape {
        self.shape
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn paging(&self) -> Option<&PagePlan> {
        self.paging.as_ref()
    }

    pub fn status(&self) -> StatementStatus {
        self.status.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.borrow().is_terminal()
    }

    /// A receiver that observes status changes
    pub fn watch(&self) -> watch::Receiver<StatementStatus> {
        self.status.clone()
    }

    /// Wait for the terminal status
    pub async fn wait(&self) -> StatementStatus {
        let mut status = self.status.clone();
        if let Ok(done) = status.wait_for(StatementStatus::is_terminal).await {
            return done.clone();
        }
        // The runner is gone; whatever it last published is final
        status.borrow().clone()
    }

    /// The row stream; handed out once
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<StreamEvent>> {
        self.events.take()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

/// Engine tuning, usually taken from settings
#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub batch_size: usize,
    /// Row channel capacity, in batches
    pub channel_batches: usize,
    pub page_size: usize,
    pub cancel: CancelSettings,
    pub alert_mode: AlertMode,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            channel_batches: 4,
            page_size: 500,
            cancel: CancelSettings::default(),
            alert_mode: AlertMode::default(),
        }
    }
}

impl From<&Settings> for EngineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            batch_size: settings.limits.batch_size,
            page_size: settings.limits.batch_size,
            cancel: settings.cancel.clone(),
            alert_mode: settings.alerts.mode,
            ..Self::default()
        }
    }
}

pub struct QueryEngine {
    pool: WorkerPool,
    options: EngineOptions,
    history: Option<Arc<Mutex<QueryHistory>>>,
}

struct Job {
    id: Uuid,
    session: Arc<Session>,
    slot: StatementSlot,
    statements: Vec<String>,
    script: String,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
    status: watch::Sender<StatementStatus>,
    batch_size: usize,
    history: Option<Arc<Mutex<QueryHistory>>>,
    started_at: DateTime<Utc>,
}

impl QueryEngine {
    pub fn new(pool: WorkerPool, options: EngineOptions) -> Self {
        Self {
            pool,
            options,
            history: None,
        }
    }

    pub fn with_history(mut self, history: Arc<Mutex<QueryHistory>>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn options(&self) -> &EngineOptions {
        &self.options
    }

    /// Severity of the riskiest statement in `sql`
    pub fn alert(&self, sql: &str) -> AlertSeverity {
        sql::classify_alert(sql)
    }

    /// Whether the configured alert mode asks for confirmation before `sql`
    pub fn needs_confirmation(&self, sql: &str) -> bool {
        sql::should_confirm(self.options.alert_mode, self.alert(sql))
    }

    /// Start `sql` on `session`
    ///
    /// Fails with `SessionBusy` while another statement on the session is
    /// non-terminal and with `SessionInvalid` once the session lost
    /// connectivity or was closed.
    pub fn submit(
        &self,
        session: &Arc<Session>,
        sql: &str,
        shape: OutputShape,
    ) -> Result<Statement> {
        let statements = sql::split_statements(sql);
        if statements.is_empty() {
            return Err(StatementError::driver("Nothing to execute").into());
        }
        let slot = session.begin_statement()?;

        let descriptor = session.descriptor();
        let mut paging = None;
        let mut statements = statements;
        if shape == OutputShape::Interactive
            && statements.len() == 1
            && sql::is_pageable_select(&statements[0])
            && let Some(first_page) =
                descriptor.paginate_sql(&statements[0], self.options.page_size, 0)
        {
            paging = Some(PagePlan {
                sql: std::mem::replace(&mut statements[0], first_page),
                page_size: self.options.page_size,
            });
        }

        let id = Uuid::new_v4();
        let started_at = Utc::now();
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.options.channel_batches.max(1));
        let (status_tx, status_rx) = watch::channel(StatementStatus::Pending);
        tracing::debug!(
            statement = %id,
            session = %session.id(),
            count = statements.len(),
            paged = paging.is_some(),
            sql = %sql::sql_preview(sql),
            "submitting"
        );

        let job = Job {
            id,
            session: session.clone(),
            slot,
            statements,
            script: sql.to_string(),
            tx,
            cancel: cancel.clone(),
            status: status_tx,
            batch_size: self.options.batch_size,
            history: self.history.clone(),
            started_at,
        };
        self.pool.spawn(run(job));

        Ok(Statement {
            id,
            sql: sql.to_string(),
            started_at,
            shape,
            cancel,
            status: status_rx,
            session: session.clone(),
            paging,
            events: Some(rx),
        })
    }

    /// Stop a statement
    ///
    /// Local consumption stops at once. When the backend supports it a
    /// server-side cancel is also sent, retried per the cancel policy. The
    /// statement ends `Cancelled` once the backend returns control.
    pub async fn cancel(&self, statement: &Statement) -> CancelOutcome {
        let descriptor = statement.session.descriptor();
        let backend_cancel = descriptor.supports_cancellation;
        if statement.is_terminal() {
            return CancelOutcome {
                backend_cancel,
                acknowledged: false,
            };
        }
        tracing::info!(statement = %statement.id, backend_cancel, "cancel requested");
        statement.cancel.cancel();
        if !backend_cancel {
            return CancelOutcome {
                backend_cancel,
                acknowledged: false,
            };
        }

        let policy = self.options.cancel.apply(descriptor.cancel_policy);
        let conn = statement.session.connection();
        let acknowledged = self
            .pool
            .run_cancel(async move { Ok(cancel_with_retry(conn, policy).await) })
            .await
            .unwrap_or(false);
        CancelOutcome {
            backend_cancel,
            acknowledged,
        }
    }
}

async fn cancel_with_retry(conn: Arc<dyn Connection>, policy: CancelPolicy) -> bool {
    for attempt in 0..=policy.retries {
        match tokio::time::timeout(policy.attempt_timeout, conn.cancel()).await {
            Ok(Ok(())) => return true,
            Ok(Err(e)) => tracing::warn!(attempt, error = %e, "backend cancel failed"),
            Err(_) => tracing::warn!(attempt, after = ?policy.attempt_timeout, "backend cancel timed out"),
        }
    }
    false
}

async fn run(job: Job) {
    let Job {
        id,
        session,
        slot,
        statements,
        script,
        tx,
        cancel,
        status,
        batch_size,
        history,
        started_at,
    } = job;
    let clock = Instant::now();
    status.send_replace(StatementStatus::Running);

    let conn = session.connection();
    let exec_lock = session.exec_lock();
    let guard = exec_lock.lock().await;
    let default_schema = session.default_schema().map(str::to_string);

    let mut summary = StatementSummary::default();
    let mut failure: Option<StatementError> = None;
    let mut tx = Some(tx);
    let last = statements.len() - 1;
    for (idx, text) in statements.iter().enumerate() {
        if cancel.is_cancelled() {
            break;
        }
        // Earlier statements of a script are only summarized
        let sink = match tx.take_if(|_| idx == last) {
            Some(tx) => RowSink::new(tx, cancel.clone(), batch_size),
            None => RowSink::discard(cancel.clone()),
        };
        tracing::debug!(statement = %id, idx, sql = %sql::sql_preview(text), "executing");
        let req = ExecRequest {
            sql: text.clone(),
            sink,
            cancel: cancel.clone(),
        };
        match conn.execute(req).await {
            Ok(done) => {
                summary.statements += 1;
                if let Some(n) = done.rows_affected {
                    summary.rows_affected = Some(summary.rows_affected.unwrap_or(0) + n);
                }
                if idx == last {
                    summary.rows_streamed = done.rows_streamed;
                }
                if sql::is_ddl(text) {
                    summary
                        .schema_change
                        .record(sql::ddl_target_schema(text, default_schema.as_deref()));
                }
                if let Some(control) = sql::transaction_control(text) {
                    session.record_transaction(control);
                }
            }
            Err(e) => {
                if e.is_connectivity_lost() {
                    session.invalidate(e.to_string());
                }
                failure = Some(e);
                break;
            }
        }
    }
    drop(tx);
    drop(guard);
    summary.elapsed = clock.elapsed();

    let outcome = if cancel.is_cancelled() {
        StatementStatus::Cancelled
    } else if let Some(e) = failure {
        StatementStatus::Failed(e)
    } else {
        StatementStatus::Succeeded(summary)
    };
    match &outcome {
        StatementStatus::Failed(e) => tracing::info!(statement = %id, error = %e, "statement failed"),
        other => tracing::debug!(statement = %id, status = ?other, "statement finished"),
    }

    if let Some(history) = history {
        let (result, rows) = match &outcome {
            StatementStatus::Succeeded(s) => (
                HistoryOutcome::Succeeded,
                s.rows_affected.or(Some(s.rows_streamed)),
            ),
            StatementStatus::Cancelled => (HistoryOutcome::Cancelled, None),
            _ => (HistoryOutcome::Failed, None),
        };
        history.lock().push(HistoryEntry {
            sql: script,
            profile: session.profile().name.clone(),
            executed_at: started_at,
            duration_ms: clock.elapsed().as_millis() as u64,
            outcome: result,
            rows,
        });
    }

    drop(slot);
    status.send_replace(outcome);
}

impl From<StatementError> for StatementStatus {
    fn from(e: StatementError) -> Self {
        StatementStatus::Failed(e)
    }
}

/// Convenience for callers that only want the terminal error
pub fn into_result(status: StatementStatus) -> Result<StatementSummary> {
    match status {
        StatementStatus::Succeeded(summary) => Ok(summary),
        StatementStatus::Failed(e) => Err(e.into()),
        StatementStatus::Cancelled => Err(VizdbError::Statement(StatementError::driver(
            "Statement was cancelled",
        ))),
        StatementStatus::Pending | StatementStatus::Running => Err(VizdbError::Statement(
            StatementError::driver("Statement has not finished"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_changes_accumulate() {
        let mut change = SchemaChange::None;
        change.record(Some("public".into()));
        change.record(Some("audit".into()));
        change.record(Some("public".into()));
        assert_eq!(
            change,
            SchemaChange::Schemas(vec!["public".into(), "audit".into()])
        );
        change.record(None);
        assert_eq!(change, SchemaChange::Unknown);
        change.record(Some("public".into()));
        assert_eq!(change, SchemaChange::Unknown);
    }

    #[test]
    fn terminal_states() {
        assert!(!StatementStatus::Pending.is_terminal());
        assert!(!StatementStatus::Running.is_terminal());
        assert!(StatementStatus::Cancelled.is_terminal());
        assert!(StatementStatus::from(StatementError::Syntax("x".into())).is_terminal());
    }

    #[test]
    fn unfinished_status_is_not_a_result() {
        assert!(into_result(StatementStatus::Running).is_err());
        let summary = StatementSummary {
            statements: 1,
            ..Default::default()
        };
        assert_eq!(
            into_result(StatementStatus::Succeeded(summary.clone())).unwrap(),
            summary
        );
    }
}
