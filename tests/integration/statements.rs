//! Statement submission, scripts and cancellation

use crate::common::{self, MockState};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use vizdb::VizdbError;
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine, SchemaChange, StatementStatus};
use vizdb::error::StatementError;
use vizdb::history::{HistoryOutcome, QueryHistory};
use vizdb::results::{ResultSet, VirtualizerOptions};
use vizdb::workers::WorkerPool;

fn engine() -> QueryEngine {
    QueryEngine::new(WorkerPool::new(4), EngineOptions::default())
}

#[tokio::test]
async fn test_busy_session_rejects_second_statement() {
    let state = Arc::new(MockState::new(10));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine();

    let first = engine
        .submit(&session, "WAIT", OutputShape::Interactive)
        .unwrap();
    let second = engine.submit(&session, "SELECT * FROM numbers", OutputShape::Interactive);
    assert!(matches!(second, Err(VizdbError::SessionBusy)));

    // The rejection leaves the running statement alone
    common::wait_until(|| state.executed().len() == 1).await;
    assert!(!first.is_terminal());

    let outcome = engine.cancel(&first).await;
    assert!(outcome.backend_cancel);
    assert!(outcome.acknowledged);
    assert_eq!(first.wait().await, StatementStatus::Cancelled);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 1);

    // The slot is free once the status is terminal
    let third = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Export)
        .unwrap();
    assert!(matches!(third.wait().await, StatementStatus::Succeeded(_)));
}

#[tokio::test]
async fn test_cancel_without_backend_support_waits_for_driver() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state.clone(), common::buffered_descriptor()).await;
    let engine = engine();

    let statement = engine
        .submit(&session, "SLEEP 300", OutputShape::Interactive)
        .unwrap();
    common::wait_until(|| !state.executed().is_empty()).await;
    let outcome = engine.cancel(&statement).await;
    assert!(!outcome.backend_cancel);
    assert!(!outcome.acknowledged);
    // Still running until the driver returns control
    assert!(!statement.is_terminal());

    assert_eq!(statement.wait().await, StatementStatus::Cancelled);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 0);
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_cancel_after_completion_is_a_no_op() {
    let state = Arc::new(MockState::new(3));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine();

    let statement = engine
        .submit(&session, "DELETE FROM numbers", OutputShape::Export)
        .unwrap();
    assert!(matches!(statement.wait().await, StatementStatus::Succeeded(_)));
    let outcome = engine.cancel(&statement).await;
    assert!(!outcome.acknowledged);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 0);
    assert!(matches!(statement.status(), StatementStatus::Succeeded(_)));
}

#[tokio::test]
async fn test_script_streams_only_the_last_statement() {
    let state = Arc::new(MockState::new(25));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine();

    let mut statement = engine
        .submit(
            &session,
            "UPDATE numbers SET label = 'x';\nSELECT * FROM numbers;",
            OutputShape::Interactive,
        )
        .unwrap();
    // Scripts are never paged
    assert!(statement.paging().is_none());
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    let window = results.window(0, 100).await;
    assert_eq!(common::ids(&window.rows), (0..25).collect::<Vec<_>>());
    assert!(window.exhausted);
    match statement.wait().await {
        StatementStatus::Succeeded(summary) => {
            assert_eq!(summary.statements, 2);
            assert_eq!(summary.rows_affected, Some(1));
            assert_eq!(summary.rows_streamed, 25);
        }
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_script_stops_at_first_error() {
    let state = Arc::new(MockState::new(5));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine();

    let statement = engine
        .submit(
            &session,
            "INSERT INTO numbers VALUES (1); FAIL; DELETE FROM numbers",
            OutputShape::Export,
        )
        .unwrap();
    match statement.wait().await {
        StatementStatus::Failed(StatementError::Syntax(message)) => {
            assert!(message.contains("FAIL"))
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
    assert_eq!(state.executed().len(), 2);
    // A failed statement does not poison the session
    assert!(session.is_usable());
}

#[tokio::test]
async fn test_ddl_reports_touched_schema() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    let engine = engine();

    let statement = engine
        .submit(
            &session,
            "CREATE TABLE reports.daily (day date); CREATE INDEX idx_users ON users (name)",
            OutputShape::Export,
        )
        .unwrap();
    match statement.wait().await {
        StatementStatus::Succeeded(summary) => assert_eq!(
            summary.schema_change,
            SchemaChange::Schemas(vec!["reports".to_string(), "public".to_string()])
        ),
        other => panic!("unexpected status {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_script_is_rejected() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    assert!(engine().submit(&session, " ;  -- nothing\n", OutputShape::Export).is_err());
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_history_records_outcomes() {
    let state = Arc::new(MockState::new(4));
    let session = common::session(state, common::mock_descriptor()).await;
    let history = Arc::new(Mutex::new(QueryHistory::new(10)));
    let engine = engine().with_history(history.clone());

    let ok = engine
        .submit(&session, "DELETE FROM numbers", OutputShape::Export)
        .unwrap();
    ok.wait().await;
    let failed = engine.submit(&session, "FAIL", OutputShape::Export).unwrap();
    failed.wait().await;

    let history = history.lock();
    let outcomes: Vec<_> = history.recent(10).iter().map(|e| e.outcome).collect();
    assert_eq!(
        outcomes,
        vec![HistoryOutcome::Failed, HistoryOutcome::Succeeded]
    );
    assert_eq!(history.recent(10)[1].rows, Some(1));
    assert_eq!(history.recent(10)[1].profile, "mock");
}

#[tokio::test]
async fn test_cancel_is_sent_while_pool_is_saturated() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    // The single permit is held by the statement being cancelled
    let engine = QueryEngine::new(WorkerPool::new(1), EngineOptions::default());

    let statement = engine
        .submit(&session, "SLEEP 1500", OutputShape::Export)
        .unwrap();
    common::wait_until(|| !state.executed().is_empty()).await;
    assert_eq!(engine.pool().busy(), 1);

    let outcome = tokio::time::timeout(Duration::from_millis(500), engine.cancel(&statement))
        .await
        .expect("cancel queued behind the running statement");
    assert!(outcome.acknowledged);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 1);
    assert_eq!(statement.wait().await, StatementStatus::Cancelled);
}

fn retrying_descriptor(retries: u32) -> vizdb::db::CapabilityDescriptor {
    let mut descriptor = common::mock_descriptor();
    descriptor.cancel_policy.retries = retries;
    descriptor.cancel_policy.attempt_timeout = Duration::from_millis(200);
    descriptor
}

#[tokio::test]
async fn test_cancel_retries_until_backend_accepts() {
    let state = Arc::new(MockState::new(0));
    state.cancel_failures.store(2, Ordering::SeqCst);
    let session = common::session(state.clone(), retrying_descriptor(2)).await;
    let engine = engine();

    let statement = engine.submit(&session, "WAIT", OutputShape::Export).unwrap();
    common::wait_until(|| !state.executed().is_empty()).await;
    let outcome = engine.cancel(&statement).await;
    assert!(outcome.acknowledged);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 3);
    assert_eq!(statement.wait().await, StatementStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_gives_up_after_retries() {
    let state = Arc::new(MockState::new(0));
    state.cancel_failures.store(3, Ordering::SeqCst);
    let session = common::session(state.clone(), retrying_descriptor(2)).await;
    let engine = engine();

    let statement = engine.submit(&session, "WAIT", OutputShape::Export).unwrap();
    common::wait_until(|| !state.executed().is_empty()).await;
    let outcome = engine.cancel(&statement).await;
    assert!(outcome.backend_cancel);
    assert!(!outcome.acknowledged);
    assert_eq!(state.cancels.load(Ordering::SeqCst), 3);
    // Local consumption stopped regardless
    assert_eq!(statement.wait().await, StatementStatus::Cancelled);
}

#[tokio::test]
async fn test_select_with_trailing_comment_is_paged() {
    let state = Arc::new(MockState::new(30));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine();

    let mut statement = engine
        .submit(
            &session,
            "SELECT * FROM numbers -- all rows",
            OutputShape::Interactive,
        )
        .unwrap();
    assert!(statement.paging().is_some());
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    let window = results.window(0, 10).await;
    assert_eq!(common::ids(&window.rows), (0..10).collect::<Vec<_>>());
    assert!(window.error.is_none());

    let executed = state.executed();
    assert!(executed[0].starts_with("SELECT * FROM (SELECT * FROM numbers) AS vizdb_page"));
    assert!(!executed[0].contains("--"));
}

#[tokio::test]
async fn test_transaction_state_follows_statements() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    let engine = engine();
    assert!(!session.in_transaction());

    let begin = engine.submit(&session, "BEGIN", OutputShape::Export).unwrap();
    assert!(matches!(begin.wait().await, StatementStatus::Succeeded(_)));
    assert!(session.in_transaction());

    // A failing statement inside the block leaves it open
    let failed = engine.submit(&session, "FAIL", OutputShape::Export).unwrap();
    failed.wait().await;
    assert!(session.in_transaction());

    let commit = engine
        .submit(
            &session,
            "INSERT INTO numbers VALUES (1); COMMIT",
            OutputShape::Export,
        )
        .unwrap();
    assert!(matches!(commit.wait().await, StatementStatus::Succeeded(_)));
    assert!(!session.in_transaction());

    let script = engine
        .submit(&session, "START TRANSACTION; DELETE FROM numbers", OutputShape::Export)
        .unwrap();
    script.wait().await;
    assert!(session.in_transaction());
    let lost = engine.submit(&session, "LOSE", OutputShape::Export).unwrap();
    lost.wait().await;
    // The server rolls back whatever was open on a dropped connection
    assert!(!session.in_transaction());
}
