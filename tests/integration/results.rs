//! Windowed access, paging, spilling, filtering and export

use crate::common::{self, MockState};
use std::sync::Arc;
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine, StatementStatus};
use vizdb::error::StatementError;
use vizdb::export::{self, ExportFormat};
use vizdb::results::{ResultSet, RowCursor, RowFilter, VirtualizerOptions};
use vizdb::workers::WorkerPool;

fn engine_with(page_size: usize, batch_size: usize) -> QueryEngine {
    QueryEngine::new(
        WorkerPool::new(4),
        EngineOptions {
            page_size,
            batch_size,
            ..EngineOptions::default()
        },
    )
}

#[tokio::test]
async fn test_buffered_windows_are_disjoint() {
    let state = Arc::new(MockState::new(120));
    let session = common::session(state.clone(), common::buffered_descriptor()).await;
    let engine = engine_with(50, 16);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    assert!(statement.paging().is_none());
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    let first = results.window(0, 50).await;
    let second = results.window(50, 50).await;
    assert_eq!(common::ids(&first.rows), (0..50).collect::<Vec<_>>());
    assert_eq!(common::ids(&second.rows), (50..100).collect::<Vec<_>>());
    assert_eq!(second.positions, (50..100).collect::<Vec<_>>());
    assert_eq!(first.columns.len(), 2);

    let tail = results.window(100, 50).await;
    assert_eq!(common::ids(&tail.rows), (100..120).collect::<Vec<_>>());
    assert!(tail.exhausted);
    assert_eq!(tail.total_known, 120);
    assert!(results.window(500, 10).await.rows.is_empty());

    // One statement, no re-queries
    assert_eq!(state.executed().len(), 1);
}

#[tokio::test]
async fn test_paged_windows_requery_later_pages() {
    let state = Arc::new(MockState::new(120));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine_with(50, 16);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    assert_eq!(statement.paging().map(|p| p.page_size), Some(50));
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    assert!(results.is_paged());

    let first = results.window(0, 50).await;
    let second = results.window(50, 50).await;
    assert_eq!(common::ids(&first.rows), (0..50).collect::<Vec<_>>());
    assert_eq!(common::ids(&second.rows), (50..100).collect::<Vec<_>>());
    assert!(!second.exhausted);

    let executed = state.executed();
    assert_eq!(executed.len(), 2);
    assert!(executed[0].ends_with("LIMIT 50 OFFSET 0"));
    assert!(executed[1].ends_with("LIMIT 50 OFFSET 50"));

    // Cached pages are not fetched again
    results.window(50, 50).await;
    assert_eq!(state.executed().len(), 2);

    let tail = results.window(90, 50).await;
    assert_eq!(common::ids(&tail.rows), (90..120).collect::<Vec<_>>());
    assert!(tail.exhausted);
    assert_eq!(tail.total_known, 120);
    assert!(results.window(200, 50).await.rows.is_empty());
    assert_eq!(state.executed().len(), 3);
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_spilled_rows_read_back_in_order() {
    let state = Arc::new(MockState::new(1_000));
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(50, 40);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let options = VirtualizerOptions {
        max_buffered_rows: 100,
        page_cache: 4,
    };
    let results = ResultSet::open(&mut statement, options).unwrap();
    assert!(matches!(results.finished().await, StatementStatus::Succeeded(_)));

    let head = results.window(0, 30).await;
    assert_eq!(common::ids(&head.rows), (0..30).collect::<Vec<_>>());
    let across = results.window(515, 50).await;
    assert_eq!(common::ids(&across.rows), (515..565).collect::<Vec<_>>());
    let tail = results.window(990, 50).await;
    assert_eq!(common::ids(&tail.rows), (990..1000).collect::<Vec<_>>());
    assert!(tail.exhausted);
}

fn needle_state() -> Arc<MockState> {
    Arc::new(MockState {
        needles: vec![7, 500_000, 999_999],
        ..MockState::new(1_000_000)
    })
}

#[tokio::test]
async fn test_filter_while_streaming_finds_every_match() {
    let state = needle_state();
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(500, 5_000);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    // Issued right away; the scan keeps up with the stream
    let filter = RowFilter::Substring("needle".into());
    let window = results.filtered_window(&filter, 0, 10).await;
    assert_eq!(window.positions, vec![7, 500_000, 999_999]);
    assert_eq!(common::ids(&window.rows), vec![7, 500_000, 999_999]);
    assert_eq!(window.total_known, 3);
    assert!(window.exhausted);
    assert!(window.error.is_none());
}

#[tokio::test]
async fn test_filter_after_completion_finds_every_match() {
    let state = needle_state();
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(500, 5_000);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    assert!(matches!(results.finished().await, StatementStatus::Succeeded(_)));
    assert_eq!(results.known_rows(), 1_000_000);

    let filter = RowFilter::Substring("NEEDLE".into());
    let first = results.filtered_window(&filter, 0, 2).await;
    assert_eq!(first.positions, vec![7, 500_000]);
    assert!(!first.exhausted);
    let rest = results.filtered_window(&filter, 2, 2).await;
    assert_eq!(rest.positions, vec![999_999]);
    assert_eq!(rest.total_known, 3);
    assert!(rest.exhausted);
}

#[tokio::test]
async fn test_failed_stream_keeps_rows_and_error() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(50, 10);

    let mut statement = engine
        .submit(&session, "FAIL", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    let window = results.window(0, 10).await;
    assert!(window.rows.is_empty());
    assert!(window.exhausted);
    assert!(window.error.is_some());
}

fn broken_stream(rows: usize, at: usize, error: StatementError) -> Arc<MockState> {
    Arc::new(MockState {
        needles: vec![2_500],
        fail_at: Some((at, error)),
        ..MockState::new(rows)
    })
}

#[tokio::test]
async fn test_broken_stream_keeps_rows_before_the_break() {
    let state = broken_stream(10_000, 3_000, StatementError::driver("stream interrupted"));
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(500, 100);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    assert!(matches!(results.finished().await, StatementStatus::Failed(_)));

    let head = results.window(0, 50).await;
    assert_eq!(common::ids(&head.rows), (0..50).collect::<Vec<_>>());
    let tail = results.window(2_990, 50).await;
    assert_eq!(common::ids(&tail.rows), (2_990..3_000).collect::<Vec<_>>());
    assert!(tail.exhausted);
    assert_eq!(tail.total_known, 3_000);
    assert_eq!(
        tail.error,
        Some(StatementError::driver("stream interrupted"))
    );
}

#[tokio::test]
async fn test_filter_scans_rows_before_the_break() {
    let state = broken_stream(10_000, 3_000, StatementError::driver("stream interrupted"));
    let session = common::session(state, common::buffered_descriptor()).await;
    let engine = engine_with(500, 100);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    let filter = RowFilter::Substring("needle".into());
    let window = results.filtered_window(&filter, 0, 10).await;
    assert_eq!(window.positions, vec![2_500]);
    assert_eq!(common::ids(&window.rows), vec![2_500]);
    assert!(window.exhausted);
    assert!(window.error.is_some());
}

#[tokio::test]
async fn test_paged_first_page_keeps_rows_after_connection_loss() {
    let state = broken_stream(
        10_000,
        3_000,
        StatementError::ConnectivityLost("connection reset".into()),
    );
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine_with(5_000, 100);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    assert!(statement.paging().is_some());
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    let window = results.window(0, 50).await;
    assert_eq!(common::ids(&window.rows), (0..50).collect::<Vec<_>>());
    assert!(window.error.as_ref().is_some_and(|e| e.is_connectivity_lost()));
    let tail = results.window(2_990, 50).await;
    assert_eq!(common::ids(&tail.rows), (2_990..3_000).collect::<Vec<_>>());
    assert!(tail.exhausted);

    // Nothing past the break is re-queried
    assert!(results.window(6_000, 50).await.rows.is_empty());
    assert_eq!(state.executed().len(), 1);
    assert!(!session.is_usable());
}

#[tokio::test]
async fn test_broken_later_page_is_cached_as_the_last() {
    let state = broken_stream(120, 70, StatementError::driver("stream interrupted"));
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let engine = engine_with(50, 16);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Interactive)
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    assert_eq!(results.window(0, 50).await.rows.len(), 50);

    let second = results.window(50, 50).await;
    assert_eq!(common::ids(&second.rows), (50..70).collect::<Vec<_>>());
    assert!(second.exhausted);
    assert_eq!(second.total_known, 70);
    assert_eq!(
        second.error,
        Some(StatementError::driver("stream interrupted"))
    );

    // The partial page is terminal: no page past it, no second fetch of it
    assert!(results.window(100, 50).await.rows.is_empty());
    assert_eq!(common::ids(&results.window(60, 5).await.rows), vec![60, 61, 62, 63, 64]);
    assert_eq!(state.executed().len(), 2);
    assert!(session.is_usable());
}

#[tokio::test]
async fn test_export_drains_cursor_to_csv() {
    let state = Arc::new(MockState {
        needles: vec![1],
        ..MockState::new(3)
    });
    let session = common::session(state, common::mock_descriptor()).await;
    let engine = engine_with(50, 2);

    let mut statement = engine
        .submit(&session, "SELECT * FROM numbers", OutputShape::Export)
        .unwrap();
    // Exports always stream; they are never paged
    assert!(statement.paging().is_none());
    let cursor = RowCursor::open(&mut statement).unwrap();
    let (out, rows) = export::export(cursor, ExportFormat::Csv, Vec::new())
        .await
        .unwrap();

    assert_eq!(rows, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "id,label\n0,row-0\n1,needle-1\n2,row-2\n"
    );
    assert!(!session.is_busy());
}

#[tokio::test]
async fn test_export_reports_statement_failure() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    let engine = engine_with(50, 2);

    let mut statement = engine.submit(&session, "FAIL", OutputShape::Export).unwrap();
    let cursor = RowCursor::open(&mut statement).unwrap();
    assert!(
        export::export(cursor, ExportFormat::Json, Vec::new())
            .await
            .is_err()
    );
}
