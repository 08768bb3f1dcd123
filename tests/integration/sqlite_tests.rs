//! End-to-end against a real SQLite file: connect, run a script, browse,
//! export and index

use std::sync::Arc;
use vizdb::config::ConnectionProfile;
use vizdb::credentials::CredentialStore;
use vizdb::db::{BackendKind, CellValue, ProviderRegistry};
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine, SchemaChange, StatementStatus};
use vizdb::export::{self, ExportFormat};
use vizdb::results::{ResultSet, RowCursor, VirtualizerOptions};
use vizdb::schema_index::{LookupContext, SchemaIndexer};
use vizdb::session::ConnectionManager;
use vizdb::workers::WorkerPool;

fn manager() -> ConnectionManager {
    ConnectionManager::new(
        Arc::new(ProviderRegistry::with_defaults()),
        Arc::new(CredentialStore::in_memory()),
        vizdb::tunnel::default_manager(),
    )
}

#[tokio::test]
async fn test_sqlite_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let profile = ConnectionProfile::file("local", BackendKind::Sqlite, dir.path().join("app.db"));
    let manager = manager();
    let session = tokio_test::assert_ok!(manager.resolve(&profile).await);

    let pool = WorkerPool::new(2);
    let engine = QueryEngine::new(
        pool.clone(),
        EngineOptions {
            page_size: 2,
            ..EngineOptions::default()
        },
    );

    let setup = engine
        .submit(
            &session,
            "CREATE TABLE items (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
             INSERT INTO items (name) VALUES ('bolt'), ('nut'), ('washer');",
            OutputShape::Export,
        )
        .unwrap();
    let summary = match setup.wait().await {
        StatementStatus::Succeeded(summary) => summary,
        other => panic!("setup failed: {:?}", other),
    };
    assert_eq!(summary.statements, 2);
    assert_eq!(summary.rows_affected, Some(3));
    assert_eq!(
        summary.schema_change,
        SchemaChange::Schemas(vec!["main".to_string()])
    );

    // Paged browse: page 0 from the statement, page 1 re-queried
    let mut browse = engine
        .submit(&session, "SELECT id, name FROM items ORDER BY id", OutputShape::Interactive)
        .unwrap();
    assert!(browse.paging().is_some());
    let results = ResultSet::open(&mut browse, VirtualizerOptions::default()).unwrap();
    let first = results.window(0, 2).await;
    let second = results.window(2, 2).await;
    assert_eq!(first.rows.len(), 2);
    assert_eq!(second.rows.len(), 1);
    assert_eq!(second.rows[0].values[1], CellValue::Text("washer".into()));
    assert!(second.exhausted);
    assert_eq!(second.total_known, 3);

    let mut dump = engine
        .submit(&session, "SELECT name FROM items ORDER BY id", OutputShape::Export)
        .unwrap();
    let cursor = RowCursor::open(&mut dump).unwrap();
    let (out, rows) = export::export(cursor, ExportFormat::JsonLines, Vec::new())
        .await
        .unwrap();
    assert_eq!(rows, 3);
    assert_eq!(
        String::from_utf8(out).unwrap(),
        "{\"name\":\"bolt\"}\n{\"name\":\"nut\"}\n{\"name\":\"washer\"}\n"
    );

    let indexer = SchemaIndexer::new(pool);
    indexer.apply(&session, &summary.schema_change).await.unwrap();
    let found = indexer.lookup("ite", &LookupContext::Relations);
    assert_eq!(found.first().map(|c| c.name.as_str()), Some("items"));
    let snapshot = indexer.snapshot();
    let columns: Vec<&str> = snapshot
        .columns("main", "items")
        .unwrap_or_default()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(columns, vec!["id", "name"]);

    manager.close(&session).await;
    assert!(!session.is_usable());
}

#[tokio::test]
async fn test_sqlite_missing_directory_fails_to_connect() {
    let dir = tempfile::tempdir().unwrap();
    let profile = ConnectionProfile::file(
        "broken",
        BackendKind::Sqlite,
        dir.path().join("missing").join("app.db"),
    );
    tokio_test::assert_err!(manager().resolve(&profile).await);
}

#[tokio::test]
async fn test_sqlite_commented_select_is_paged() {
    let dir = tempfile::tempdir().unwrap();
    let profile = ConnectionProfile::file("local", BackendKind::Sqlite, dir.path().join("c.db"));
    let session = manager().resolve(&profile).await.unwrap();
    let engine = QueryEngine::new(WorkerPool::new(2), EngineOptions::default());

    let setup = engine
        .submit(
            &session,
            "CREATE TABLE t (a INTEGER); INSERT INTO t VALUES (1), (2), (3);",
            OutputShape::Export,
        )
        .unwrap();
    assert!(matches!(setup.wait().await, StatementStatus::Succeeded(_)));

    let mut browse = engine
        .submit(&session, "SELECT a FROM t -- all rows", OutputShape::Interactive)
        .unwrap();
    assert!(browse.paging().is_some());
    let results = ResultSet::open(&mut browse, VirtualizerOptions::default()).unwrap();
    let window = results.window(0, 10).await;
    assert!(window.error.is_none(), "{:?}", window.error);
    assert_eq!(window.rows.len(), 3);
    assert!(matches!(browse.wait().await, StatementStatus::Succeeded(_)));
}

#[tokio::test]
async fn test_sqlite_cancel_with_unread_rows_returns() {
    let dir = tempfile::tempdir().unwrap();
    let profile = ConnectionProfile::file("local", BackendKind::Sqlite, dir.path().join("n.db"));
    let session = manager().resolve(&profile).await.unwrap();
    let engine = QueryEngine::new(WorkerPool::new(2), EngineOptions::default());

    // Nobody reads the rows, so the driver blocks on a full channel
    let statement = engine
        .submit(
            &session,
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < 100000)
             SELECT i FROM n",
            OutputShape::Export,
        )
        .unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    engine.cancel(&statement).await;

    let status = tokio::time::timeout(std::time::Duration::from_secs(3), statement.wait())
        .await
        .expect("statement did not return after cancel");
    assert_eq!(status, StatementStatus::Cancelled);
    assert!(!session.is_busy());
}
