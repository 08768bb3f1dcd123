//! Integration tests against a live PostgreSQL server
//!
//! Each test skips itself when the server is not reachable. Start one with:
//! docker run --rm -p 5433:5432 -e POSTGRES_USER=test_user \
//!   -e POSTGRES_PASSWORD=test_password -e POSTGRES_DB=test_db postgres:16

use std::sync::Arc;
use std::time::{Duration, Instant};
use vizdb::config::{ConnectionProfile, Endpoint};
use vizdb::credentials::{CredentialStore, Secret};
use vizdb::db::{BackendKind, CellValue, ProviderRegistry};
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine, StatementStatus};
use vizdb::error::StatementError;
use vizdb::results::{ResultSet, VirtualizerOptions};
use vizdb::schema_index::{LookupContext, SchemaIndexer};
use vizdb::session::{ConnectionManager, Session};
use vizdb::workers::WorkerPool;

/// Profile for the test server, from TEST_DB_* variables
fn test_profile() -> ConnectionProfile {
    let mut profile = ConnectionProfile::new(
        "integration-test",
        BackendKind::Postgresql,
        Endpoint::Tcp {
            host: std::env::var("TEST_DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: std::env::var("TEST_DB_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5433),
        },
    );
    profile.database =
        Some(std::env::var("TEST_DB_NAME").unwrap_or_else(|_| "test_db".to_string()));
    profile.username =
        Some(std::env::var("TEST_DB_USER").unwrap_or_else(|_| "test_user".to_string()));
    profile
        .options
        .insert("sslmode".to_string(), "disable".to_string());
    profile
}

fn test_password() -> Secret {
    Secret::new(std::env::var("TEST_DB_PASSWORD").unwrap_or_else(|_| "test_password".to_string()))
}

async fn connect() -> Option<Arc<Session>> {
    let manager = ConnectionManager::new(
        Arc::new(ProviderRegistry::with_defaults()),
        Arc::new(CredentialStore::in_memory()),
        vizdb::tunnel::default_manager(),
    )
    .with_connect_timeout(Duration::from_secs(3));
    match manager
        .resolve_with_secret(&test_profile(), Some(test_password()))
        .await
    {
        Ok(session) => Some(session),
        Err(e) => {
            eprintln!("Skipping test: Database not available - {}", e);
            None
        }
    }
}

fn engine(page_size: usize) -> QueryEngine {
    QueryEngine::new(
        WorkerPool::new(2),
        EngineOptions {
            page_size,
            ..EngineOptions::default()
        },
    )
}

#[tokio::test]
async fn test_execute_simple_query() {
    let Some(session) = connect().await else {
        return;
    };
    let mut statement = engine(500)
        .submit(
            &session,
            "SELECT 1 AS num, 'hello' AS msg, true AS flag, '{\"role\":\"admin\"}'::jsonb AS meta",
            OutputShape::Interactive,
        )
        .unwrap();
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();
    let window = results.window(0, 10).await;

    let names: Vec<&str> = window.columns.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["num", "msg", "flag", "meta"]);
    assert_eq!(window.rows.len(), 1);
    let row = &window.rows[0];
    assert_eq!(row.values[0], CellValue::Integer(1));
    assert_eq!(row.values[1], CellValue::Text("hello".into()));
    assert_eq!(row.values[2], CellValue::Boolean(true));
    match &row.values[3] {
        CellValue::Json(v) => assert_eq!(v.get("role").and_then(|r| r.as_str()), Some("admin")),
        other => panic!("Expected Json for meta, got {:?}", other),
    }
    session.close().await;
}

#[tokio::test]
async fn test_paged_browse_over_series() {
    let Some(session) = connect().await else {
        return;
    };
    let mut statement = engine(50)
        .submit(
            &session,
            "SELECT n FROM generate_series(1, 120) AS n ORDER BY n",
            OutputShape::Interactive,
        )
        .unwrap();
    assert!(statement.paging().is_some());
    let results = ResultSet::open(&mut statement, VirtualizerOptions::default()).unwrap();

    let second = results.window(50, 50).await;
    let values: Vec<i64> = second
        .rows
        .iter()
        .map(|r| match r.values[0] {
            CellValue::Integer(i) => i,
            ref other => panic!("Expected Integer, got {:?}", other),
        })
        .collect();
    assert_eq!(values, (51..=100).collect::<Vec<_>>());

    let tail = results.window(100, 50).await;
    assert_eq!(tail.rows.len(), 20);
    assert!(tail.exhausted);
    session.close().await;
}

#[tokio::test]
async fn test_cancel_long_running_query() {
    let Some(session) = connect().await else {
        return;
    };
    let engine = engine(500);
    let statement = engine
        .submit(&session, "SELECT pg_sleep(30)", OutputShape::Export)
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let started = Instant::now();
    let outcome = engine.cancel(&statement).await;
    assert!(outcome.backend_cancel);
    assert_eq!(statement.wait().await, StatementStatus::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(10));

    // The session is usable again afterwards
    let next = engine
        .submit(&session, "SELECT 1", OutputShape::Export)
        .unwrap();
    assert!(matches!(next.wait().await, StatementStatus::Succeeded(_)));
    session.close().await;
}

#[tokio::test]
async fn test_syntax_error_is_normalized() {
    let Some(session) = connect().await else {
        return;
    };
    let statement = engine(500)
        .submit(&session, "SELEC 1", OutputShape::Export)
        .unwrap();
    match statement.wait().await {
        StatementStatus::Failed(StatementError::Syntax(_)) => {}
        other => panic!("Expected syntax error, got {:?}", other),
    }
    assert!(session.is_usable());
    session.close().await;
}

#[tokio::test]
async fn test_introspection_after_ddl() {
    let Some(session) = connect().await else {
        return;
    };
    let engine = engine(500);
    let ddl = engine
        .submit(
            &session,
            "DROP SCHEMA IF EXISTS vizdb_it CASCADE;
             CREATE SCHEMA vizdb_it;
             CREATE TABLE vizdb_it.orders (id serial PRIMARY KEY, total numeric, placed_at timestamptz);",
            OutputShape::Export,
        )
        .unwrap();
    let change = match ddl.wait().await {
        StatementStatus::Succeeded(summary) => summary.schema_change,
        other => panic!("DDL failed: {:?}", other),
    };

    let indexer = SchemaIndexer::new(WorkerPool::new(2));
    let index = indexer.apply(&session, &change).await.unwrap();
    let columns: Vec<&str> = index
        .columns("vizdb_it", "orders")
        .unwrap_or_default()
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(columns, vec!["id", "total", "placed_at"]);
    let found = indexer.lookup("", &LookupContext::Qualified("vizdb_it".into()));
    assert!(found.iter().any(|c| c.name == "orders"));

    let cleanup = engine
        .submit(&session, "DROP SCHEMA vizdb_it CASCADE", OutputShape::Export)
        .unwrap();
    cleanup.wait().await;
    session.close().await;
}
