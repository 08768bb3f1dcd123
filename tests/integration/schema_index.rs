//! Schema indexing and completion lookup over the scripted backend

use crate::common::{self, MockState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use vizdb::VizdbError;
use vizdb::db::schema::Schema;
use vizdb::engine::SchemaChange;
use vizdb::schema_index::{CandidateKind, LookupContext, SchemaIndexer, context_at};
use vizdb::workers::WorkerPool;

fn names(candidates: &[vizdb::schema_index::Candidate]) -> Vec<&str> {
    candidates.iter().map(|c| c.name.as_str()).collect()
}

#[tokio::test]
async fn test_relation_lookup_after_from() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    let indexer = SchemaIndexer::new(WorkerPool::new(2));
    indexer.refresh(&session).await.unwrap();

    let (context, word) = context_at("SELECT * FROM user", 18);
    assert_eq!(context, LookupContext::Relations);
    assert_eq!(word, "user");

    let found = indexer.lookup(&word, &context);
    assert_eq!(names(&found), vec!["users", "user_roles"]);
    assert!(found.iter().all(|c| c.kind == CandidateKind::Table));
}

#[tokio::test]
async fn test_qualified_lookup_lists_table_columns() {
    let state = Arc::new(MockState::new(0));
    let session = common::session(state, common::mock_descriptor()).await;
    let indexer = SchemaIndexer::new(WorkerPool::new(2));
    indexer.refresh(&session).await.unwrap();

    let line = "SELECT users.";
    let (context, word) = context_at(line, line.len());
    assert_eq!(context, LookupContext::Qualified("users".into()));

    let found = indexer.lookup(&word, &context);
    let mut got = names(&found);
    got.sort();
    assert_eq!(got, vec!["email", "id", "name"]);
    assert!(
        found
            .iter()
            .all(|c| c.kind == CandidateKind::Column && c.table.as_deref() == Some("users"))
    );
}

#[tokio::test]
async fn test_rebuild_does_not_block_lookups() {
    let gate = Arc::new(Semaphore::new(1));
    let state = Arc::new(MockState {
        introspect_gate: Some(gate.clone()),
        ..MockState::new(0)
    });
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let indexer = Arc::new(SchemaIndexer::new(WorkerPool::new(2)));
    indexer.refresh(&session).await.unwrap();

    // Close the gate so the next introspection hangs
    gate.acquire().await.unwrap().forget();
    state.schema.lock().schemas[0]
        .tables
        .push(common::table("orders", &["id", "total"]));

    let rebuild = {
        let indexer = indexer.clone();
        let session = session.clone();
        tokio::spawn(async move { indexer.refresh(&session).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!rebuild.is_finished());

    // The old snapshot keeps answering
    assert!(indexer.lookup("ord", &LookupContext::Relations).is_empty());
    assert!(!indexer.lookup("users", &LookupContext::Relations).is_empty());

    gate.add_permits(1);
    rebuild.await.unwrap().unwrap();
    assert_eq!(
        names(&indexer.lookup("orders", &LookupContext::Relations)),
        vec!["orders"]
    );
}

#[tokio::test]
async fn test_schema_change_merges_and_removes() {
    let state = Arc::new(MockState::new(0));
    {
        let mut reports = Schema::named("reports");
        reports.tables = vec![common::table("daily", &["day", "total"])];
        state.schema.lock().schemas.push(reports);
    }
    let session = common::session(state.clone(), common::mock_descriptor()).await;
    let indexer = SchemaIndexer::new(WorkerPool::new(2));
    indexer.refresh(&session).await.unwrap();
    assert!(indexer.snapshot().columns("reports", "daily").is_some());

    // DDL dropped the schema and added a table to public
    {
        let mut tree = state.schema.lock();
        tree.schemas.retain(|s| s.name != "reports");
        tree.schemas[0]
            .tables
            .push(common::table("invoices", &["id"]));
    }
    let change = SchemaChange::Schemas(vec!["reports".into(), "public".into()]);
    let index = indexer.apply(&session, &change).await.unwrap();

    assert!(index.columns("reports", "daily").is_none());
    assert!(index.columns("public", "invoices").is_some());
    assert!(index.columns("PUBLIC", "Users").is_some());
    assert!(Arc::ptr_eq(&index, &indexer.snapshot()));
}

#[tokio::test]
async fn test_introspection_timeout_keeps_old_snapshot() {
    let gate = Arc::new(Semaphore::new(0));
    let state = Arc::new(MockState {
        introspect_gate: Some(gate),
        ..MockState::new(0)
    });
    let session = common::session(state, common::mock_descriptor()).await;
    let indexer = SchemaIndexer::new(WorkerPool::new(2)).with_timeout(Duration::from_millis(50));

    match indexer.refresh(&session).await {
        Err(VizdbError::Timeout { operation, .. }) => assert_eq!(operation, "introspect"),
        other => panic!("expected timeout, got {:?}", other.map(|i| i.len())),
    }
    assert!(indexer.snapshot().is_empty());
    assert!(session.is_usable());
}
