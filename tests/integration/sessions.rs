//! Session lifecycle against the scripted backend

use crate::common::{self, MockState};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use vizdb::VizdbError;
use vizdb::error::TunnelFailure;
use vizdb::config::TunnelAuth;
use vizdb::db::BackendKind;
use vizdb::engine::{EngineOptions, OutputShape, QueryEngine, StatementStatus};
use vizdb::workers::WorkerPool;

#[tokio::test]
async fn test_tunnel_closes_after_connection() {
    let state = Arc::new(MockState::new(0));
    let (manager, tunnels) = common::manager(state.clone(), common::mock_descriptor());

    let session = manager
        .resolve(&common::tunneled_profile())
        .await
        .expect("session");
    assert_eq!(tunnels.opened.load(Ordering::SeqCst), 1);
    assert_eq!(session.tunnel_port(), Some(40022));

    manager.close(&session).await;
    manager.close(&session).await;

    let journal = state.journal.lock().clone();
    assert_eq!(
        journal,
        vec![
            "tunnel.open db.internal:5432".to_string(),
            "connection.close".to_string(),
            "tunnel.close".to_string(),
        ]
    );
    assert_eq!(state.closes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_closed_session_rejects_statements() {
    let state = Arc::new(MockState::new(10));
    let (manager, _) = common::manager(state, common::mock_descriptor());
    let session = manager.resolve(&common::test_profile()).await.unwrap();
    manager.close(&session).await;

    let engine = QueryEngine::new(WorkerPool::new(2), EngineOptions::default());
    let result = engine.submit(&session, "SELECT * FROM numbers", OutputShape::Interactive);
    assert!(matches!(result, Err(VizdbError::SessionInvalid(_))));
}

#[tokio::test]
async fn test_password_tunnel_without_secret_is_rejected() {
    let state = Arc::new(MockState::new(0));
    let (manager, tunnels) = common::manager(state.clone(), common::mock_descriptor());
    let mut profile = common::tunneled_profile();
    if let Some(tunnel) = profile.tunnel.as_mut() {
        tunnel.auth = TunnelAuth::Password;
    }

    match manager.resolve(&profile).await {
        Err(VizdbError::Tunnel(e)) => assert_eq!(e.kind, TunnelFailure::AuthFailed),
        other => panic!("expected tunnel auth failure, got {:?}", other.map(|s| s.id())),
    }
    assert_eq!(tunnels.opened.load(Ordering::SeqCst), 0);
    assert_eq!(state.closes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_unknown_kind_is_reported() {
    let state = Arc::new(MockState::new(0));
    let (manager, _) = common::manager(state, common::mock_descriptor());
    let mut profile = common::test_profile();
    profile.kind = BackendKind::Clickhouse;

    assert!(matches!(
        manager.resolve(&profile).await,
        Err(VizdbError::UnknownProvider(_))
    ));
}

#[tokio::test]
async fn test_lost_connectivity_invalidates_session() {
    let state = Arc::new(MockState::new(10));
    let session = common::session(state, common::mock_descriptor()).await;
    let engine = QueryEngine::new(WorkerPool::new(2), EngineOptions::default());

    let statement = engine
        .submit(&session, "LOSE", OutputShape::Export)
        .unwrap();
    match statement.wait().await {
        StatementStatus::Failed(e) => assert!(e.is_connectivity_lost()),
        other => panic!("expected failure, got {:?}", other),
    }
    assert!(!session.is_usable());
    assert!(matches!(
        engine.submit(&session, "SELECT 1", OutputShape::Export),
        Err(VizdbError::SessionInvalid(_))
    ));
}

#[tokio::test]
async fn test_connect_runs_on_worker_pool() {
    let state = Arc::new(MockState::new(0));
    let pool = WorkerPool::new(1);
    let (manager, _) = common::manager(state, common::mock_descriptor());
    let manager = Arc::new(manager.with_pool(pool.clone()));

    let (release, hold) = tokio::sync::oneshot::channel::<()>();
    let blocker = pool.spawn(async move {
        let _ = hold.await;
    });
    common::wait_until(|| pool.busy() == 1).await;

    let resolving = tokio::spawn({
        let manager = manager.clone();
        async move { manager.resolve(&common::test_profile()).await }
    });
    tokio::time::sleep(std::time::Duration::from_millis(30)).await;
    // Queued behind the busy worker, not connecting on the caller's task
    assert!(!resolving.is_finished());

    release.send(()).unwrap();
    blocker.await.unwrap();
    let session = resolving.await.unwrap().expect("session");
    assert!(session.is_usable());
}
