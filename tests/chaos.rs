//! Failure-scenario tests: flaky links, mid-drain outages, auth expiry.
//!
//! # Test Organization
//! - `failure_*` - Remote service misbehaving in various ways

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;

use common::{test_session, FakeServer};
use medsync::{EntityKind, Mutation, SyncConfig, SyncContext, SyncError, SyncState};

fn fast_config(dir: &TempDir) -> SyncConfig {
    SyncConfig {
        db_path: Some(dir.path().join("medsync.db").to_string_lossy().into_owned()),
        backoff_base_ms: 1,
        backoff_cap_ms: 10,
        debounce_ms: 0,
        pull_after_drain: false,
        ..Default::default()
    }
}

async fn context(dir: &TempDir, server: &Arc<FakeServer>) -> SyncContext {
    let ctx = SyncContext::new(fast_config(dir), server.clone())
        .await
        .expect("context");
    ctx.sign_in(&test_session()).await.expect("sign in");
    ctx
}

#[tokio::test]
async fn failure_flaky_remote_eventually_delivers_everything() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    for i in 0..5 {
        ctx.cache()
            .write(
                EntityKind::Report,
                Mutation::Create { payload: json!({"n": i}) },
            )
            .await
            .unwrap();
    }

    // Transient failures injected into the first drains (staying under the
    // per-item retry budget so nothing gets abandoned)
    for round in 0..10 {
        if round < 2 {
            server.fail_transient(1);
        }
        ctx.sync_now().await.unwrap();
        if ctx.queue().pending_count().await.unwrap() == 0 {
            break;
        }
        tokio::time::sleep(tokio::time::Duration::from_millis(20)).await;
    }

    // Everything made it exactly once, nothing abandoned
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 0);
    assert_eq!(ctx.abandoned_items().await.unwrap().len(), 0);
    assert_eq!(server.record_count(EntityKind::Report), 5);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_connectivity_drop_mid_drain_backs_off_and_resumes() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    for i in 0..5 {
        ctx.cache()
            .write(
                EntityKind::Report,
                Mutation::Create { payload: json!({"n": i}) },
            )
            .await
            .unwrap();
    }

    // The link dies after two successful mutations
    server.go_offline_after(2);
    ctx.sync_now().await.unwrap();

    assert_eq!(server.record_count(EntityKind::Report), 2);
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 3);

    // No attempts were burned on the outage
    let items = ctx.queue().load_all().await.unwrap();
    assert!(items
        .iter()
        .filter(|i| !i.status.is_terminal())
        .all(|i| i.attempts == 0));

    // Back online: the rest goes through
    server.set_offline(false);
    ctx.sync_now().await.unwrap();
    assert_eq!(server.record_count(EntityKind::Report), 5);
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_auth_expiry_mid_drain_recovers_via_refresh() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    for i in 0..3 {
        ctx.cache()
            .write(
                EntityKind::Report,
                Mutation::Create { payload: json!({"n": i}) },
            )
            .await
            .unwrap();
    }
    server.reject_auth(true, true);

    ctx.sync_now().await.unwrap();

    // One refresh, then the whole batch went through
    assert_eq!(server.refresh_calls(), 1);
    assert_eq!(server.record_count(EntityKind::Report), 3);
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 0);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_revoked_refresh_token_blocks_drain_without_data_loss() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    for i in 0..3 {
        ctx.cache()
            .write(
                EntityKind::Report,
                Mutation::Create { payload: json!({"n": i}) },
            )
            .await
            .unwrap();
    }
    server.reject_auth(true, false);

    let result = ctx.sync_now().await;
    assert!(matches!(result, Err(SyncError::AuthExpired)));

    // Queue untouched: still three pending items with zero attempts
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 3);
    let items = ctx.queue().load_all().await.unwrap();
    assert!(items.iter().all(|i| i.attempts == 0));
    assert!(ctx.status_receiver().borrow().last_error.is_some());

    // User signs in again (fresh tokens server-side): everything drains
    server.reject_auth(false, true);
    ctx.sign_in(&test_session()).await.unwrap();
    ctx.sync_now().await.unwrap();
    assert_eq!(server.record_count(EntityKind::Report), 3);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_delete_of_missing_record_abandons_item() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    // A record the server already lost
    server.seed(EntityKind::Report, "rep-1", json!({"v": 1}), 1);
    ctx.cache()
        .refresh_from_remote(
            EntityKind::Report,
            &[medsync::RemoteRecord { id: "rep-1".into(), payload: json!({"v": 1}), updated_at: 1 }],
        )
        .await
        .unwrap();
    server.set_offline(false);
    // Server loses the record behind our back
    {
        use medsync::RemoteService;
        server.delete_record(EntityKind::Report, "rep-1").await.unwrap();
    }

    ctx.cache()
        .write(EntityKind::Report, Mutation::Delete { id: "rep-1".into() })
        .await
        .unwrap();

    let report = ctx.sync_now().await.unwrap();

    // Classified permanent: abandoned on the first attempt
    assert_eq!(report.abandoned, 1);
    let abandoned = ctx.abandoned_items().await.unwrap();
    assert_eq!(abandoned.len(), 1);
    assert_eq!(abandoned[0].attempts, 1);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_backoff_phase_visible_while_offline() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();
    let ctx = context(&dir, &server).await;

    ctx.cache()
        .write(EntityKind::Report, Mutation::Create { payload: json!({}) })
        .await
        .unwrap();
    server.set_offline(true);

    ctx.sync_now().await.unwrap();

    // Parked until connectivity returns; entity still cached and pending
    let status = ctx.status_receiver().borrow().clone();
    assert_eq!(status.pending, 1);
    assert!(status.last_error.is_some());

    let reports = ctx.cache().read(EntityKind::Report).await.unwrap();
    assert_eq!(reports[0].sync_state, SyncState::PendingCreate);
    ctx.shutdown().await;
}

#[tokio::test]
async fn failure_interrupted_drain_recovers_on_restart() {
    let dir = tempfile::tempdir().unwrap();
    let server = FakeServer::new();

    {
        let ctx = context(&dir, &server).await;
        for i in 0..3 {
            ctx.cache()
                .write(
                    EntityKind::Report,
                    Mutation::Create { payload: json!({"n": i}) },
                )
                .await
                .unwrap();
        }
        // Drain dies mid-way with most of the queue undelivered
        server.go_offline_after(1);
        ctx.sync_now().await.unwrap();
        // Simulated crash: no shutdown, no further drain
    }

    // Restart: startup recovery runs and the remaining work is deliverable
    server.set_offline(false);
    let ctx = context(&dir, &server).await;
    ctx.sync_now().await.unwrap();

    assert_eq!(server.record_count(EntityKind::Report), 3);
    assert_eq!(ctx.queue().pending_count().await.unwrap(), 0);
    ctx.shutdown().await;
}
