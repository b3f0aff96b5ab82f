//! Twin reconciler tests against the mock hub's versioned twin


use device_agent::agent::{BackoffPolicy, Clock, ReconcilerPhase, TwinReconciler};
use device_agent::error::TwinError;
use device_agent::testing::{ManualClock, MockTransport};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::connected;

fn reconciler(clock: Arc<ManualClock>) -> TwinReconciler {
    TwinReconciler::new(
        BackoffPolicy::new(3, Duration::from_millis(10), Duration::from_millis(80)),
        clock,
    )
}

#[tokio::test]
async fn test_later_status_wins() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;
    let clock = Arc::new(ManualClock::default());
    let reconciler = reconciler(clock.clone());

    reconciler.sync_status(&connection, "connected").await.unwrap();
    clock.advance(chrono::Duration::seconds(5));
    reconciler.sync_status(&connection, "normal").await.unwrap();

    let expected_updated = clock.now().timestamp_millis();
    let remote = transport.remote_twin().await;
    assert_eq!(remote.reported["status"], "normal");
    assert_eq!(remote.reported["statusUpdated"], expected_updated);

    let state = reconciler.state().await;
    assert_eq!(state.reported.status.as_deref(), Some("normal"));
    assert_eq!(state.reported.status_updated, Some(expected_updated));
    assert_eq!(state.version, 2);
    assert_eq!(state.last_synced_at, Some(clock.now()));
}

#[tokio::test]
async fn test_conflict_is_retried_with_fresh_snapshot() {
    let transport = Arc::new(MockTransport::new());
    transport.conflict_after_fetches(1).await;
    let connection = connected(transport.clone()).await;
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    reconciler.sync_status(&connection, "connected").await.unwrap();

    assert_eq!(transport.twin_fetches(), 2);
    assert_eq!(transport.patch_attempts(), 2);
    let accepted = transport.accepted_patches().await;
    assert_eq!(accepted.len(), 1);
    assert_eq!(accepted[0].base_version, 1);
    assert_eq!(reconciler.phase(), ReconcilerPhase::Idle);
}

#[tokio::test]
async fn test_patch_failure_refetches_before_retrying() {
    let transport = Arc::new(MockTransport::new());
    transport
        .fail_next_patch(TwinError::PatchFailure("status 500".to_string()))
        .await;
    let connection = connected(transport.clone()).await;
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    reconciler.sync_status(&connection, "connected").await.unwrap();

    assert_eq!(transport.twin_fetches(), 2);
    assert_eq!(transport.patch_attempts(), 2);
    assert_eq!(transport.accepted_patches().await.len(), 1);
}

#[tokio::test]
async fn test_fetch_failures_exhaust_the_retry_budget() {
    let transport = Arc::new(MockTransport::new());
    for _ in 0..3 {
        transport
            .fail_next_fetch(TwinError::FetchFailure("status 503".to_string()))
            .await;
    }
    let connection = connected(transport.clone()).await;
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    let result = reconciler.sync_status(&connection, "connected").await;

    assert!(matches!(result, Err(TwinError::FetchFailure(_))));
    assert_eq!(transport.twin_fetches(), 3);
    assert_eq!(transport.patch_attempts(), 0);
    assert_eq!(reconciler.phase(), ReconcilerPhase::Idle);
    assert_eq!(reconciler.state().await.last_synced_at, None);
}

#[tokio::test]
async fn test_not_connected_is_not_retried() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;
    transport.drop_link("keep-alive timeout");
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    let result = reconciler.sync_status(&connection, "connected").await;

    assert_eq!(result, Err(TwinError::NotConnected));
    assert_eq!(transport.twin_fetches(), 1);
    assert_eq!(reconciler.phase(), ReconcilerPhase::Idle);
}

#[tokio::test]
async fn test_local_state_seeded_from_remote_twin() {
    let transport = Arc::new(MockTransport::new());
    transport
        .set_remote_reported(
            json!({"status": "maintenance", "firmwareVersion": "1.0.0"})
                .as_object()
                .cloned()
                .unwrap(),
            7,
        )
        .await;
    let connection = connected(transport.clone()).await;
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    reconciler.sync_status(&connection, "connected").await.unwrap();

    let accepted = transport.accepted_patches().await;
    assert_eq!(accepted[0].base_version, 7);
    assert!(!accepted[0].properties.contains_key("firmwareVersion"));

    let remote = transport.remote_twin().await;
    assert_eq!(remote.reported["status"], "connected");
    assert_eq!(remote.reported["firmwareVersion"], "1.0.0");
    assert_eq!(reconciler.state().await.version, 8);
}

#[tokio::test]
async fn test_concurrent_syncs_are_serialized() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;
    let reconciler = reconciler(Arc::new(ManualClock::default()));

    let (first, second) = tokio::join!(
        reconciler.sync_status(&connection, "connected"),
        reconciler.sync_status(&connection, "normal"),
    );
    first.unwrap();
    second.unwrap();

    // Serialized syncs never race each other into a conflict
    assert_eq!(transport.patch_attempts(), 2);
    assert_eq!(transport.accepted_patches().await.len(), 2);
    assert_eq!(reconciler.state().await.version, 2);
}
