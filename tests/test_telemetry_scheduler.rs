//! Telemetry scheduler tests against the mock hub
//!
//! Time is paused in the loop tests so intervals and send delays are exact.


use device_agent::agent::{OfflinePolicy, TelemetryScheduler, TickOutcome};
use device_agent::error::SendError;
use device_agent::testing::{ManualClock, MockTransport, ScriptedRandom};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{connected, test_connection};
use tokio::sync::watch;

fn scheduler_with(
    connection: Arc<device_agent::agent::Connection<MockTransport>>,
    readings: Vec<f64>,
    policy: OfflinePolicy,
) -> TelemetryScheduler<MockTransport> {
    TelemetryScheduler::new(
        connection,
        "simulatedNodeDevice",
        Duration::from_secs(1),
        Box::new(ScriptedRandom::new(readings)),
        Arc::new(ManualClock::default()),
        policy,
    )
}

fn temperatures(messages: &[device_agent::transport::TelemetryMessage]) -> Vec<f64> {
    messages
        .iter()
        .map(|m| {
            let body: Value = serde_json::from_slice(&m.body).unwrap();
            body["temperature"].as_f64().unwrap()
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_does_not_stop_the_loop() {
    let transport = Arc::new(MockTransport::new());
    transport
        .fail_send_at(2, SendError::Rejected("quota exceeded".to_string()))
        .await;
    let connection = connected(transport.clone()).await;
    let scheduler = scheduler_with(connection, vec![25.0, 70.0], OfflinePolicy::Drop);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::time::sleep(Duration::from_millis(5_500)).await;
    shutdown_tx.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert_eq!(stats.attempts, 5);
    assert_eq!(stats.acked, 4);
    assert_eq!(stats.failed, 1);
    assert_eq!(transport.sent_messages().await.len(), 4);
}

#[tokio::test]
async fn test_hot_reading_carries_alert_property() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;
    let mut scheduler = scheduler_with(
        connection,
        vec![32.0, 65.0, 25.0, 70.0],
        OfflinePolicy::Drop,
    );

    assert_eq!(scheduler.tick().await, TickOutcome::Acked { message_id: 1 });
    assert_eq!(scheduler.tick().await, TickOutcome::Acked { message_id: 2 });

    let sent = transport.sent_messages().await;
    assert_eq!(
        sent[0].body_str(),
        r#"{"deviceId":"simulatedNodeDevice","temperature":32.0,"humidity":65.0}"#
    );
    assert_eq!(sent[0].property("temperatureAlert"), Some("true"));
    assert_eq!(sent[1].property("temperatureAlert"), Some("false"));
}

#[tokio::test(start_paused = true)]
async fn test_ticks_never_overlap_a_slow_send() {
    let transport = Arc::new(MockTransport::new());
    transport.set_send_delay(Duration::from_millis(2_500)).await;
    let connection = connected(transport.clone()).await;
    let scheduler = scheduler_with(connection, vec![25.0, 70.0], OfflinePolicy::Drop);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    // Sends start at 1.0s and 3.5s; with overlapping ticks there would be five
    tokio::time::sleep(Duration::from_millis(5_900)).await;
    assert_eq!(transport.send_attempts(), 2);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_send_timeout_counts_as_failure() {
    let transport = Arc::new(MockTransport::new());
    transport.set_send_delay(Duration::from_secs(30)).await;
    let connection = connected(transport.clone()).await;
    let mut scheduler = scheduler_with(
        connection,
        vec![25.0, 70.0],
        OfflinePolicy::Buffer { capacity: 10 },
    );

    let outcome = scheduler.tick().await;
    assert_eq!(outcome, TickOutcome::Failed(SendError::Timeout(Duration::from_secs(5))));
    assert_eq!(scheduler.stats().failed, 1);
    // Only disconnection feeds the offline buffer
    assert_eq!(scheduler.backlog_len(), 0);
}

#[tokio::test]
async fn test_buffered_samples_flush_in_order_after_reconnect() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;
    let mut scheduler = scheduler_with(
        connection.clone(),
        vec![21.0, 61.0, 22.0, 62.0, 23.0, 63.0, 24.0, 64.0],
        OfflinePolicy::Buffer { capacity: 10 },
    );

    assert!(matches!(scheduler.tick().await, TickOutcome::Acked { .. }));

    transport.drop_link("network unplugged");
    assert_eq!(scheduler.tick().await, TickOutcome::Buffered);

    connection.mark_dropped("network unplugged");
    assert_eq!(scheduler.tick().await, TickOutcome::Buffered);
    assert_eq!(scheduler.backlog_len(), 2);

    connection.connect().await.unwrap();
    assert!(matches!(scheduler.tick().await, TickOutcome::Acked { .. }));

    let sent = transport.sent_messages().await;
    assert_eq!(temperatures(&sent), vec![21.0, 22.0, 23.0, 24.0]);
    assert_eq!(scheduler.backlog_len(), 0);
    assert_eq!(scheduler.stats().buffered, 2);
}

#[tokio::test]
async fn test_never_connected_drop_policy_sends_nothing() {
    let transport = Arc::new(MockTransport::new());
    let connection = test_connection(transport.clone());
    let mut scheduler = scheduler_with(connection, vec![25.0, 70.0], OfflinePolicy::Drop);

    assert_eq!(scheduler.tick().await, TickOutcome::Dropped);
    assert_eq!(scheduler.tick().await, TickOutcome::Dropped);

    assert_eq!(transport.send_attempts(), 0);
    assert_eq!(scheduler.stats().dropped, 2);
}

#[tokio::test(start_paused = true)]
async fn test_stats_observable_while_running() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport).await;
    let scheduler = scheduler_with(connection, vec![25.0, 70.0], OfflinePolicy::Drop);
    let mut stats = scheduler.watch_stats();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(shutdown_rx));

    stats.changed().await.unwrap();
    assert_eq!(stats.borrow().acked, 1);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
