//! Command dispatcher tests: routing, concurrency and shutdown draining


use async_trait::async_trait;
use device_agent::agent::{
    CommandDescription, CommandDispatcher, CommandHandler, FirmwareUpdateHandler,
    FIRMWARE_UPDATE_METHOD,
};
use device_agent::error::CommandError;
use device_agent::testing::MockTransport;
use device_agent::transport::{CommandInvocation, CommandPayload};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::connected;
use tokio::sync::{mpsc, watch, Notify};

struct CountingHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl CommandHandler for CountingHandler {
    fn describe(&self) -> CommandDescription {
        CommandDescription {
            name: "ping".to_string(),
            description: "Answers immediately".to_string(),
            payload_schema: None,
        }
    }

    async fn handle(&self, _payload: &CommandPayload) -> Result<Value, CommandError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!({"pong": true}))
    }
}

/// Signals when it starts, then waits until released
struct GatedHandler {
    started: Arc<Notify>,
    release: Arc<Notify>,
}

#[async_trait]
impl CommandHandler for GatedHandler {
    fn describe(&self) -> CommandDescription {
        CommandDescription {
            name: "slow".to_string(),
            description: "Blocks until released".to_string(),
            payload_schema: None,
        }
    }

    async fn handle(&self, _payload: &CommandPayload) -> Result<Value, CommandError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(json!({"done": true}))
    }
}

struct Fixture {
    dispatcher: Arc<CommandDispatcher>,
    ping: Arc<CountingHandler>,
    started: Arc<Notify>,
    release: Arc<Notify>,
}

fn fixture(drain_timeout: Duration) -> Fixture {
    let dispatcher = Arc::new(CommandDispatcher::new(drain_timeout));
    let ping = Arc::new(CountingHandler {
        calls: AtomicUsize::new(0),
    });
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    dispatcher.register("ping", ping.clone());
    dispatcher.register(
        "slow",
        Arc::new(GatedHandler {
            started: started.clone(),
            release: release.clone(),
        }),
    );

    Fixture {
        dispatcher,
        ping,
        started,
        release,
    }
}

#[tokio::test]
async fn test_unrecognized_command_invokes_no_handler() {
    let fixture = fixture(Duration::from_secs(1));
    let (invocation, reply) =
        CommandInvocation::new("1", "reboot", CommandPayload::from(json!({"delay": 0})));

    fixture.dispatcher.handle_invocation(invocation).await;

    let response = reply.await.unwrap();
    assert_eq!(response.status, 404);
    assert_eq!(response.body["error"], "unrecognized");
    assert_eq!(fixture.ping.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_slow_handler_does_not_block_others() {
    let fixture = fixture(Duration::from_secs(1));
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(fixture.dispatcher.clone().run(rx, shutdown_rx));

    let (slow, slow_reply) = CommandInvocation::new("1", "slow", CommandPayload::default());
    let (fast, fast_reply) = CommandInvocation::new("2", "ping", CommandPayload::default());
    tx.send(slow).await.unwrap();
    fixture.started.notified().await;
    tx.send(fast).await.unwrap();

    let fast_response = tokio::time::timeout(Duration::from_secs(1), fast_reply)
        .await
        .expect("fast command answered while the slow one is pending")
        .unwrap();
    assert_eq!(fast_response.status, 200);
    assert_eq!(fast_response.body, json!({"pong": true}));

    fixture.release.notify_one();
    let slow_response = slow_reply.await.unwrap();
    assert_eq!(slow_response.status, 200);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_aborts_handlers_after_drain_timeout() {
    let fixture = fixture(Duration::from_millis(100));
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(fixture.dispatcher.clone().run(rx, shutdown_rx));

    let (stuck, stuck_reply) = CommandInvocation::new("1", "slow", CommandPayload::default());
    tx.send(stuck).await.unwrap();
    fixture.started.notified().await;

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("dispatcher stops within the drain timeout")
        .unwrap();

    // The aborted handler never replied
    assert!(stuck_reply.await.is_err());
}

#[tokio::test]
async fn test_shutdown_waits_for_quick_handlers() {
    let fixture = fixture(Duration::from_secs(5));
    let (tx, rx) = mpsc::channel(8);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(fixture.dispatcher.clone().run(rx, shutdown_rx));

    let (slow, slow_reply) = CommandInvocation::new("1", "slow", CommandPayload::default());
    tx.send(slow).await.unwrap();
    fixture.started.notified().await;

    shutdown_tx.send(true).unwrap();
    fixture.release.notify_one();
    handle.await.unwrap();

    assert_eq!(slow_reply.await.unwrap().status, 200);
}

#[tokio::test]
async fn test_closed_queue_stops_dispatcher() {
    let fixture = fixture(Duration::from_secs(1));
    let (tx, rx) = mpsc::channel(8);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(fixture.dispatcher.clone().run(rx, shutdown_rx));

    drop(tx);
    tokio::time::timeout(Duration::from_secs(1), handle)
        .await
        .expect("dispatcher stops when its queue closes")
        .unwrap();
}

#[tokio::test]
async fn test_firmware_update_through_transport() {
    let transport = Arc::new(MockTransport::new());
    let connection = connected(transport.clone()).await;

    let dispatcher = Arc::new(CommandDispatcher::new(Duration::from_secs(1)));
    dispatcher.register(FIRMWARE_UPDATE_METHOD, Arc::new(FirmwareUpdateHandler::new()));

    let (tx, rx) = mpsc::channel(8);
    connection.on_inbound_command(tx);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(dispatcher.run(rx, shutdown_rx));

    let reply = transport
        .invoke_command(
            "42",
            FIRMWARE_UPDATE_METHOD,
            CommandPayload::from(json!({"firmwareUrl": "https://updates.example.com/fw-2.0.bin"})),
        )
        .await
        .expect("sink registered");
    let response = reply.await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["status"], "accepted");
    assert_eq!(
        response.body["firmwareUrl"],
        "https://updates.example.com/fw-2.0.bin"
    );

    let reply = transport
        .invoke_command(
            "43",
            FIRMWARE_UPDATE_METHOD,
            CommandPayload::from(json!({"firmwareUrl": "ftp://updates.example.com/fw.bin"})),
        )
        .await
        .expect("sink registered");
    let response = reply.await.unwrap();
    assert_eq!(response.status, 400);
    assert_eq!(response.body["error"], "invalid_payload");

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();
}
