//! Impure I/O operations for the hub MQTT client
//!
//! This module owns the rumqttc client and event loop: it completes the
//! handshake, correlates PUBACKs and `$rid` replies with waiting callers,
//! forwards direct method requests to the registered sink, and publishes
//! their replies. Reconnection policy is not handled here; when the event
//! loop fails the link is reported down and the supervisor decides.

use super::connection::{classify_connection_error, configure_mqtt_options, TopicBuilder};
use super::message_handler::{EventRoute, MessageHandler};
use crate::error::{ConnectError, SendError, TwinError};
use crate::observability::metrics::metrics;
use crate::transport::{
    Ack, CommandInvocation, CommandPayload, CommandResponse, Credential, DeviceIdentity,
    LinkState, ReportedPatch, TelemetryMessage, Transport, TwinDocument,
};
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, Packet, QoS};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Reply to a `$rid` correlated twin request
#[derive(Debug)]
struct TwinReply {
    status: u16,
    version: Option<u64>,
    payload: Bytes,
}

/// QoS 1 sends waiting for their PUBACK
///
/// Packet ids are only known once rumqttc emits `Outgoing::Publish`, which
/// happens in request order, so senders queue as unassigned and are paired
/// with ids as they go out.
#[derive(Default)]
struct PendingAcks {
    unassigned: VecDeque<oneshot::Sender<Ack>>,
    in_flight: HashMap<u16, oneshot::Sender<Ack>>,
}

impl PendingAcks {
    fn assign(&mut self, packet_id: u16) {
        self.prune_abandoned();
        if let Some(sender) = self.unassigned.pop_front() {
            self.in_flight.insert(packet_id, sender);
        }
    }

    fn complete(&mut self, packet_id: u16) {
        if let Some(sender) = self.in_flight.remove(&packet_id) {
            let _ = sender.send(Ack {
                message_id: u64::from(packet_id),
            });
        }
    }

    /// Drop waiters whose caller gave up, e.g. after a send timeout.
    /// Unassigned waiters stay queued to keep id pairing in order.
    fn prune_abandoned(&mut self) {
        self.in_flight.retain(|_, sender| !sender.is_closed());
    }

    fn fail_all(&mut self) {
        self.unassigned.clear();
        self.in_flight.clear();
    }
}

/// State shared between the client handle and its event loop task
struct Shared {
    client: Mutex<Option<AsyncClient>>,
    device_id: StdMutex<Option<String>>,
    pending_acks: StdMutex<PendingAcks>,
    pending_twin: StdMutex<HashMap<String, oneshot::Sender<TwinReply>>>,
    command_sink: StdMutex<Option<mpsc::Sender<CommandInvocation>>>,
    link_tx: watch::Sender<LinkState>,
}

impl Shared {
    fn fail_pending(&self) {
        if let Ok(mut pending) = self.pending_acks.lock() {
            pending.fail_all();
        }
        if let Ok(mut pending) = self.pending_twin.lock() {
            pending.clear();
        }
    }

    fn set_link(&self, state: LinkState) {
        self.link_tx.send_replace(state);
    }
}

/// Removes an abandoned twin request when the caller stops waiting
struct PendingTwinGuard<'a> {
    pending: &'a StdMutex<HashMap<String, oneshot::Sender<TwinReply>>>,
    request_id: String,
}

impl Drop for PendingTwinGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.remove(&self.request_id);
        }
    }
}

/// Hub transport over MQTT 3.1.1 with X.509 client authentication
pub struct HubMqttClient {
    shared: Arc<Shared>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<watch::Sender<bool>>>,
}

impl HubMqttClient {
    pub fn new() -> Self {
        let (link_tx, _) = watch::channel(LinkState::Down("never connected".to_string()));
        Self {
            shared: Arc::new(Shared {
                client: Mutex::new(None),
                device_id: StdMutex::new(None),
                pending_acks: StdMutex::new(PendingAcks::default()),
                pending_twin: StdMutex::new(HashMap::new()),
                command_sink: StdMutex::new(None),
                link_tx,
            }),
            event_loop_handle: Mutex::new(None),
            shutdown_tx: Mutex::new(None),
        }
    }

    /// Drive the event loop until the hub answers the CONNECT
    async fn wait_for_connack(event_loop: &mut EventLoop) -> Result<(), ConnectError> {
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    return match ack.code {
                        ConnectReturnCode::Success => Ok(()),
                        code => Err(classify_connection_error(
                            &rumqttc::ConnectionError::ConnectionRefused(code),
                        )),
                    };
                }
                Ok(_) => continue,
                Err(e) => return Err(classify_connection_error(&e)),
            }
        }
    }

    /// Stop a previous event loop, if any
    async fn stop_event_loop(&self) {
        if let Some(shutdown_tx) = self.shutdown_tx.lock().await.take() {
            let _ = shutdown_tx.send(true);
        }

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            match tokio::time::timeout(Duration::from_secs(2), handle).await {
                Ok(Ok(())) => debug!(target: "hub_transport", "Event loop task shut down gracefully"),
                Ok(Err(e)) if !e.is_cancelled() => {
                    warn!("Event loop task ended with error: {}", e)
                }
                Err(_) => warn!("Event loop task didn't shut down gracefully, abandoning it"),
                _ => {}
            }
        }
    }

    fn spawn_event_loop(
        shared: Arc<Shared>,
        mut event_loop: EventLoop,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!(target: "hub_transport", "Shutdown signal received, stopping event loop");
                            break;
                        }
                    }
                    event_result = event_loop.poll() => {
                        match event_result {
                            Ok(event) => {
                                let route = MessageHandler::route_mqtt_event(&event);
                                if !Self::process_event_route(&shared, route).await {
                                    break;
                                }
                            }
                            Err(e) => {
                                error!("Hub event loop error: {}", e);
                                shared.set_link(LinkState::Down(e.to_string()));
                                break;
                            }
                        }
                    }
                }
            }
            shared.fail_pending();
            debug!(target: "hub_transport", "Hub event loop stopped");
        })
    }

    /// Process routed MQTT event. Returns true to continue the loop.
    async fn process_event_route(shared: &Arc<Shared>, route: EventRoute) -> bool {
        match route {
            EventRoute::ConnectionAcknowledged => {
                shared.set_link(LinkState::Up);
                true
            }
            EventRoute::MethodRequest {
                name,
                request_id,
                payload,
            } => {
                Self::forward_method_request(shared, name, request_id, payload);
                true
            }
            EventRoute::TwinResponse {
                status,
                request_id,
                version,
                payload,
            } => {
                let waiter = shared
                    .pending_twin
                    .lock()
                    .ok()
                    .and_then(|mut pending| pending.remove(&request_id));
                match waiter {
                    Some(sender) => {
                        let _ = sender.send(TwinReply {
                            status,
                            version,
                            payload,
                        });
                    }
                    None => debug!(target: "hub_transport", request_id = %request_id, "Twin reply with no waiter"),
                }
                true
            }
            EventRoute::OutgoingPublish { packet_id } => {
                // QoS 0 publishes carry packet id 0 and are never acknowledged
                if packet_id != 0 {
                    if let Ok(mut pending) = shared.pending_acks.lock() {
                        pending.assign(packet_id);
                    }
                }
                true
            }
            EventRoute::PublishAcknowledged { packet_id } => {
                if let Ok(mut pending) = shared.pending_acks.lock() {
                    pending.complete(packet_id);
                }
                true
            }
            EventRoute::Disconnected => {
                warn!("Hub closed the session");
                shared.set_link(LinkState::Down("hub closed the session".to_string()));
                false
            }
            EventRoute::SubscriptionConfirmed { packet_id, failed } => {
                if let Err(e) = MessageHandler::validate_subscription_success(failed, packet_id) {
                    error!("{}", e);
                }
                true
            }
            EventRoute::InfrastructureEvent(event_str) => {
                debug!(target: "hub_transport", "MQTT event: {}", event_str);
                true
            }
            EventRoute::OutgoingEvent => true,
        }
    }

    /// Hand a direct method to the sink and publish whatever it answers
    fn forward_method_request(
        shared: &Arc<Shared>,
        name: String,
        request_id: String,
        payload: Bytes,
    ) {
        metrics().command_received();
        let (invocation, reply_rx) =
            CommandInvocation::new(request_id.clone(), name.clone(), CommandPayload(payload));

        let sink = shared.command_sink.lock().ok().and_then(|sink| sink.clone());
        let immediate = match sink {
            Some(sink) => match sink.try_send(invocation) {
                Ok(()) => None,
                Err(mpsc::error::TrySendError::Full(_)) => Some(CommandResponse {
                    status: 503,
                    body: serde_json::json!({"error": "busy", "message": "command queue full"}),
                }),
                Err(mpsc::error::TrySendError::Closed(_)) => Some(CommandResponse {
                    status: 503,
                    body: serde_json::json!({"error": "unavailable", "message": "dispatcher stopped"}),
                }),
            },
            None => Some(CommandResponse {
                status: 501,
                body: serde_json::json!({"error": "unavailable", "message": "no command handler registered"}),
            }),
        };

        let shared = shared.clone();
        tokio::spawn(async move {
            let response = match immediate {
                Some(response) => response,
                None => reply_rx.await.unwrap_or_else(|_| CommandResponse {
                    status: 500,
                    body: serde_json::json!({"error": "handler_failed", "message": "no response produced"}),
                }),
            };
            Self::publish_method_response(&shared, &request_id, &name, response).await;
        });
    }

    async fn publish_method_response(
        shared: &Shared,
        request_id: &str,
        name: &str,
        response: CommandResponse,
    ) {
        let topic = TopicBuilder::build_method_response_topic(response.status, request_id);
        let client = shared.client.lock().await.clone();
        let Some(client) = client else {
            warn!(command = %name, request_id = %request_id, "Dropping method response: not connected");
            return;
        };

        match client
            .publish(topic, QoS::AtMostOnce, false, response.body.to_string())
            .await
        {
            Ok(()) => debug!(
                target: "hub_transport",
                command = %name,
                status = response.status,
                "Published method response"
            ),
            Err(e) => error!(command = %name, error = %e, "Failed to publish method response"),
        }
    }

    async fn current_client(&self) -> Option<AsyncClient> {
        if !self.shared.link_tx.borrow().is_up() {
            return None;
        }
        self.shared.client.lock().await.clone()
    }

    /// Issue a `$rid` correlated twin request and wait for its reply
    async fn twin_request(
        &self,
        topic_for: impl FnOnce(&str) -> String,
        body: Vec<u8>,
        not_connected: TwinError,
        lost: TwinError,
    ) -> Result<TwinReply, TwinError> {
        let client = self.current_client().await.ok_or(not_connected)?;

        let request_id = uuid::Uuid::new_v4().simple().to_string();
        let (tx, rx) = oneshot::channel();
        if let Ok(mut pending) = self.shared.pending_twin.lock() {
            pending.insert(request_id.clone(), tx);
        }
        let _guard = PendingTwinGuard {
            pending: &self.shared.pending_twin,
            request_id: request_id.clone(),
        };

        client
            .publish(topic_for(&request_id), QoS::AtMostOnce, false, body)
            .await
            .map_err(|e| match &lost {
                TwinError::FetchFailure(_) => TwinError::FetchFailure(e.to_string()),
                _ => TwinError::PatchFailure(e.to_string()),
            })?;

        rx.await.map_err(|_| lost)
    }
}

impl Default for HubMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HubMqttClient {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credential: &Credential,
    ) -> Result<(), ConnectError> {
        self.stop_event_loop().await;

        let mqtt_options = configure_mqtt_options(identity, credential);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, 10);

        // Queued now, sent by rumqttc right after the handshake
        for topic in TopicBuilder::build_subscription_topics() {
            client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| ConnectError::NetworkUnreachable(format!("subscribe {topic}: {e}")))?;
        }

        info!(device = %identity, "Connecting to hub");
        Self::wait_for_connack(&mut event_loop).await?;

        *self.shared.client.lock().await = Some(client);
        if let Ok(mut device_id) = self.shared.device_id.lock() {
            *device_id = Some(identity.device_id.clone());
        }
        self.shared.set_link(LinkState::Up);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = Some(shutdown_tx);
        *self.event_loop_handle.lock().await = Some(Self::spawn_event_loop(
            self.shared.clone(),
            event_loop,
            shutdown_rx,
        ));

        info!(device = %identity, "Hub connection established");
        Ok(())
    }

    async fn send(&self, message: &TelemetryMessage) -> Result<Ack, SendError> {
        let client = self.current_client().await.ok_or(SendError::NotConnected)?;
        let device_id = self
            .shared
            .device_id
            .lock()
            .ok()
            .and_then(|id| id.clone())
            .ok_or(SendError::NotConnected)?;
        let topic = TopicBuilder::build_telemetry_topic(&device_id, &message.properties);

        let (tx, rx) = oneshot::channel();
        {
            // Enqueue and publish under one lock so queue order matches wire order
            let mut pending = self
                .shared
                .pending_acks
                .lock()
                .map_err(|_| SendError::Rejected("pending ack table poisoned".to_string()))?;
            pending.unassigned.push_back(tx);
            if let Err(e) = client.try_publish(topic, QoS::AtLeastOnce, false, message.body.to_vec()) {
                pending.unassigned.pop_back();
                return Err(SendError::Rejected(e.to_string()));
            }
        }

        rx.await.map_err(|_| SendError::NotConnected)
    }

    async fn get_twin(&self) -> Result<TwinDocument, TwinError> {
        let reply = self
            .twin_request(
                TopicBuilder::build_twin_get_topic,
                Vec::new(),
                TwinError::NotConnected,
                TwinError::FetchFailure("link lost before twin arrived".to_string()),
            )
            .await?;

        match reply.status {
            200 => TwinDocument::from_hub_json(&reply.payload),
            status => Err(TwinError::FetchFailure(format!("hub returned status {status}"))),
        }
    }

    /// The hub's PATCH request carries no version precondition, so
    /// `base_version` never reaches the wire here. Stale snapshots are only
    /// guarded by the reconciler re-fetching before each attempt.
    async fn patch_reported(&self, patch: &ReportedPatch) -> Result<u64, TwinError> {
        let body = serde_json::to_vec(&patch.to_json())
            .map_err(|e| TwinError::PatchFailure(format!("serialization error: {e}")))?;

        let reply = self
            .twin_request(
                TopicBuilder::build_twin_patch_topic,
                body,
                TwinError::NotConnected,
                TwinError::PatchFailure("link lost before patch was acknowledged".to_string()),
            )
            .await?;

        match reply.status {
            200 | 204 => Ok(reply.version.unwrap_or(patch.base_version + 1)),
            409 | 412 => Err(TwinError::Conflict(
                reply.version.unwrap_or(patch.base_version),
            )),
            status => Err(TwinError::PatchFailure(format!("hub returned status {status}"))),
        }
    }

    fn on_inbound_command(&self, sink: mpsc::Sender<CommandInvocation>) {
        if let Ok(mut current) = self.shared.command_sink.lock() {
            *current = Some(sink);
        }
    }

    fn link_state(&self) -> watch::Receiver<LinkState> {
        self.shared.link_tx.subscribe()
    }

    async fn disconnect(&self) {
        if let Some(client) = self.shared.client.lock().await.take() {
            if let Err(e) = client.disconnect().await {
                debug!(target: "hub_transport", "Disconnect request not delivered: {}", e);
            }
        }

        self.stop_event_loop().await;
        self.shared.fail_pending();
        self.shared
            .set_link(LinkState::Down("disconnected by device".to_string()));
        info!("Hub client disconnected");
    }
}
