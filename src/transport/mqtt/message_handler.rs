//! Pure message routing for hub MQTT events
//!
//! Turns raw rumqttc events into routing decisions the client acts on.
//! Topic parsing for direct methods and twin responses lives here.

use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};
use tracing::debug;

const METHOD_REQUEST_PREFIX: &str = "$iothub/methods/POST/";
const TWIN_RESPONSE_PREFIX: &str = "$iothub/twin/res/";

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => {
                    Self::route_publish(&publish.topic, publish.payload.clone())
                }
                Packet::PubAck(ack) => EventRoute::PublishAcknowledged { packet_id: ack.pkid },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failed: suback
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure)),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Publish(packet_id)) => EventRoute::OutgoingPublish {
                packet_id: *packet_id,
            },
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Classify an inbound publish by topic (pure function)
    pub fn route_publish(topic: &str, payload: Bytes) -> EventRoute {
        if let Some((name, request_id)) = Self::parse_method_topic(topic) {
            return EventRoute::MethodRequest {
                name,
                request_id,
                payload,
            };
        }

        if let Some((status, request_id, version)) = Self::parse_twin_response_topic(topic) {
            return EventRoute::TwinResponse {
                status,
                request_id,
                version,
                payload,
            };
        }

        debug!(target: "hub_transport", topic = %topic, "Ignoring publish on unhandled topic");
        EventRoute::InfrastructureEvent(format!("publish on {topic}"))
    }

    /// Parse `$iothub/methods/POST/{name}/?$rid={rid}` into (name, rid)
    pub fn parse_method_topic(topic: &str) -> Option<(String, String)> {
        let rest = topic.strip_prefix(METHOD_REQUEST_PREFIX)?;
        let (name, query) = rest.split_once("/?")?;
        if name.is_empty() {
            return None;
        }
        let request_id = Self::query_value(query, "$rid")?;
        Some((name.to_string(), request_id))
    }

    /// Parse `$iothub/twin/res/{status}/?$rid={rid}[&$version={v}]`
    pub fn parse_twin_response_topic(topic: &str) -> Option<(u16, String, Option<u64>)> {
        let rest = topic.strip_prefix(TWIN_RESPONSE_PREFIX)?;
        let (status, query) = rest.split_once("/?")?;
        let status = status.parse().ok()?;
        let request_id = Self::query_value(query, "$rid")?;
        let version = Self::query_value(query, "$version").and_then(|v| v.parse().ok());
        Some((status, request_id, version))
    }

    fn query_value(query: &str, key: &str) -> Option<String> {
        url::form_urlencoded::parse(query.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Validate subscription success from SubAck (pure function)
    pub fn validate_subscription_success(failed: bool, packet_id: u16) -> Result<(), String> {
        if failed {
            Err(format!("Subscription {packet_id} rejected by hub"))
        } else {
            Ok(())
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Session established
    ConnectionAcknowledged,
    /// Direct method invocation
    MethodRequest {
        name: String,
        request_id: String,
        payload: Bytes,
    },
    /// Reply to a twin GET or PATCH
    TwinResponse {
        status: u16,
        request_id: String,
        version: Option<u64>,
        payload: Bytes,
    },
    /// Hub acknowledged a QoS 1 publish
    PublishAcknowledged { packet_id: u16 },
    /// Publish left the client with this packet id (0 for QoS 0)
    OutgoingPublish { packet_id: u16 },
    /// Hub closed the session
    Disconnected,
    /// Subscription result
    SubscriptionConfirmed { packet_id: u16, failed: bool },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}
