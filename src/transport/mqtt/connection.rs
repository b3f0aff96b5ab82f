//! Pure connection configuration for the hub MQTT client
//!
//! This module contains pure functions for MQTT option construction,
//! hub topic naming and error classification.

use crate::error::ConnectError;
use crate::transport::{Credential, DeviceIdentity};
use rumqttc::{ConnectReturnCode, ConnectionError, MqttOptions, TlsConfiguration};
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;

/// Hub MQTT port (TLS only)
pub const HUB_MQTT_PORT: u16 = 8883;

/// API version advertised in the MQTT username
pub const HUB_API_VERSION: &str = "2021-04-12";

/// Pure function to configure MQTT options for a device identity
pub fn configure_mqtt_options(identity: &DeviceIdentity, credential: &Credential) -> MqttOptions {
    // The hub requires the client id to equal the device id
    let mut mqtt_options = MqttOptions::new(
        identity.device_id.clone(),
        identity.connect_host().to_string(),
        HUB_MQTT_PORT,
    );

    // Certificate authentication: username carries identity, password is empty
    mqtt_options.set_credentials(hub_username(identity), "");

    let tls = TlsConfiguration::Simple {
        ca: credential.ca_pem.clone(),
        alpn: None,
        client_auth: Some((credential.cert_pem.clone(), credential.key_pem.clone())),
    };
    mqtt_options.set_transport(RumqttcTransport::tls_with_config(tls));

    mqtt_options.set_keep_alive(Duration::from_secs(60));
    mqtt_options.set_clean_session(true);

    // Hub messages are capped at 256KB
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    mqtt_options
}

/// MQTT username expected by the hub
pub fn hub_username(identity: &DeviceIdentity) -> String {
    format!(
        "{}/{}/?api-version={}",
        identity.host_name, identity.device_id, HUB_API_VERSION
    )
}

/// Map an rumqttc connection error onto the agent's connect taxonomy
pub fn classify_connection_error(error: &ConnectionError) -> ConnectError {
    match error {
        ConnectionError::ConnectionRefused(code) => match code {
            ConnectReturnCode::BadUserNamePassword
            | ConnectReturnCode::NotAuthorized
            | ConnectReturnCode::BadClientId => {
                ConnectError::AuthFailure(format!("connection refused: {code:?}"))
            }
            other => ConnectError::NetworkUnreachable(format!("connection refused: {other:?}")),
        },
        ConnectionError::Tls(e) => ConnectError::AuthFailure(format!("TLS handshake failed: {e}")),
        ConnectionError::NetworkTimeout | ConnectionError::FlushTimeout => {
            ConnectError::Timeout(Duration::ZERO)
        }
        ConnectionError::Io(e) => ConnectError::NetworkUnreachable(e.to_string()),
        other => ConnectError::NetworkUnreachable(other.to_string()),
    }
}

/// Hub topic construction functions
pub struct TopicBuilder;

impl TopicBuilder {
    /// Device-to-cloud telemetry: `devices/{id}/messages/events/{property_bag}`
    pub fn build_telemetry_topic(device_id: &str, properties: &[(String, String)]) -> String {
        let bag = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(properties.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        format!("devices/{device_id}/messages/events/{bag}")
    }

    /// Twin fetch request: `$iothub/twin/GET/?$rid={rid}`
    pub fn build_twin_get_topic(request_id: &str) -> String {
        format!("$iothub/twin/GET/?$rid={request_id}")
    }

    /// Reported patch request: `$iothub/twin/PATCH/properties/reported/?$rid={rid}`
    pub fn build_twin_patch_topic(request_id: &str) -> String {
        format!("$iothub/twin/PATCH/properties/reported/?$rid={request_id}")
    }

    /// Direct method reply: `$iothub/methods/res/{status}/?$rid={rid}`
    pub fn build_method_response_topic(status: u16, request_id: &str) -> String {
        format!("$iothub/methods/res/{status}/?$rid={request_id}")
    }

    /// Subscriptions needed for direct methods and twin responses
    pub fn build_subscription_topics() -> Vec<String> {
        vec![
            "$iothub/methods/POST/#".to_string(),
            "$iothub/twin/res/#".to_string(),
        ]
    }
}
