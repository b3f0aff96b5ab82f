//! Values exchanged with the hub

use crate::error::{CommandError, TwinError};
use bytes::Bytes;
use serde_json::{Map, Value};
use tokio::sync::oneshot;

/// Outbound telemetry: JSON body plus application properties
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub body: Bytes,
    pub properties: Vec<(String, String)>,
}

impl TelemetryMessage {
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.push((name.into(), value.into()));
        self
    }

    /// Look up an application property
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn body_str(&self) -> &str {
        std::str::from_utf8(&self.body).unwrap_or("<binary>")
    }
}

/// Snapshot of the remote twin
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinDocument {
    pub desired: Map<String, Value>,
    pub reported: Map<String, Value>,
    pub reported_version: u64,
}

impl TwinDocument {
    /// Parse the hub's `{"desired": {...}, "reported": {...}}` document.
    /// `$version` is lifted out of the property maps.
    pub fn from_hub_json(payload: &[u8]) -> Result<Self, TwinError> {
        let value: Value = serde_json::from_slice(payload)
            .map_err(|e| TwinError::FetchFailure(format!("malformed twin document: {e}")))?;

        let section = |name: &str| -> Map<String, Value> {
            value
                .get(name)
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default()
        };

        let mut desired = section("desired");
        let mut reported = section("reported");
        desired.remove("$version");
        let reported_version = reported
            .remove("$version")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);

        Ok(Self {
            desired,
            reported,
            reported_version,
        })
    }
}

/// Reported-properties patch tied to the snapshot it was derived from
#[derive(Debug, Clone, PartialEq)]
pub struct ReportedPatch {
    pub base_version: u64,
    pub properties: Map<String, Value>,
}

impl ReportedPatch {
    pub fn to_json(&self) -> Value {
        Value::Object(self.properties.clone())
    }
}

/// Opaque command payload, conventionally JSON
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPayload(pub Bytes);

impl CommandPayload {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Decode as JSON; an empty payload is `null`
    pub fn json(&self) -> Result<Value, serde_json::Error> {
        if self.0.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&self.0)
    }
}

impl From<Value> for CommandPayload {
    fn from(value: Value) -> Self {
        Self(Bytes::from(value.to_string()))
    }
}

impl From<&'static str> for CommandPayload {
    fn from(value: &'static str) -> Self {
        Self(Bytes::from_static(value.as_bytes()))
    }
}

/// Direct method reply
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub status: u16,
    pub body: Value,
}

impl CommandResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn from_error(error: &CommandError) -> Self {
        Self {
            status: error.status(),
            body: error.to_response_body(),
        }
    }

    pub fn from_result(result: Result<Value, CommandError>) -> Self {
        match result {
            Ok(body) => Self::ok(body),
            Err(error) => Self::from_error(&error),
        }
    }
}

/// One-shot reply path for a single invocation
#[derive(Debug)]
pub struct Responder {
    tx: oneshot::Sender<CommandResponse>,
}

impl Responder {
    /// Create a responder and the receiving end the transport listens on
    pub fn channel() -> (Self, oneshot::Receiver<CommandResponse>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Send the reply; returns false when the transport stopped listening
    pub fn respond(self, response: CommandResponse) -> bool {
        self.tx.send(response).is_ok()
    }
}

/// Inbound direct method request
#[derive(Debug)]
pub struct CommandInvocation {
    pub request_id: String,
    pub name: String,
    pub payload: CommandPayload,
    pub responder: Responder,
}

impl CommandInvocation {
    /// Build an invocation together with the receiver for its reply
    pub fn new(
        request_id: impl Into<String>,
        name: impl Into<String>,
        payload: CommandPayload,
    ) -> (Self, oneshot::Receiver<CommandResponse>) {
        let (responder, rx) = Responder::channel();
        (
            Self {
                request_id: request_id.into(),
                name: name.into(),
                payload,
                responder,
            },
            rx,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_twin_document_parsing() {
        let payload = br#"{
            "desired": {"telemetryInterval": 30, "$version": 4},
            "reported": {"status": "connected", "statusUpdated": 1700000000000, "$version": 9}
        }"#;
        let twin = TwinDocument::from_hub_json(payload).unwrap();

        assert_eq!(twin.reported_version, 9);
        assert_eq!(twin.reported["status"], "connected");
        assert!(!twin.reported.contains_key("$version"));
        assert!(!twin.desired.contains_key("$version"));
        assert_eq!(twin.desired["telemetryInterval"], 30);
    }

    #[test]
    fn test_twin_document_missing_sections() {
        let twin = TwinDocument::from_hub_json(b"{}").unwrap();
        assert_eq!(twin.reported_version, 0);
        assert!(twin.reported.is_empty());
    }

    #[test]
    fn test_twin_document_malformed() {
        let result = TwinDocument::from_hub_json(b"not json");
        assert!(matches!(result, Err(TwinError::FetchFailure(_))));
    }

    #[test]
    fn test_empty_payload_is_null() {
        assert_eq!(CommandPayload::default().json().unwrap(), Value::Null);
        assert_eq!(CommandPayload::from(" \n").json().unwrap(), Value::Null);
    }

    #[test]
    fn test_payload_json() {
        let payload = CommandPayload::from(json!({"firmwareUrl": "https://x"}));
        assert_eq!(payload.json().unwrap()["firmwareUrl"], "https://x");
    }

    #[test]
    fn test_message_property_lookup() {
        let message = TelemetryMessage::new("{}").with_property("temperatureAlert", "false");
        assert_eq!(message.property("temperatureAlert"), Some("false"));
        assert_eq!(message.property("missing"), None);
    }

    #[tokio::test]
    async fn test_responder_delivers() {
        let (invocation, rx) = CommandInvocation::new("1", "ping", CommandPayload::default());
        assert!(invocation
            .responder
            .respond(CommandResponse::ok(json!({"pong": true}))));
        let response = rx.await.unwrap();
        assert_eq!(response.status, 200);
    }

    #[test]
    fn test_response_from_error() {
        let response = CommandResponse::from_error(&CommandError::Unrecognized("x".into()));
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "unrecognized");
    }
}
