//! Built-in `firmwareUpdate` direct method
//!
//! Validates and acknowledges the request. Downloading and applying an
//! image is not implemented; the device only records that an update was
//! asked for.

use crate::agent::commands::{CommandDescription, CommandHandler};
use crate::error::CommandError;
use crate::transport::CommandPayload;
use async_trait::async_trait;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;
use url::Url;

pub const FIRMWARE_UPDATE_METHOD: &str = "firmwareUpdate";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FirmwareUpdateRequest {
    /// Location of the firmware image
    pub firmware_url: String,
}

#[derive(Debug, Default)]
pub struct FirmwareUpdateHandler;

impl FirmwareUpdateHandler {
    pub fn new() -> Self {
        Self
    }

    fn parse_request(payload: &CommandPayload) -> Result<(FirmwareUpdateRequest, Url), CommandError> {
        let value = payload
            .json()
            .map_err(|e| CommandError::invalid_payload(format!("payload is not valid JSON: {e}")))?;
        let request: FirmwareUpdateRequest = serde_json::from_value(value)
            .map_err(|e| CommandError::invalid_payload(e.to_string()))?;

        let url = Url::parse(&request.firmware_url)
            .map_err(|e| CommandError::invalid_payload(format!("firmwareUrl: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CommandError::invalid_payload(format!(
                "firmwareUrl: unsupported scheme '{}'",
                url.scheme()
            )));
        }

        Ok((request, url))
    }
}

#[async_trait]
impl CommandHandler for FirmwareUpdateHandler {
    fn describe(&self) -> CommandDescription {
        let schema = schemars::schema_for!(FirmwareUpdateRequest);
        CommandDescription {
            name: FIRMWARE_UPDATE_METHOD.to_string(),
            description: "Request a firmware update from the given URL".to_string(),
            payload_schema: serde_json::to_value(schema).ok(),
        }
    }

    async fn handle(&self, payload: &CommandPayload) -> Result<Value, CommandError> {
        let (request, url) = Self::parse_request(payload)?;

        info!(
            target: "commands",
            firmware_url = %url,
            host = url.host_str().unwrap_or_default(),
            "Firmware update requested"
        );

        Ok(json!({
            "status": "accepted",
            "firmwareUrl": request.firmware_url,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::commands::CommandDispatcher;
    use std::sync::Arc;
    use std::time::Duration;

    fn dispatcher() -> CommandDispatcher {
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));
        dispatcher.register(FIRMWARE_UPDATE_METHOD, Arc::new(FirmwareUpdateHandler::new()));
        dispatcher
    }

    #[tokio::test]
    async fn test_accepts_valid_request() {
        let result = dispatcher()
            .dispatch(
                FIRMWARE_UPDATE_METHOD,
                &CommandPayload::from(json!({"firmwareUrl": "https://example.com/fw-1.2.bin"})),
            )
            .await
            .unwrap();

        assert_eq!(
            result,
            json!({"status": "accepted", "firmwareUrl": "https://example.com/fw-1.2.bin"})
        );
    }

    #[tokio::test]
    async fn test_missing_url_fails_schema() {
        let err = dispatcher()
            .dispatch(FIRMWARE_UPDATE_METHOD, &CommandPayload::from(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload(_)));
    }

    #[tokio::test]
    async fn test_unparseable_url_rejected() {
        let err = FirmwareUpdateHandler::new()
            .handle(&CommandPayload::from(json!({"firmwareUrl": "not a url"})))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_non_http_scheme_rejected() {
        let err = FirmwareUpdateHandler::new()
            .handle(&CommandPayload::from(json!({"firmwareUrl": "file:///etc/passwd"})))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("unsupported scheme"));
    }

    #[test]
    fn test_schema_requires_firmware_url() {
        let description = FirmwareUpdateHandler::new().describe();
        let schema = description.payload_schema.unwrap();
        assert_eq!(schema["required"], json!(["firmwareUrl"]));
        assert_eq!(description.name, "firmwareUpdate");
    }
}
