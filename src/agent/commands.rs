//! Direct method dispatch
//!
//! Handlers are registered by method name. Each inbound invocation runs in
//! its own task so a slow handler never holds up the next request, and every
//! invocation gets exactly one reply.

use crate::command_span;
use crate::error::CommandError;
use crate::observability::metrics::metrics;
use crate::transport::{CommandInvocation, CommandPayload, CommandResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn, Instrument};

/// Logic behind one direct method
#[async_trait]
pub trait CommandHandler: Send + Sync {
    fn describe(&self) -> CommandDescription;

    /// Run the command. The payload has already passed the schema check
    /// when [`CommandDescription::payload_schema`] is set.
    async fn handle(&self, payload: &CommandPayload) -> Result<Value, CommandError>;
}

#[derive(Debug, Clone)]
pub struct CommandDescription {
    pub name: String,
    pub description: String,
    /// JSON schema the payload must satisfy, if any
    pub payload_schema: Option<Value>,
}

pub struct CommandDispatcher {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
    drain_timeout: Duration,
}

impl CommandDispatcher {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            drain_timeout,
        }
    }

    /// Add a handler, replacing any previous one under the same name
    pub fn register(
        &self,
        name: impl Into<String>,
        handler: Arc<dyn CommandHandler>,
    ) -> Option<Arc<dyn CommandHandler>> {
        let name = name.into();
        debug!(target: "commands", command = %name, "Registering command handler");
        match self.handlers.write() {
            Ok(mut handlers) => handlers.insert(name, handler),
            Err(poisoned) => poisoned.into_inner().insert(name, handler),
        }
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.handlers.read() {
            Ok(handlers) => handlers.keys().cloned().collect(),
            Err(poisoned) => poisoned.into_inner().keys().cloned().collect(),
        };
        names.sort();
        names
    }

    pub fn describe(&self, name: &str) -> Option<CommandDescription> {
        self.handler(name).map(|handler| handler.describe())
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn CommandHandler>> {
        match self.handlers.read() {
            Ok(handlers) => handlers.get(name).cloned(),
            Err(poisoned) => poisoned.into_inner().get(name).cloned(),
        }
    }

    /// Route one invocation to its handler
    pub async fn dispatch(&self, name: &str, payload: &CommandPayload) -> Result<Value, CommandError> {
        let handler = self
            .handler(name)
            .ok_or_else(|| CommandError::Unrecognized(name.to_string()))?;

        if let Some(schema) = handler.describe().payload_schema {
            validate_payload(&schema, payload)?;
        }

        handler.handle(payload).await.map_err(|e| match e {
            CommandError::HandlerFailed(message) => CommandError::handler_failed(message),
            other => other,
        })
    }

    /// Dispatch and reply through the invocation's responder
    pub async fn handle_invocation(&self, invocation: CommandInvocation) {
        let CommandInvocation {
            request_id,
            name,
            payload,
            responder,
        } = invocation;

        let result = self.dispatch(&name, &payload).await;
        metrics().command_completed(result.is_ok());
        match &result {
            Ok(_) => info!(target: "commands", command = %name, request_id = %request_id, "Command succeeded"),
            Err(e) => warn!(
                target: "commands",
                command = %name,
                request_id = %request_id,
                kind = e.kind(),
                error = %e,
                "Command failed"
            ),
        }

        if !responder.respond(CommandResponse::from_result(result)) {
            warn!(target: "commands", command = %name, request_id = %request_id, "Reply dropped; transport stopped listening");
        }
    }

    /// Accept invocations until shutdown, then drain in-flight handlers for
    /// at most the drain timeout before aborting them
    pub async fn run(
        self: Arc<Self>,
        mut receiver: mpsc::Receiver<CommandInvocation>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut in_flight = JoinSet::new();
        info!(target: "commands", handlers = ?self.registered(), "Command dispatcher started");

        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                invocation = receiver.recv() => {
                    let Some(invocation) = invocation else {
                        break;
                    };
                    let span = command_span!(
                        command = %invocation.name,
                        request_id = %invocation.request_id
                    );
                    let dispatcher = self.clone();
                    in_flight.spawn(
                        async move { dispatcher.handle_invocation(invocation).await }.instrument(span),
                    );
                }
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        warn!(target: "commands", error = %e, "Command task ended abnormally");
                    }
                }
            }
        }

        receiver.close();
        self.drain(in_flight).await;
        info!(target: "commands", "Command dispatcher stopped");
    }

    async fn drain(&self, mut in_flight: JoinSet<()>) {
        if in_flight.is_empty() {
            return;
        }
        debug!(target: "commands", pending = in_flight.len(), "Draining in-flight commands");

        let drained = tokio::time::timeout(self.drain_timeout, async {
            while in_flight.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                target: "commands",
                pending = in_flight.len(),
                "Aborting commands still running after drain timeout"
            );
            in_flight.shutdown().await;
        }
    }
}

/// Check a payload against a handler's JSON schema
fn validate_payload(schema: &Value, payload: &CommandPayload) -> Result<(), CommandError> {
    let value = payload
        .json()
        .map_err(|e| CommandError::invalid_payload(format!("payload is not valid JSON: {e}")))?;

    let validator = jsonschema::validator_for(schema)
        .map_err(|e| CommandError::handler_failed(format!("schema compilation error: {e}")))?;

    validator.validate(&value).map_err(|errors| {
        let messages: Vec<String> = errors
            .map(|e| format!("At '{}': {}", e.instance_path, e))
            .collect();
        CommandError::invalid_payload(messages.join("; "))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl CommandHandler for EchoHandler {
        fn describe(&self) -> CommandDescription {
            CommandDescription {
                name: "echo".to_string(),
                description: "Returns its payload".to_string(),
                payload_schema: Some(json!({
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                })),
            }
        }

        async fn handle(&self, payload: &CommandPayload) -> Result<Value, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            payload
                .json()
                .map_err(|e| CommandError::invalid_payload(e.to_string()))
        }
    }

    struct LeakyHandler;

    #[async_trait]
    impl CommandHandler for LeakyHandler {
        fn describe(&self) -> CommandDescription {
            CommandDescription {
                name: "leaky".to_string(),
                description: "Fails with a secret in the message".to_string(),
                payload_schema: None,
            }
        }

        async fn handle(&self, _payload: &CommandPayload) -> Result<Value, CommandError> {
            Err(CommandError::HandlerFailed(
                "upload failed with token=abc123".to_string(),
            ))
        }
    }

    fn dispatcher() -> (CommandDispatcher, Arc<EchoHandler>) {
        let dispatcher = CommandDispatcher::new(Duration::from_secs(1));
        let echo = Arc::new(EchoHandler {
            calls: AtomicUsize::new(0),
        });
        dispatcher.register("echo", echo.clone());
        dispatcher.register("leaky", Arc::new(LeakyHandler));
        (dispatcher, echo)
    }

    #[tokio::test]
    async fn test_dispatch_success() {
        let (dispatcher, echo) = dispatcher();
        let result = dispatcher
            .dispatch("echo", &CommandPayload::from(json!({"text": "hi"})))
            .await
            .unwrap();
        assert_eq!(result, json!({"text": "hi"}));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_schema_violation_skips_handler() {
        let (dispatcher, echo) = dispatcher();
        let err = dispatcher
            .dispatch("echo", &CommandPayload::from(json!({"text": 5})))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::InvalidPayload(_)));
        assert_eq!(echo.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_malformed_json_is_invalid_payload() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .dispatch("echo", &CommandPayload::from("{not json"))
            .await
            .unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[tokio::test]
    async fn test_handler_failure_is_sanitized() {
        let (dispatcher, _) = dispatcher();
        let err = dispatcher
            .dispatch("leaky", &CommandPayload::default())
            .await
            .unwrap_err();
        match err {
            CommandError::HandlerFailed(message) => {
                assert!(!message.contains("abc123"));
                assert!(message.contains("token=***"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_register_replaces() {
        let (dispatcher, _) = dispatcher();
        let previous = dispatcher.register("leaky", Arc::new(LeakyHandler));
        assert!(previous.is_some());
        assert_eq!(dispatcher.registered(), vec!["echo", "leaky"]);
    }

    #[tokio::test]
    async fn test_handle_invocation_replies() {
        let (dispatcher, _) = dispatcher();
        let (invocation, reply) =
            CommandInvocation::new("7", "reboot", CommandPayload::default());

        dispatcher.handle_invocation(invocation).await;
        let response = reply.await.unwrap();
        assert_eq!(response.status, 404);
        assert_eq!(response.body["error"], "unrecognized");
    }
}
