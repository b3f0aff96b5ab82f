//! Error taxonomy for the device agent
//!
//! Every failure surface of the agent maps onto one of these kinds. Transport
//! errors are converted into them at the boundary where they occur; only
//! [`ConfigError`](crate::config::ConfigError) and an exhausted
//! [`ConnectError`] ever terminate the process.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use thiserror::Error;

/// Establishing a hub session failed. Retryable with backoff.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectError {
    #[error("authentication rejected: {0}")]
    AuthFailure(String),
    #[error("hub unreachable: {0}")]
    NetworkUnreachable(String),
    #[error("connect timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Submitting a message failed. Recoverable; the caller logs and moves on.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error("send timed out after {0:?}")]
    Timeout(std::time::Duration),
}

/// Twin fetch or patch failed. Retried a bounded number of times.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TwinError {
    #[error("twin fetch failed: {0}")]
    FetchFailure(String),
    #[error("twin patch failed: {0}")]
    PatchFailure(String),
    #[error("twin patch conflicts with remote version {0}")]
    Conflict(u64),
    #[error("twin operation timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("not connected")]
    NotConnected,
}

impl TwinError {
    /// Whether a refetch-and-retry can reasonably succeed
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TwinError::NotConnected)
    }
}

/// Returned to the remote caller of a direct method. Never crashes the agent.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CommandError {
    #[error("unrecognized command: {0}")]
    Unrecognized(String),
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
    #[error("handler failed: {0}")]
    HandlerFailed(String),
}

impl CommandError {
    /// Method response status reported back to the hub
    pub fn status(&self) -> u16 {
        match self {
            CommandError::Unrecognized(_) => 404,
            CommandError::InvalidPayload(_) => 400,
            CommandError::HandlerFailed(_) => 500,
        }
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            CommandError::Unrecognized(_) => "unrecognized",
            CommandError::InvalidPayload(_) => "invalid_payload",
            CommandError::HandlerFailed(_) => "handler_failed",
        }
    }

    /// JSON body sent back through the responder
    pub fn to_response_body(&self) -> Value {
        let message = match self {
            CommandError::Unrecognized(name) => format!("no handler registered for '{name}'"),
            CommandError::InvalidPayload(message) | CommandError::HandlerFailed(message) => {
                sanitize_error_message(message)
            }
        };
        json!({ "error": self.kind(), "message": message })
    }

    /// Create handler failure with a sanitized message
    pub fn handler_failed<S: AsRef<str>>(message: S) -> Self {
        Self::HandlerFailed(sanitize_error_message(message.as_ref()))
    }

    /// Create invalid payload error
    pub fn invalid_payload<S: Into<String>>(message: S) -> Self {
        Self::InvalidPayload(message.into())
    }
}

/// Top-level error returned by the supervisor
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Connection retries exhausted after {attempts} attempts: {last}")]
    ConnectExhausted { attempts: u32, last: ConnectError },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl AgentError {
    /// Process exit code for this failure
    pub fn exit_code(&self) -> u8 {
        match self {
            AgentError::Config(_) => 1,
            AgentError::ConnectExhausted { .. } => 2,
            AgentError::Internal { .. } => 3,
        }
    }

    /// Create internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

static SECRET_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"(?i)(password|token|key|secret|sharedaccesskey)[=:]\s*[^\s;]+").ok()
});

static SENSITIVE_PATH_PATTERN: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"/[a-zA-Z0-9._/-]+/(secrets?|certs?|\.ssh|\.aws|\.config)/[a-zA-Z0-9._/-]+").ok()
});

/// Sanitize error messages before they leave the device
pub fn sanitize_error_message(message: &str) -> String {
    let mut sanitized = message.to_string();

    if let Some(secret) = &*SECRET_PATTERN {
        sanitized = secret.replace_all(&sanitized, "${1}=***").to_string();
    }

    if let Some(paths) = &*SENSITIVE_PATH_PATTERN {
        sanitized = paths.replace_all(&sanitized, "/***REDACTED***/").to_string();
    }

    // Keep total length <= 500 on a char boundary
    if sanitized.len() > 500 {
        let truncate_suffix = "...[truncated]";
        let mut cut = 500 - truncate_suffix.len();
        while !sanitized.is_char_boundary(cut) {
            cut -= 1;
        }
        sanitized = format!("{}{}", &sanitized[..cut], truncate_suffix);
    }

    sanitized
}

/// Result type for supervisor operations
pub type AgentResult<T> = Result<T, AgentError>;
