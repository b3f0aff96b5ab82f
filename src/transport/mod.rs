//! Transport layer between the device and the hub
//!
//! The [`Transport`] trait is the seam to the hub-like service: it provides
//! connect/send/receive primitives and nothing else. Policy (timeouts,
//! connection state, retries, buffering) lives in [`crate::agent`], so the
//! same agent runs against the MQTT client in [`mqtt`] or the mock in
//! [`crate::testing`].

use crate::error::{ConnectError, SendError, TwinError};
use tokio::sync::{mpsc, watch};

pub mod identity;
pub mod message;
pub mod mqtt;

pub use identity::{Credential, DeviceIdentity};
pub use message::{
    CommandInvocation, CommandPayload, CommandResponse, ReportedPatch, Responder,
    TelemetryMessage, TwinDocument,
};

/// Hub acknowledgement of a telemetry message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack {
    pub message_id: u64,
}

/// Link status as observed by the transport
#[derive(Debug, Clone, PartialEq)]
pub enum LinkState {
    /// Session established and usable
    Up,
    /// No usable session, with the reason
    Down(String),
}

impl LinkState {
    pub fn is_up(&self) -> bool {
        matches!(self, LinkState::Up)
    }
}

/// Primitive operations against the hub
///
/// All methods take `&self`; implementations use interior mutability so a
/// single transport can be shared between the scheduler, the dispatcher and
/// the reconciler.
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Establish an authenticated session
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credential: &Credential,
    ) -> Result<(), ConnectError>;

    /// Submit a telemetry message and wait for the hub's acknowledgement
    async fn send(&self, message: &TelemetryMessage) -> Result<Ack, SendError>;

    /// Fetch the full twin document
    async fn get_twin(&self) -> Result<TwinDocument, TwinError>;

    /// Push a reported-properties patch, returning the new reported version
    async fn patch_reported(&self, patch: &ReportedPatch) -> Result<u64, TwinError>;

    /// Route inbound command invocations to `sink`; replaces any previous sink
    fn on_inbound_command(&self, sink: mpsc::Sender<CommandInvocation>);

    /// Watch link up/down transitions
    fn link_state(&self) -> watch::Receiver<LinkState>;

    /// Release the session. Idempotent.
    async fn disconnect(&self);
}

/// Type alias for the production transport
pub type HubTransport = mqtt::HubMqttClient;
