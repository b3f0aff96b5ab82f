//! The device's connection to the hub
//!
//! [`Connection`] owns the identity, the credential and the transport handle
//! and is the only writer of [`ConnectionState`]. Every operation is bounded
//! by its configured timeout and fails fast when the session is not up.

use crate::config::TimeoutsSection;
use crate::error::{ConnectError, SendError, TwinError};
use crate::observability::metrics::metrics;
use crate::transport::{
    Ack, CommandInvocation, Credential, DeviceIdentity, LinkState, ReportedPatch,
    TelemetryMessage, Transport, TwinDocument,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Failed => "failed",
        }
    }
}

/// Per-operation deadlines
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionTimeouts {
    pub connect: Duration,
    pub send: Duration,
    pub twin: Duration,
}

impl From<&TimeoutsSection> for ConnectionTimeouts {
    fn from(section: &TimeoutsSection) -> Self {
        Self {
            connect: Duration::from_secs(section.connect_secs),
            send: Duration::from_secs(section.send_secs),
            twin: Duration::from_secs(section.twin_secs),
        }
    }
}

impl Default for ConnectionTimeouts {
    fn default() -> Self {
        Self::from(&TimeoutsSection::default())
    }
}

pub struct Connection<T: Transport> {
    identity: DeviceIdentity,
    credential: Credential,
    transport: Arc<T>,
    state_tx: watch::Sender<ConnectionState>,
    timeouts: ConnectionTimeouts,
    gate: RwLock<()>,
}

impl<T: Transport> Connection<T> {
    pub fn new(
        identity: DeviceIdentity,
        credential: Credential,
        transport: Arc<T>,
        timeouts: ConnectionTimeouts,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            identity,
            credential,
            transport,
            state_tx,
            timeouts,
            gate: RwLock::new(()),
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    pub fn timeouts(&self) -> ConnectionTimeouts {
        self.timeouts
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribe to state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Watch the transport's view of the link
    pub fn link_state(&self) -> watch::Receiver<LinkState> {
        self.transport.link_state()
    }

    /// Excludes twin attempts (read side) from reconnection (write side)
    pub fn gate(&self) -> &RwLock<()> {
        &self.gate
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state_tx.send_replace(next);
        if previous != next {
            debug!(
                target: "hub_transport",
                from = previous.as_str(),
                to = next.as_str(),
                "Connection state changed"
            );
        }
    }

    /// Establish the session, bounded by the connect timeout
    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.set_state(ConnectionState::Connecting);
        metrics().connection_attempt();
        info!(target: "hub_transport", device = %self.identity, "Connecting to hub");

        let result = match timeout(
            self.timeouts.connect,
            self.transport.connect(&self.identity, &self.credential),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // Leave no half-open session behind
                self.transport.disconnect().await;
                Err(ConnectError::Timeout(self.timeouts.connect))
            }
        };

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Connected);
                metrics().connection_established();
                info!(target: "hub_transport", device = %self.identity, "Connected to hub");
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Failed);
                metrics().connection_failed();
                warn!(target: "hub_transport", device = %self.identity, error = %e, "Connect failed");
                Err(e)
            }
        }
    }

    /// Submit one telemetry message
    pub async fn send(&self, message: &TelemetryMessage) -> Result<Ack, SendError> {
        if !self.is_connected() {
            return Err(SendError::NotConnected);
        }
        timeout(self.timeouts.send, self.transport.send(message))
            .await
            .map_err(|_| SendError::Timeout(self.timeouts.send))?
    }

    pub async fn fetch_twin(&self) -> Result<TwinDocument, TwinError> {
        if !self.is_connected() {
            return Err(TwinError::NotConnected);
        }
        timeout(self.timeouts.twin, self.transport.get_twin())
            .await
            .map_err(|_| TwinError::Timeout(self.timeouts.twin))?
    }

    pub async fn patch_reported(&self, patch: &ReportedPatch) -> Result<u64, TwinError> {
        if !self.is_connected() {
            return Err(TwinError::NotConnected);
        }
        timeout(self.timeouts.twin, self.transport.patch_reported(patch))
            .await
            .map_err(|_| TwinError::Timeout(self.timeouts.twin))?
    }

    pub fn on_inbound_command(&self, sink: mpsc::Sender<CommandInvocation>) {
        self.transport.on_inbound_command(sink);
    }

    /// Record that the transport lost the link. Only a connected session moves.
    pub fn mark_dropped(&self, reason: &str) -> bool {
        let dropped = self.state_tx.send_if_modified(|state| {
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        });
        if dropped {
            metrics().connection_lost();
            warn!(target: "hub_transport", device = %self.identity, reason = %reason, "Connection lost");
        }
        dropped
    }

    /// Close the session. Idempotent.
    pub async fn disconnect(&self) {
        if self.state() != ConnectionState::Disconnected {
            info!(target: "hub_transport", device = %self.identity, "Disconnecting from hub");
        }
        self.transport.disconnect().await;
        self.set_state(ConnectionState::Disconnected);
        metrics().connection_closed();
    }
}
