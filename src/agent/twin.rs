//! Reported-property reconciliation
//!
//! Each attempt fetches the remote twin, merges the new status into a local
//! copy seeded from that snapshot, and pushes a patch that carries the
//! snapshot's version. A failed attempt refetches; a patch is never built
//! from an older snapshot.

use crate::agent::backoff::{BackoffPolicy, RetryDecision};
use crate::agent::connection::Connection;
use crate::agent::telemetry::Clock;
use crate::error::TwinError;
use crate::observability::metrics::metrics;
use crate::transport::{ReportedPatch, Transport};
use crate::twin_span;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{info, warn, Instrument};

/// The device-owned reported properties
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportedProperties {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    /// Epoch milliseconds of the last status change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_updated: Option<i64>,
}

impl ReportedProperties {
    /// `{status, statusUpdated}` stamped at `at`
    pub fn with_status(status: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(status.into()),
            status_updated: Some(at.timestamp_millis()),
        }
    }

    /// Pick the known keys out of a remote reported section. Keys of the
    /// wrong type are treated as absent.
    pub fn from_remote(reported: &Map<String, Value>) -> Self {
        Self {
            status: reported
                .get("status")
                .and_then(Value::as_str)
                .map(str::to_string),
            status_updated: reported.get("statusUpdated").and_then(Value::as_i64),
        }
    }

    /// Shallow overwrite: fields present in `patch` win, absent ones are kept
    pub fn merge(&mut self, patch: &ReportedProperties) {
        if let Some(status) = &patch.status {
            self.status = Some(status.clone());
        }
        if let Some(updated) = patch.status_updated {
            self.status_updated = Some(updated);
        }
    }

    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(status) = &self.status {
            map.insert("status".to_string(), Value::String(status.clone()));
        }
        if let Some(updated) = self.status_updated {
            map.insert("statusUpdated".to_string(), Value::from(updated));
        }
        map
    }
}

/// Local view of the twin after the last successful sync
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TwinState {
    pub reported: ReportedProperties,
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Reported version the hub assigned to our last patch
    pub version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcilerPhase {
    Idle,
    Fetching,
    Merging,
    Patching,
    Failed,
}

pub struct TwinReconciler {
    state: Mutex<TwinState>,
    phase_tx: watch::Sender<ReconcilerPhase>,
    policy: BackoffPolicy,
    clock: Arc<dyn Clock>,
}

impl TwinReconciler {
    pub fn new(policy: BackoffPolicy, clock: Arc<dyn Clock>) -> Self {
        let (phase_tx, _) = watch::channel(ReconcilerPhase::Idle);
        Self {
            state: Mutex::new(TwinState::default()),
            phase_tx,
            policy,
            clock,
        }
    }

    pub async fn state(&self) -> TwinState {
        self.state.lock().await.clone()
    }

    pub fn phase(&self) -> ReconcilerPhase {
        *self.phase_tx.borrow()
    }

    pub fn watch_phase(&self) -> watch::Receiver<ReconcilerPhase> {
        self.phase_tx.subscribe()
    }

    fn set_phase(&self, phase: ReconcilerPhase) {
        self.phase_tx.send_replace(phase);
    }

    /// Report `status` to the hub, retrying with a fresh fetch on failure.
    /// Syncs are serialized; a second caller waits for the first to finish.
    pub async fn sync_status<T: Transport>(
        &self,
        connection: &Connection<T>,
        status: &str,
    ) -> Result<(), TwinError> {
        let span = twin_span!(status = %status);
        self.sync_status_inner(connection, status)
            .instrument(span)
            .await
    }

    async fn sync_status_inner<T: Transport>(
        &self,
        connection: &Connection<T>,
        status: &str,
    ) -> Result<(), TwinError> {
        let mut state = self.state.lock().await;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = {
                let _gate = connection.gate().read().await;
                self.attempt(&mut state, connection, status).await
            };

            let error = match result {
                Ok(()) => {
                    self.set_phase(ReconcilerPhase::Idle);
                    metrics().twin_synced();
                    info!(
                        target: "twin",
                        attempt,
                        version = state.version,
                        "Reported properties synced"
                    );
                    return Ok(());
                }
                Err(e) => e,
            };

            self.set_phase(ReconcilerPhase::Failed);
            metrics().twin_failed();
            if matches!(error, TwinError::Conflict(_)) {
                metrics().twin_conflict();
            }
            warn!(target: "twin", attempt, error = %error, "Twin sync attempt failed");

            if !error.is_retryable() {
                self.set_phase(ReconcilerPhase::Idle);
                return Err(error);
            }

            match self.policy.next_attempt(attempt, false) {
                RetryDecision::Proceed { delay, .. } => {
                    tokio::time::sleep(delay).await;
                    self.set_phase(ReconcilerPhase::Idle);
                }
                _ => {
                    self.set_phase(ReconcilerPhase::Idle);
                    return Err(error);
                }
            }
        }
    }

    async fn attempt<T: Transport>(
        &self,
        state: &mut TwinState,
        connection: &Connection<T>,
        status: &str,
    ) -> Result<(), TwinError> {
        self.set_phase(ReconcilerPhase::Fetching);
        let snapshot = connection.fetch_twin().await?;

        self.set_phase(ReconcilerPhase::Merging);
        let now = self.clock.now();
        let update = ReportedProperties::with_status(status, now);
        let mut reported = ReportedProperties::from_remote(&snapshot.reported);
        reported.merge(&update);

        let patch = ReportedPatch {
            base_version: snapshot.reported_version,
            properties: update.to_map(),
        };

        self.set_phase(ReconcilerPhase::Patching);
        let version = connection.patch_reported(&patch).await?;

        state.reported = reported;
        state.version = version;
        state.last_synced_at = Some(now);
        Ok(())
    }
}
