//! Device lifecycle
//!
//! Connects with backoff, wires the command dispatcher, reports
//! `status = "connected"` to the twin, starts the telemetry scheduler and
//! then watches the link. A drop triggers a reconnect (holding the
//! connection's gate so no twin attempt overlaps it) followed by exactly one
//! twin re-sync. Shutdown stops the scheduler and dispatcher within bounded
//! waits before disconnecting.

use crate::agent::backoff::{BackoffPolicy, RetryDecision};
use crate::agent::commands::CommandDispatcher;
use crate::agent::connection::{Connection, ConnectionTimeouts};
use crate::agent::firmware::{FirmwareUpdateHandler, FIRMWARE_UPDATE_METHOD};
use crate::agent::scheduler::{OfflinePolicy, TelemetryScheduler, TelemetryStats};
use crate::agent::telemetry::{Clock, RandomSource};
use crate::agent::twin::TwinReconciler;
use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult, ConnectError};
use crate::lifecycle_span;
use crate::observability::metrics::metrics;
use crate::transport::{CommandInvocation, Credential, DeviceIdentity, LinkState, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn, Instrument};

/// Status reported to the twin after every successful (re)connect
pub const CONNECTED_STATUS: &str = "connected";

const COMMAND_QUEUE_DEPTH: usize = 32;

pub struct AgentSupervisor<T: Transport + 'static> {
    config: AgentConfig,
    connection: Arc<Connection<T>>,
    dispatcher: Arc<CommandDispatcher>,
    reconciler: Arc<TwinReconciler>,
    random: Box<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    connect_policy: BackoffPolicy,
}

impl<T: Transport + 'static> AgentSupervisor<T> {
    pub fn new(
        config: AgentConfig,
        identity: DeviceIdentity,
        credential: Credential,
        transport: Arc<T>,
        random: Box<dyn RandomSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let connection = Arc::new(Connection::new(
            identity,
            credential,
            transport,
            ConnectionTimeouts::from(&config.timeouts),
        ));

        let dispatcher = Arc::new(CommandDispatcher::new(config.shutdown_timeout()));
        dispatcher.register(FIRMWARE_UPDATE_METHOD, Arc::new(FirmwareUpdateHandler::new()));

        let reconciler = Arc::new(TwinReconciler::new(
            BackoffPolicy::twin(&config.twin),
            clock.clone(),
        ));

        Self {
            connect_policy: BackoffPolicy::reconnect(&config.reconnect),
            config,
            connection,
            dispatcher,
            reconciler,
            random,
            clock,
        }
    }

    pub fn connection(&self) -> Arc<Connection<T>> {
        self.connection.clone()
    }

    /// Register additional direct methods before calling [`run`](Self::run)
    pub fn dispatcher(&self) -> Arc<CommandDispatcher> {
        self.dispatcher.clone()
    }

    pub fn reconciler(&self) -> Arc<TwinReconciler> {
        self.reconciler.clone()
    }

    /// Run until `shutdown` turns true or reconnection is exhausted
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        let span = lifecycle_span!(device = %self.connection.identity());
        self.run_inner(shutdown).instrument(span).await
    }

    async fn run_inner(self, mut shutdown: watch::Receiver<bool>) -> AgentResult<()> {
        metrics().set_agent_state("connecting");
        info!(target: "supervisor", "Starting device agent");

        if !self.connect_with_backoff(&mut shutdown).await? {
            info!(target: "supervisor", "Shutdown requested before the first connection");
            self.connection.disconnect().await;
            metrics().set_agent_state("stopped");
            return Ok(());
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        self.connection.on_inbound_command(command_tx.clone());
        let dispatcher_task = tokio::spawn(self.dispatcher.clone().run(command_rx, stop_rx.clone()));

        self.sync_twin(&mut shutdown).await;

        let scheduler = TelemetryScheduler::new(
            self.connection.clone(),
            self.config.telemetry.device_id.clone(),
            self.config.telemetry.interval(),
            self.random,
            self.clock.clone(),
            OfflinePolicy::from(&self.config.telemetry.offline),
        );
        let scheduler_task = tokio::spawn(scheduler.run(stop_rx));

        metrics().set_agent_state("running");
        info!(target: "supervisor", "Device agent running");

        let supervisor = Supervision {
            connection: &self.connection,
            reconciler: &self.reconciler,
            connect_policy: &self.connect_policy,
        };
        let result = supervisor.watch_link(&mut shutdown, &command_tx).await;

        metrics().set_agent_state("stopping");
        info!(target: "supervisor", "Stopping device agent");
        stop_tx.send_replace(true);
        drop(command_tx);

        let grace = self.config.shutdown_timeout();
        match await_bounded(scheduler_task, grace).await {
            Some(stats) => log_final_stats(&stats),
            None => warn!(target: "supervisor", "Telemetry scheduler did not stop in time"),
        }
        // The dispatcher drains for up to `grace` itself
        if await_bounded(dispatcher_task, grace + grace).await.is_none() {
            warn!(target: "supervisor", "Command dispatcher did not stop in time");
        }

        self.connection.disconnect().await;
        metrics().set_agent_state("stopped");

        if let Err(e) = &result {
            error!(target: "supervisor", error = %e, "Device agent stopped with error");
        } else {
            info!(target: "supervisor", "Device agent stopped");
        }
        result
    }

    async fn connect_with_backoff(&self, shutdown: &mut watch::Receiver<bool>) -> AgentResult<bool> {
        connect_with_backoff(&self.connection, &self.connect_policy, shutdown).await
    }

    async fn sync_twin(&self, shutdown: &mut watch::Receiver<bool>) {
        sync_twin(&self.connection, &self.reconciler, shutdown).await
    }
}

/// Borrowed view used once the scheduler has taken ownership of its parts
struct Supervision<'a, T: Transport> {
    connection: &'a Arc<Connection<T>>,
    reconciler: &'a Arc<TwinReconciler>,
    connect_policy: &'a BackoffPolicy,
}

impl<T: Transport> Supervision<'_, T> {
    async fn watch_link(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        command_tx: &mpsc::Sender<CommandInvocation>,
    ) -> AgentResult<()> {
        let mut link = self.connection.link_state();
        // The link may already have dropped during the initial twin sync
        let initial = link.borrow_and_update().clone();
        if let LinkState::Down(reason) = initial {
            self.recover(reason, &mut link, shutdown, command_tx).await?;
        }

        loop {
            tokio::select! {
                _ = shutdown_requested(shutdown) => break,
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(AgentError::internal("transport link watch closed"));
                    }
                    let state = link.borrow_and_update().clone();
                    if let LinkState::Down(reason) = state {
                        self.recover(reason, &mut link, shutdown, command_tx).await?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Reconnect after a drop, then re-sync the twin once. Loops only while
    /// the new session is already down again.
    async fn recover(
        &self,
        mut reason: String,
        link: &mut watch::Receiver<LinkState>,
        shutdown: &mut watch::Receiver<bool>,
        command_tx: &mpsc::Sender<CommandInvocation>,
    ) -> AgentResult<()> {
        while self.connection.mark_dropped(&reason) {
            metrics().set_agent_state("reconnecting");
            let span = lifecycle_span!(event = "reconnect", reason = %reason);

            let connected = async {
                let _gate = self.connection.gate().write().await;
                connect_with_backoff(self.connection, self.connect_policy, shutdown).await
            }
            .instrument(span)
            .await?;

            if !connected {
                return Ok(());
            }

            self.connection.on_inbound_command(command_tx.clone());
            metrics().reconnected();

            let current = link.borrow_and_update().clone();
            match current {
                LinkState::Up => {
                    info!(target: "supervisor", "Reconnected; re-syncing twin");
                    sync_twin(self.connection, self.reconciler, shutdown).await;
                    metrics().set_agent_state("running");
                    return Ok(());
                }
                LinkState::Down(next) => reason = next,
            }
        }
        Ok(())
    }
}

/// Returns `Ok(false)` when shutdown interrupted the attempts
async fn connect_with_backoff<T: Transport>(
    connection: &Connection<T>,
    policy: &BackoffPolicy,
    shutdown: &mut watch::Receiver<bool>,
) -> AgentResult<bool> {
    let mut failures = 0;
    let mut last_error: Option<ConnectError> = None;

    loop {
        let stopping = *shutdown.borrow();
        match policy.next_attempt(failures, stopping) {
            RetryDecision::Proceed { attempt, delay } => {
                if !delay.is_zero() {
                    info!(
                        target: "supervisor",
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Waiting before next connection attempt"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = shutdown_requested(shutdown) => return Ok(false),
                    }
                }

                match connection.connect().await {
                    Ok(()) => return Ok(true),
                    Err(e) => {
                        failures += 1;
                        last_error = Some(e);
                    }
                }
            }
            RetryDecision::AbortShutdownRequested => return Ok(false),
            RetryDecision::AbortMaxAttemptsExceeded => {
                let last = last_error.unwrap_or_else(|| {
                    ConnectError::NetworkUnreachable("no connection attempt made".to_string())
                });
                error!(target: "supervisor", attempts = failures, error = %last, "Giving up on connecting");
                return Err(AgentError::ConnectExhausted {
                    attempts: failures,
                    last,
                });
            }
        }
    }
}

/// Report the connected status. Failure is logged and skipped.
async fn sync_twin<T: Transport>(
    connection: &Connection<T>,
    reconciler: &TwinReconciler,
    shutdown: &mut watch::Receiver<bool>,
) {
    tokio::select! {
        result = reconciler.sync_status(connection, CONNECTED_STATUS) => {
            if let Err(e) = result {
                warn!(target: "supervisor", error = %e, "Twin sync failed; continuing without it");
            }
        }
        _ = shutdown_requested(shutdown) => {
            info!(target: "supervisor", "Twin sync interrupted by shutdown");
        }
    }
}

/// Resolves once shutdown is requested. A dropped sender never requests it.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn await_bounded<R>(mut handle: JoinHandle<R>, grace: Duration) -> Option<R> {
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            error!(target: "supervisor", error = %e, "Task ended abnormally");
            None
        }
        Err(_) => {
            handle.abort();
            None
        }
    }
}

fn log_final_stats(stats: &TelemetryStats) {
    info!(
        target: "supervisor",
        attempts = stats.attempts,
        acked = stats.acked,
        failed = stats.failed,
        buffered = stats.buffered,
        dropped = stats.dropped,
        "Telemetry totals"
    );
}
