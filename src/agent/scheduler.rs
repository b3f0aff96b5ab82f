//! Periodic telemetry loop
//!
//! One tick synthesizes a sample and sends it. Ticks run inline in the loop,
//! so the next one cannot start before the current send has resolved or
//! timed out. Samples produced while the connection is down go through the
//! [`OfflinePolicy`].

use crate::agent::connection::Connection;
use crate::agent::telemetry::{format_message, synthesize, Clock, RandomSource};
use crate::config::{OfflinePolicyKind, OfflineSection};
use crate::error::SendError;
use crate::observability::metrics::metrics;
use crate::telemetry_span;
use crate::transport::{TelemetryMessage, Transport};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};

/// Treatment of samples produced while disconnected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflinePolicy {
    Drop,
    Buffer { capacity: usize },
}

impl From<&OfflineSection> for OfflinePolicy {
    fn from(section: &OfflineSection) -> Self {
        match section.policy {
            OfflinePolicyKind::Drop => OfflinePolicy::Drop,
            OfflinePolicyKind::Buffer => OfflinePolicy::Buffer {
                capacity: section.capacity,
            },
        }
    }
}

/// Counters for one scheduler run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TelemetryStats {
    /// Sends handed to the connection
    pub attempts: u64,
    pub acked: u64,
    pub failed: u64,
    /// Samples queued while offline
    pub buffered: u64,
    /// Samples discarded by the drop policy or evicted from the buffer
    pub dropped: u64,
}

/// What a single tick did with its fresh sample
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Acked { message_id: u64 },
    Failed(SendError),
    Buffered,
    Dropped,
}

pub struct TelemetryScheduler<T: Transport> {
    connection: Arc<Connection<T>>,
    device_id: String,
    interval: Duration,
    random: Box<dyn RandomSource>,
    clock: Arc<dyn Clock>,
    policy: OfflinePolicy,
    backlog: VecDeque<TelemetryMessage>,
    stats: TelemetryStats,
    stats_tx: watch::Sender<TelemetryStats>,
    ticks: u64,
}

impl<T: Transport> TelemetryScheduler<T> {
    pub fn new(
        connection: Arc<Connection<T>>,
        device_id: impl Into<String>,
        interval: Duration,
        random: Box<dyn RandomSource>,
        clock: Arc<dyn Clock>,
        policy: OfflinePolicy,
    ) -> Self {
        let (stats_tx, _) = watch::channel(TelemetryStats::default());
        Self {
            connection,
            device_id: device_id.into(),
            interval,
            random,
            clock,
            policy,
            backlog: VecDeque::new(),
            stats: TelemetryStats::default(),
            stats_tx,
            ticks: 0,
        }
    }

    pub fn stats(&self) -> TelemetryStats {
        self.stats
    }

    /// Observe the counters while the loop runs in another task
    pub fn watch_stats(&self) -> watch::Receiver<TelemetryStats> {
        self.stats_tx.subscribe()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Run until `shutdown` turns true. The first tick fires one interval
    /// after the call.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> TelemetryStats {
        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            target: "telemetry",
            device_id = %self.device_id,
            interval_secs = self.interval.as_secs_f64(),
            "Telemetry scheduler started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        if !self.backlog.is_empty() {
            warn!(
                target: "telemetry",
                pending = self.backlog.len(),
                "Discarding buffered samples on shutdown"
            );
        }
        info!(
            target: "telemetry",
            ticks = self.ticks,
            attempts = self.stats.attempts,
            acked = self.stats.acked,
            failed = self.stats.failed,
            "Telemetry scheduler stopped"
        );
        self.stats
    }

    /// Execute one tick: synthesize, flush any backlog, send
    pub async fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;
        let span = telemetry_span!(device_id = %self.device_id, tick = self.ticks);
        let outcome = self.tick_inner().instrument(span).await;
        self.stats_tx.send_replace(self.stats);
        outcome
    }

    async fn tick_inner(&mut self) -> TickOutcome {
        let sample = synthesize(&self.device_id, self.random.as_mut(), self.clock.as_ref());
        let message = match format_message(&sample) {
            Ok(message) => message,
            Err(e) => {
                error!(target: "telemetry", error = %e, "Failed to encode telemetry body");
                self.stats.failed += 1;
                metrics().telemetry_failed();
                return TickOutcome::Failed(SendError::Rejected(e.to_string()));
            }
        };

        debug!(
            target: "telemetry",
            temperature = sample.temperature,
            humidity = sample.humidity,
            alert = sample.is_alert(),
            "Sample synthesized"
        );

        if !self.connection.is_connected() {
            return self.hold_offline(message);
        }

        if !self.flush_backlog().await {
            return self.hold_offline(message);
        }

        match self.send(&message).await {
            Ok(message_id) => TickOutcome::Acked { message_id },
            Err(SendError::NotConnected) => self.hold_offline(message),
            Err(e) => TickOutcome::Failed(e),
        }
    }

    async fn send(&mut self, message: &TelemetryMessage) -> Result<u64, SendError> {
        self.stats.attempts += 1;
        metrics().telemetry_attempted();

        match self.connection.send(message).await {
            Ok(ack) => {
                self.stats.acked += 1;
                metrics().telemetry_acked();
                info!(target: "telemetry", message_id = ack.message_id, body = %message.body_str(), "Telemetry acknowledged");
                Ok(ack.message_id)
            }
            Err(SendError::NotConnected) => Err(SendError::NotConnected),
            Err(e) => {
                self.stats.failed += 1;
                metrics().telemetry_failed();
                warn!(target: "telemetry", error = %e, "Telemetry send failed");
                Err(e)
            }
        }
    }

    /// Send buffered samples oldest first. Returns false if the link went
    /// down again before the backlog was drained.
    async fn flush_backlog(&mut self) -> bool {
        if self.backlog.is_empty() {
            return true;
        }
        info!(target: "telemetry", pending = self.backlog.len(), "Flushing buffered telemetry");

        while let Some(message) = self.backlog.pop_front() {
            match self.send(&message).await {
                Ok(_) => {}
                Err(SendError::NotConnected) => {
                    self.backlog.push_front(message);
                    return false;
                }
                // Already counted as failed; the sample is not retried
                Err(_) => {}
            }
        }
        true
    }

    fn hold_offline(&mut self, message: TelemetryMessage) -> TickOutcome {
        match self.policy {
            OfflinePolicy::Drop => {
                self.stats.dropped += 1;
                metrics().telemetry_dropped();
                warn!(target: "telemetry", "Not connected; dropping sample");
                TickOutcome::Dropped
            }
            OfflinePolicy::Buffer { capacity } => {
                if self.backlog.len() >= capacity {
                    self.backlog.pop_front();
                    self.stats.dropped += 1;
                    metrics().telemetry_dropped();
                    warn!(target: "telemetry", capacity, "Offline buffer full; evicting oldest sample");
                }
                self.backlog.push_back(message);
                self.stats.buffered += 1;
                metrics().telemetry_buffered();
                debug!(target: "telemetry", pending = self.backlog.len(), "Not connected; sample buffered");
                TickOutcome::Buffered
            }
        }
    }
}
