//! Thread-safe metrics collection system
//!
//! Atomic counters for the connection, telemetry, command and twin paths,
//! exported as a serializable snapshot by the health server.

use once_cell::sync::Lazy;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Global metrics collector instance
pub static METRICS: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);

/// Get reference to global metrics collector
pub fn metrics() -> &'static MetricsCollector {
    &METRICS
}

/// Thread-safe metrics collector using atomics and mutexes
pub struct MetricsCollector {
    // Connection
    connected: AtomicBool,
    connection_attempts: AtomicU64,
    connections_established: AtomicU64,
    connection_failures: AtomicU64,
    connections_lost: AtomicU64,
    reconnects: AtomicU64,
    connection_start_time: AtomicU64,

    // Telemetry
    telemetry_attempts: AtomicU64,
    telemetry_acked: AtomicU64,
    telemetry_failed: AtomicU64,
    telemetry_buffered: AtomicU64,
    telemetry_dropped: AtomicU64,
    last_telemetry: AtomicU64,

    // Commands
    commands_received: AtomicU64,
    commands_succeeded: AtomicU64,
    commands_failed: AtomicU64,

    // Twin
    twin_syncs: AtomicU64,
    twin_failures: AtomicU64,
    twin_conflicts: AtomicU64,

    // Lifecycle
    agent_state: Mutex<String>,
    uptime_start: AtomicU64,
    state_transitions: AtomicU64,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(false),
            connection_attempts: AtomicU64::new(0),
            connections_established: AtomicU64::new(0),
            connection_failures: AtomicU64::new(0),
            connections_lost: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            connection_start_time: AtomicU64::new(0),
            telemetry_attempts: AtomicU64::new(0),
            telemetry_acked: AtomicU64::new(0),
            telemetry_failed: AtomicU64::new(0),
            telemetry_buffered: AtomicU64::new(0),
            telemetry_dropped: AtomicU64::new(0),
            last_telemetry: AtomicU64::new(0),
            commands_received: AtomicU64::new(0),
            commands_succeeded: AtomicU64::new(0),
            commands_failed: AtomicU64::new(0),
            twin_syncs: AtomicU64::new(0),
            twin_failures: AtomicU64::new(0),
            twin_conflicts: AtomicU64::new(0),
            agent_state: Mutex::new("initializing".to_string()),
            uptime_start: AtomicU64::new(current_timestamp()),
            state_transitions: AtomicU64::new(0),
        }
    }

    // Connection metrics
    pub fn connection_attempt(&self) {
        self.connection_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_established(&self) {
        self.connections_established.fetch_add(1, Ordering::Relaxed);
        self.connected.store(true, Ordering::Relaxed);
        self.connection_start_time
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn connection_failed(&self) {
        self.connection_failures.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
        self.connection_start_time.store(0, Ordering::Relaxed);
    }

    pub fn connection_lost(&self) {
        self.connections_lost.fetch_add(1, Ordering::Relaxed);
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connected.store(false, Ordering::Relaxed);
    }

    pub fn reconnected(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    // Telemetry metrics
    pub fn telemetry_attempted(&self) {
        self.telemetry_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_acked(&self) {
        self.telemetry_acked.fetch_add(1, Ordering::Relaxed);
        self.last_telemetry
            .store(current_timestamp(), Ordering::Relaxed);
    }

    pub fn telemetry_failed(&self) {
        self.telemetry_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_buffered(&self) {
        self.telemetry_buffered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn telemetry_dropped(&self) {
        self.telemetry_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Seconds since epoch of the last acknowledged message, 0 if none
    pub fn last_telemetry(&self) -> u64 {
        self.last_telemetry.load(Ordering::Relaxed)
    }

    // Command metrics
    pub fn command_received(&self) {
        self.commands_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn command_completed(&self, success: bool) {
        if success {
            self.commands_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.commands_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    // Twin metrics
    pub fn twin_synced(&self) {
        self.twin_syncs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn twin_failed(&self) {
        self.twin_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn twin_conflict(&self) {
        self.twin_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    // Lifecycle metrics
    pub fn set_agent_state(&self, state: &str) {
        if let Ok(mut current_state) = self.agent_state.lock() {
            if *current_state != state {
                self.state_transitions.fetch_add(1, Ordering::Relaxed);
                *current_state = state.to_string();
            }
        }
    }

    pub fn agent_state(&self) -> String {
        self.agent_state
            .lock()
            .map(|state| state.clone())
            .unwrap_or_else(|_| "unknown".to_string())
    }

    /// Take a consistent-enough snapshot for export
    pub fn get_metrics(&self) -> MetricsSnapshot {
        let now = current_timestamp();
        let connection_start = self.connection_start_time.load(Ordering::Relaxed);
        let connected = self.connected.load(Ordering::Relaxed);

        MetricsSnapshot {
            timestamp: now,
            connection: ConnectionMetrics {
                connected,
                connection_attempts: self.connection_attempts.load(Ordering::Relaxed),
                connections_established: self.connections_established.load(Ordering::Relaxed),
                connection_failures: self.connection_failures.load(Ordering::Relaxed),
                connections_lost: self.connections_lost.load(Ordering::Relaxed),
                reconnects: self.reconnects.load(Ordering::Relaxed),
                connected_seconds: if connected && connection_start > 0 {
                    now.saturating_sub(connection_start)
                } else {
                    0
                },
            },
            telemetry: TelemetryMetrics {
                attempts: self.telemetry_attempts.load(Ordering::Relaxed),
                acked: self.telemetry_acked.load(Ordering::Relaxed),
                failed: self.telemetry_failed.load(Ordering::Relaxed),
                buffered: self.telemetry_buffered.load(Ordering::Relaxed),
                dropped: self.telemetry_dropped.load(Ordering::Relaxed),
                last_acked_at: self.last_telemetry.load(Ordering::Relaxed),
            },
            commands: CommandMetrics {
                received: self.commands_received.load(Ordering::Relaxed),
                succeeded: self.commands_succeeded.load(Ordering::Relaxed),
                failed: self.commands_failed.load(Ordering::Relaxed),
            },
            twin: TwinMetrics {
                syncs: self.twin_syncs.load(Ordering::Relaxed),
                failures: self.twin_failures.load(Ordering::Relaxed),
                conflicts: self.twin_conflicts.load(Ordering::Relaxed),
            },
            lifecycle: LifecycleMetrics {
                state: self.agent_state(),
                uptime_seconds: now.saturating_sub(self.uptime_start.load(Ordering::Relaxed)),
                state_transitions: self.state_transitions.load(Ordering::Relaxed),
            },
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub timestamp: u64,
    pub connection: ConnectionMetrics,
    pub telemetry: TelemetryMetrics,
    pub commands: CommandMetrics,
    pub twin: TwinMetrics,
    pub lifecycle: LifecycleMetrics,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetrics {
    pub connected: bool,
    pub connection_attempts: u64,
    pub connections_established: u64,
    pub connection_failures: u64,
    pub connections_lost: u64,
    pub reconnects: u64,
    pub connected_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TelemetryMetrics {
    pub attempts: u64,
    pub acked: u64,
    pub failed: u64,
    pub buffered: u64,
    pub dropped: u64,
    pub last_acked_at: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandMetrics {
    pub received: u64,
    pub succeeded: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TwinMetrics {
    pub syncs: u64,
    pub failures: u64,
    pub conflicts: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LifecycleMetrics {
    pub state: String,
    pub uptime_seconds: u64,
    pub state_transitions: u64,
}

pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lifecycle_counters() {
        let collector = MetricsCollector::new();
        collector.connection_attempt();
        collector.connection_failed();
        collector.connection_attempt();
        collector.connection_established();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.connection.connection_attempts, 2);
        assert_eq!(snapshot.connection.connection_failures, 1);
        assert_eq!(snapshot.connection.connections_established, 1);
        assert!(snapshot.connection.connected);

        collector.connection_lost();
        let snapshot = collector.get_metrics();
        assert!(!snapshot.connection.connected);
        assert_eq!(snapshot.connection.connections_lost, 1);
    }

    #[test]
    fn test_telemetry_counters() {
        let collector = MetricsCollector::new();
        for _ in 0..5 {
            collector.telemetry_attempted();
        }
        for _ in 0..4 {
            collector.telemetry_acked();
        }
        collector.telemetry_failed();

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.telemetry.attempts, 5);
        assert_eq!(snapshot.telemetry.acked, 4);
        assert_eq!(snapshot.telemetry.failed, 1);
        assert!(snapshot.telemetry.last_acked_at > 0);
    }

    #[test]
    fn test_state_transitions_counted_once_per_change() {
        let collector = MetricsCollector::new();
        collector.set_agent_state("connecting");
        collector.set_agent_state("connecting");
        collector.set_agent_state("running");

        let snapshot = collector.get_metrics();
        assert_eq!(snapshot.lifecycle.state, "running");
        assert_eq!(snapshot.lifecycle.state_transitions, 2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let json = serde_json::to_value(MetricsCollector::new().get_metrics()).unwrap();
        assert!(json["telemetry"]["attempts"].is_u64());
        assert_eq!(json["lifecycle"]["state"], "initializing");
    }
}
