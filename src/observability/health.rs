//! Health check HTTP server
//!
//! Optional endpoint for supervisors of the simulated device (systemd,
//! container orchestration). Enabled by setting `health.port`.

use crate::observability::metrics::{current_timestamp, metrics};
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use warp::Filter;

/// Telemetry older than this marks the device as stale
const TELEMETRY_STALENESS_FACTOR: u64 = 3;

/// HTTP health check server
pub struct HealthServer {
    device_id: String,
    port: u16,
    telemetry_interval_secs: u64,
    connected: Arc<AtomicBool>,
}

impl HealthServer {
    /// Create new health server
    pub fn new(device_id: String, port: u16, telemetry_interval_secs: u64) -> Self {
        Self {
            device_id,
            port,
            telemetry_interval_secs,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Update hub connection status
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::Relaxed);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    /// Start the HTTP health server
    pub async fn start(self: Arc<Self>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let health_server = self.clone();
        let ready_server = self.clone();

        // GET /health - overall status with component checks
        let health_route = warp::path("health").and(warp::get()).and_then(move || {
            let server = health_server.clone();
            async move {
                let status = server.get_health_status();
                let status_code = if status.status == "healthy" {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&status),
                    status_code,
                ))
            }
        });

        // GET /metrics - complete metrics export
        let metrics_route = warp::path("metrics").and(warp::get()).and_then(|| async move {
            Ok::<_, Infallible>(warp::reply::json(&metrics().get_metrics()))
        });

        // GET /ready - ready once the hub session is up
        let ready_route = warp::path("ready").and(warp::get()).and_then(move || {
            let server = ready_server.clone();
            async move {
                let ready = server.is_connected();
                let response = ReadinessResponse {
                    ready,
                    timestamp: current_timestamp(),
                };
                let status_code = if ready {
                    warp::http::StatusCode::OK
                } else {
                    warp::http::StatusCode::SERVICE_UNAVAILABLE
                };
                Ok::<_, Infallible>(warp::reply::with_status(
                    warp::reply::json(&response),
                    status_code,
                ))
            }
        });

        // GET /live - process liveness
        let live_route = warp::path("live").and(warp::get()).and_then(|| async move {
            let response = LivenessResponse {
                alive: true,
                timestamp: current_timestamp(),
            };
            Ok::<_, Infallible>(warp::reply::json(&response))
        });

        let routes = health_route.or(metrics_route).or(ready_route).or(live_route);

        tracing::info!("Starting health server on port {}", self.port);

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;

        Ok(())
    }

    fn get_health_status(&self) -> HealthStatus {
        let now = current_timestamp();
        let mut checks = HashMap::new();
        checks.insert("hub".to_string(), self.check_hub_health(now));
        checks.insert("telemetry".to_string(), self.check_telemetry_health(now));

        let overall_healthy = checks.values().all(|check| check.status == "healthy");

        HealthStatus {
            status: if overall_healthy { "healthy" } else { "degraded" }.to_string(),
            timestamp: now,
            device_id: self.device_id.clone(),
            uptime_seconds: metrics().get_metrics().lifecycle.uptime_seconds,
            checks,
        }
    }

    fn check_hub_health(&self, now: u64) -> HealthCheck {
        if self.is_connected() {
            HealthCheck {
                status: "healthy".to_string(),
                message: Some("Hub session established".to_string()),
                last_check: now,
            }
        } else {
            HealthCheck {
                status: "unhealthy".to_string(),
                message: Some("Hub session down or reconnecting".to_string()),
                last_check: now,
            }
        }
    }

    fn check_telemetry_health(&self, now: u64) -> HealthCheck {
        evaluate_telemetry_freshness(
            metrics().last_telemetry(),
            now,
            self.telemetry_interval_secs * TELEMETRY_STALENESS_FACTOR,
        )
    }
}

/// Classify telemetry freshness (pure function)
fn evaluate_telemetry_freshness(last_acked: u64, now: u64, threshold_secs: u64) -> HealthCheck {
    if last_acked == 0 {
        HealthCheck {
            status: "healthy".to_string(),
            message: Some("No telemetry acknowledged yet".to_string()),
            last_check: now,
        }
    } else if now.saturating_sub(last_acked) > threshold_secs {
        HealthCheck {
            status: "stale".to_string(),
            message: Some(format!(
                "No telemetry acknowledged for {} seconds",
                now.saturating_sub(last_acked)
            )),
            last_check: now,
        }
    } else {
        HealthCheck {
            status: "healthy".to_string(),
            message: Some("Recent telemetry acknowledged".to_string()),
            last_check: now,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub status: String,
    pub message: Option<String>,
    pub last_check: u64,
}

#[derive(Debug, Serialize)]
struct HealthStatus {
    status: String,
    timestamp: u64,
    device_id: String,
    uptime_seconds: u64,
    checks: HashMap<String, HealthCheck>,
}

#[derive(Debug, Serialize)]
struct ReadinessResponse {
    ready: bool,
    timestamp: u64,
}

#[derive(Debug, Serialize)]
struct LivenessResponse {
    alive: bool,
    timestamp: u64,
}
