//! Simulated IoT device agent - entry point
//!
//! Exit codes: 0 on a signal-initiated shutdown, 1 for configuration
//! errors, 2 when connecting was retried to exhaustion, 3 on internal
//! failures.

use clap::Parser;
use device_agent::agent::{AgentSupervisor, ConnectionState, StdRandomSource, SystemClock};
use device_agent::config::AgentConfig;
use device_agent::error::AgentResult;
use device_agent::observability::{init_default_logging, metrics, HealthServer};
use device_agent::transport::{Credential, DeviceIdentity, HubTransport};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATHS: &[&str] = &["device-agent.toml", "config/device-agent.toml"];

/// Simulated IoT device: telemetry, direct methods and twin sync over X.509 MQTT
#[derive(Parser)]
#[command(name = "device-agent")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "DEVICE_AGENT_CONFIG")]
    config: Option<PathBuf>,

    /// Debug-level logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_default_logging(cli.verbose);

    info!("Starting device-agent v{}", env!("CARGO_PKG_VERSION"));

    match run(cli).await {
        Ok(()) => {
            info!("Shutdown complete");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "device-agent failed");
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> AgentResult<()> {
    let config = load_configuration(cli.config.as_deref())?;

    // Everything below must succeed before any network activity
    let connection_string = config.connection_string()?;
    let identity = DeviceIdentity::from_connection_string(&connection_string)?;
    let credential = Credential::load(&config.credentials)?;
    info!(device = %identity, "Device identity loaded");

    metrics().set_agent_state("initializing");

    let supervisor = AgentSupervisor::new(
        config.clone(),
        identity.clone(),
        credential,
        Arc::new(HubTransport::new()),
        Box::new(StdRandomSource::from_seed(config.telemetry.seed)),
        Arc::new(SystemClock),
    );

    if let Some(port) = config.health.port {
        let health_server = Arc::new(HealthServer::new(
            identity.device_id.clone(),
            port,
            config.telemetry.interval_secs,
        ));
        spawn_health_server(health_server, supervisor.connection().watch_state());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(wait_for_shutdown_signal(shutdown_tx));

    supervisor.run(shutdown_rx).await
}

fn load_configuration(path: Option<&Path>) -> AgentResult<AgentConfig> {
    if let Some(path) = path {
        info!("Loading configuration from: {}", path.display());
        return Ok(AgentConfig::load_from_file(path)?);
    }

    for candidate in DEFAULT_CONFIG_PATHS {
        let candidate = Path::new(candidate);
        if candidate.exists() {
            info!("Loading configuration from: {}", candidate.display());
            return Ok(AgentConfig::load_from_file(candidate)?);
        }
    }

    info!("No configuration file found; using defaults");
    let config = AgentConfig::default();
    config.validate()?;
    Ok(config)
}

fn spawn_health_server(
    health_server: Arc<HealthServer>,
    mut state: watch::Receiver<ConnectionState>,
) {
    let server = health_server.clone();
    tokio::spawn(async move {
        if let Err(e) = server.start().await {
            error!("Health server error: {}", e);
        }
    });

    tokio::spawn(async move {
        loop {
            let connected = *state.borrow_and_update() == ConnectionState::Connected;
            health_server.set_connected(connected);
            if state.changed().await.is_err() {
                break;
            }
        }
    });
}

async fn wait_for_shutdown_signal(shutdown_tx: watch::Sender<bool>) {
    let (mut sigint, mut sigterm) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
    ) {
        (Ok(sigint), Ok(sigterm)) => (sigint, sigterm),
        (Err(e), _) | (_, Err(e)) => {
            warn!(error = %e, "Signal handlers unavailable; falling back to Ctrl-C");
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    shutdown_tx.send_replace(true);
                }
                Err(e) => {
                    error!(error = %e, "Ctrl-C handler unavailable; only termination stops the agent");
                    // Dropping the sender must not read as a shutdown request
                    std::future::pending::<()>().await;
                }
            }
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully..."),
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully..."),
    }
    shutdown_tx.send_replace(true);
}
