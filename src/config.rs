//! Device agent configuration
//!
//! Configuration is read from an optional TOML file; every section has
//! defaults matching the simulated device (`simulatedNodeDevice`, 60 second
//! cadence, certificates under `certs/`). The hub connection string is never
//! stored in the file: the file names the environment variable that carries
//! it, and a missing variable is a fatal error raised before any network
//! activity.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main agent configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub telemetry: TelemetrySection,
    #[serde(default)]
    pub twin: TwinSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub health: HealthSection,
}

/// Device identity section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSection {
    /// Environment variable containing the hub connection string
    #[serde(default = "default_connection_string_env")]
    pub connection_string_env: String,
}

impl Default for DeviceSection {
    fn default() -> Self {
        Self {
            connection_string_env: default_connection_string_env(),
        }
    }
}

fn default_connection_string_env() -> String {
    "AZURE_IOT_CONN_STRING".to_string()
}

/// Certificate and key locations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    /// Trusted root for the hub's server certificate
    #[serde(default = "default_ca_file")]
    pub ca_file: PathBuf,
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            ca_file: default_ca_file(),
        }
    }
}

fn default_cert_file() -> PathBuf {
    PathBuf::from("certs/device0-cert.pem")
}

fn default_key_file() -> PathBuf {
    PathBuf::from("certs/device0-key.pem")
}

fn default_ca_file() -> PathBuf {
    PathBuf::from("certs/root-ca.pem")
}

/// Telemetry cadence and offline behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetrySection {
    /// `deviceId` written into every telemetry body
    #[serde(default = "default_telemetry_device_id")]
    pub device_id: String,
    /// Seconds between ticks (default: 60)
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Fixed seed for reproducible readings
    pub seed: Option<u64>,
    #[serde(default)]
    pub offline: OfflineSection,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            device_id: default_telemetry_device_id(),
            interval_secs: default_interval_secs(),
            seed: None,
            offline: OfflineSection::default(),
        }
    }
}

impl TelemetrySection {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_telemetry_device_id() -> String {
    "simulatedNodeDevice".to_string()
}

fn default_interval_secs() -> u64 {
    60
}

/// What happens to samples produced while disconnected
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OfflinePolicyKind {
    Drop,
    Buffer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OfflineSection {
    #[serde(default = "default_offline_policy")]
    pub policy: OfflinePolicyKind,
    /// Maximum queued samples when buffering (default: 100)
    #[serde(default = "default_offline_capacity")]
    pub capacity: usize,
}

impl Default for OfflineSection {
    fn default() -> Self {
        Self {
            policy: default_offline_policy(),
            capacity: default_offline_capacity(),
        }
    }
}

fn default_offline_policy() -> OfflinePolicyKind {
    OfflinePolicyKind::Buffer
}

fn default_offline_capacity() -> usize {
    100
}

/// Twin reconciliation retry budget
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TwinSection {
    #[serde(default = "default_twin_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_twin_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for TwinSection {
    fn default() -> Self {
        Self {
            max_attempts: default_twin_attempts(),
            retry_delay_ms: default_twin_retry_delay_ms(),
        }
    }
}

fn default_twin_attempts() -> u32 {
    3
}

fn default_twin_retry_delay_ms() -> u64 {
    1000
}

/// Connect/reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_reconnect_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            max_attempts: default_reconnect_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_reconnect_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// Per-operation timeouts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimeoutsSection {
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    #[serde(default = "default_send_secs")]
    pub send_secs: u64,
    #[serde(default = "default_twin_secs")]
    pub twin_secs: u64,
    /// Bounded wait for in-flight sends and handlers on shutdown
    #[serde(default = "default_shutdown_secs")]
    pub shutdown_secs: u64,
}

impl Default for TimeoutsSection {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            send_secs: default_send_secs(),
            twin_secs: default_twin_secs(),
            shutdown_secs: default_shutdown_secs(),
        }
    }
}

fn default_connect_secs() -> u64 {
    30
}

fn default_send_secs() -> u64 {
    10
}

fn default_twin_secs() -> u64 {
    10
}

fn default_shutdown_secs() -> u64 {
    5
}

/// Optional HTTP health endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HealthSection {
    pub port: Option<u16>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Connection string environment variable not set: {0}")]
    MissingConnectionString(String),
    #[error("Invalid connection string: {0}")]
    InvalidConnectionString(String),
    #[error("Failed to read credential {path}: {source}")]
    CredentialRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AgentConfig {
    /// Bounded wait for in-flight work on shutdown
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.shutdown_secs)
    }

    /// Load configuration from TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AgentConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.telemetry.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "telemetry.interval_secs must be greater than 0".to_string(),
            ));
        }
        if self.telemetry.device_id.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "telemetry.device_id must not be empty".to_string(),
            ));
        }
        if self.telemetry.offline.policy == OfflinePolicyKind::Buffer
            && self.telemetry.offline.capacity == 0
        {
            return Err(ConfigError::InvalidConfig(
                "telemetry.offline.capacity must be greater than 0 when buffering".to_string(),
            ));
        }
        for (name, secs) in [
            ("timeouts.connect_secs", self.timeouts.connect_secs),
            ("timeouts.send_secs", self.timeouts.send_secs),
            ("timeouts.twin_secs", self.timeouts.twin_secs),
        ] {
            if secs == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "{name} must be greater than 0"
                )));
            }
        }
        if self.twin.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "twin.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidConfig(
                "reconnect.max_attempts must be greater than 0".to_string(),
            ));
        }
        if self.reconnect.initial_delay_ms > self.reconnect.max_delay_ms {
            return Err(ConfigError::InvalidConfig(
                "reconnect.initial_delay_ms must not exceed reconnect.max_delay_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Read the hub connection string from the configured environment variable
    pub fn connection_string(&self) -> Result<String, ConfigError> {
        let name = &self.device.connection_string_env;
        match std::env::var(name) {
            Ok(value) if !value.trim().is_empty() => Ok(value),
            _ => Err(ConfigError::MissingConnectionString(name.clone())),
        }
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[device]
connection_string_env = "TEST_DEVICE_CONN_STRING"

[telemetry]
interval_secs = 1
seed = 7

[twin]
retry_delay_ms = 10

[reconnect]
max_attempts = 3
initial_delay_ms = 10
max_delay_ms = 40
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}
