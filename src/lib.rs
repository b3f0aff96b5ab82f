//! Simulated IoT device agent
//!
//! Connects one simulated device to an IoT hub over MQTT with X.509 mutual
//! TLS, publishes synthetic temperature/humidity telemetry on a fixed
//! interval, answers direct methods and keeps a `status` reported property
//! in the device twin up to date across reconnects.
//!
//! # Overview
//!
//! - [`transport`] - the [`Transport`](transport::Transport) seam and the hub MQTT client
//! - [`agent`] - connection, twin reconciler, command dispatcher, telemetry
//!   scheduler and the supervisor that runs them
//! - [`config`] - TOML configuration with defaults
//! - [`observability`] - logging, metrics and the health server
//! - [`testing`] - a scriptable mock hub and deterministic time/randomness
//!
//! # Quick Start
//!
//! ```rust
//! use device_agent::agent::{format_message, synthesize, SystemClock};
//! use device_agent::testing::ScriptedRandom;
//!
//! let mut random = ScriptedRandom::new(vec![32.0, 65.0]);
//! let sample = synthesize("simulatedNodeDevice", &mut random, &SystemClock);
//! let message = format_message(&sample).unwrap();
//!
//! assert_eq!(
//!     message.body_str(),
//!     r#"{"deviceId":"simulatedNodeDevice","temperature":32.0,"humidity":65.0}"#
//! );
//! assert_eq!(message.property("temperatureAlert"), Some("true"));
//! ```

pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod testing;
pub mod transport;

pub use agent::AgentSupervisor;
pub use config::{AgentConfig, ConfigError};
pub use error::{AgentError, AgentResult};
pub use transport::{HubTransport, Transport};
