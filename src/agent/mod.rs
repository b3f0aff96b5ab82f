//! Device-side agent
//!
//! Components, leaf first:
//!
//! - [`connection`] - the hub session: state machine and bounded operations
//! - [`twin`] - reported-property reconciliation
//! - [`commands`] / [`firmware`] - direct method registry and built-ins
//! - [`telemetry`] / [`scheduler`] - sample synthesis and the periodic loop
//! - [`backoff`] / [`supervisor`] - retry decisions and the lifecycle

pub mod backoff;
pub mod commands;
pub mod connection;
pub mod firmware;
pub mod scheduler;
pub mod supervisor;
pub mod telemetry;
pub mod twin;

pub use backoff::{BackoffPolicy, RetryDecision};
pub use commands::{CommandDescription, CommandDispatcher, CommandHandler};
pub use connection::{Connection, ConnectionState, ConnectionTimeouts};
pub use firmware::{FirmwareUpdateHandler, FirmwareUpdateRequest, FIRMWARE_UPDATE_METHOD};
pub use scheduler::{OfflinePolicy, TelemetryScheduler, TelemetryStats, TickOutcome};
pub use supervisor::{AgentSupervisor, CONNECTED_STATUS};
pub use telemetry::{
    format_message, synthesize, Clock, RandomSource, StdRandomSource, SystemClock,
    TelemetrySample,
};
pub use twin::{ReconcilerPhase, ReportedProperties, TwinReconciler, TwinState};
