//! Host runner for the cellbridge bridge.
//!
//! Wires a modem link and a telemetry link (TCP serial streams or the
//! built-in simulators) into an [`App`] supervisor:
//!
//! - [`config`]: YAML configuration with firmware defaults.
//! - [`host`]: TCP-backed UART ports and link selection.
//! - [`telemetry`]: simulated autopilot producing heartbeat frames.
//! - [`app`]: bring-up, retry policy, status publishing and the bridge tick.

pub mod app;
pub mod config;
pub mod error;
pub mod host;
pub mod telemetry;

pub use app::{App, AppState, StatusReport};
pub use config::{LinkConfig, LinkSpec, RunnerConfig, TimingConfig, TlsConfig, TopicConfig};
pub use error::{RunnerError, RunnerResult};
pub use host::{open_modem, open_telemetry, HostPort, LinkGuard, TcpLink, TcpUart};
pub use telemetry::{sim_telemetry, HeartbeatSource, LoggingTx, SimTelemetryUart};
