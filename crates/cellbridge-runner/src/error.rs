//! Error types for the runner.

use cellbridge_modem::SessionError;
use thiserror::Error;

/// Errors that can occur while setting up or running the bridge.
#[derive(Debug, Error)]
pub enum RunnerError {
    /// I/O error (config file, certificate, sockets, threads).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Session setup failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A configuration value is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The Ctrl-C handler could not be installed.
    #[error("signal handler: {0}")]
    Signal(#[from] ctrlc::Error),

    /// A host link could not be opened.
    #[error("{name} link: {message}")]
    Link { name: String, message: String },
}

/// Result type alias for runner operations.
pub type RunnerResult<T> = Result<T, RunnerError>;
