//! Error types for the modem driver.

use cellbridge_uart::UartError;
use thiserror::Error;

use crate::session::BringUpStep;

/// Why a single command/response exchange failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    /// Neither the expected text nor `ERROR` arrived in time.
    #[error("timed out after {timeout_ms} ms waiting for {expected:?}")]
    Timeout { expected: String, timeout_ms: u64 },

    /// The modem answered `ERROR` before the expected text.
    #[error("modem rejected command while waiting for {expected:?}")]
    Rejected { expected: String },

    /// The transmit path stayed busy past the grace period.
    #[error("transmit path still busy")]
    Busy,

    /// The broker connection dropped while the operation was under way.
    #[error("broker connection lost")]
    ConnectionLost,

    /// The UART refused the transfer.
    #[error("transport error: {0}")]
    Transport(#[from] UartError),
}

/// Result type alias for exchanges.
pub type ExchangeResult<T> = Result<T, ExchangeError>;

/// Errors from session bring-up and management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// Bring-up stopped at a numbered step.
    #[error("bring-up failed at step {} ({step}): {response:?}", step.number())]
    BringUp {
        step: BringUpStep,
        /// Snapshot of the modem output at the time of failure.
        response: String,
    },

    /// A configured value cannot be placed in an AT command.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A standalone exchange failed (certificate upload).
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
}

/// Result type alias for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors from publish/subscribe operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PubSubError {
    /// The session is not connected to the broker. Nothing was sent.
    #[error("not connected to broker")]
    NotConnected,

    /// One stage of the operation failed.
    #[error("{stage} failed: {source}")]
    Failed {
        stage: &'static str,
        source: ExchangeError,
    },

    /// Topic or payload cannot be sent as given. Nothing was sent.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Result type alias for publish/subscribe operations.
pub type PubSubResult<T> = Result<T, PubSubError>;
