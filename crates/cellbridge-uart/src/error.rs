//! Error types for the UART layer.

use thiserror::Error;

/// Errors that can occur on the UART transmit path.
///
/// The receive path never fails: reads return however many bytes were
/// available, possibly zero.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum UartError {
    /// A previous transmission has not completed yet.
    #[error("transmit path busy")]
    Busy,

    /// The peripheral refused to start the transfer.
    #[error("transfer failed to start: {0}")]
    Transport(String),

    /// The link behind the peripheral has gone away.
    #[error("link closed")]
    Closed,
}

/// Result type alias for UART operations.
pub type UartResult<T> = Result<T, UartError>;
