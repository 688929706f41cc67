//! Error types for cellbridge-mavlink.

use thiserror::Error;

/// Errors from frame building and text decoding.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Not enough bytes for the structure being read.
    #[error("Truncated frame: need {needed} bytes, have {available}")]
    Truncated {
        /// Bytes required.
        needed: usize,
        /// Bytes present.
        available: usize,
    },

    /// First byte is not the MAVLink v2 magic.
    #[error("Bad magic byte 0x{0:02X}")]
    BadMagic(u8),

    /// Payload does not fit the one-byte length field.
    #[error("Payload too long: {len} bytes (max 255)")]
    PayloadTooLong {
        /// Requested payload length.
        len: usize,
    },

    /// Text that the transport codec cannot decode.
    #[error("Invalid {codec} text: {message}")]
    InvalidText {
        /// Codec name.
        codec: &'static str,
        /// Decoder message.
        message: String,
    },
}

/// Result type for frame operations.
pub type FrameResult<T> = Result<T, FrameError>;
