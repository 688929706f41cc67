//! MAVLink v2 framing for the cellular telemetry bridge.
//!
//! This crate knows just enough about MAVLink to move it across an MQTT
//! broker: where a frame starts, how long it is, and how to turn it into text
//! and back. Message contents are never interpreted.
//!
//! - [`FrameAssembler`] synchronises on the `0xFD` magic byte and extracts
//!   complete frames from a noisy stream.
//! - [`TextCodec`] carries each frame as Base64 or uppercase hex.
//! - [`FrameBuilder`] produces well-formed frames for simulators and tests.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellbridge_mavlink::{FrameAssembler, BRIDGE_CODEC};
//!
//! let mut assembler = FrameAssembler::new();
//! assembler.fill_from(&mut telemetry_uart, clock.now_ms());
//! while let Some(frame) = assembler.next_frame() {
//!     let text = BRIDGE_CODEC.encode(&frame);
//!     // publish `text`
//! }
//! ```

mod assembler;
mod codec;
mod error;
mod frame;

pub use assembler::*;
pub use codec::*;
pub use error::*;
pub use frame::*;
