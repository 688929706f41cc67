//! MAVLink over MQTT.
//!
//! [`Bridge`] reads the telemetry UART, cuts the byte stream into MAVLink v2
//! frames and publishes each one, text-encoded, on the uplink topic. Messages
//! arriving on the downlink topic are decoded and written back to the UART.
//!
//! The bridge is fail-silent: a frame that cannot be published or a message
//! that cannot be written is logged, counted and dropped. Nothing is queued
//! or retried.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellbridge_bridge::{Bridge, BridgeConfig};
//!
//! let mut bridge = Bridge::new(telemetry_uart, clock, BridgeConfig::default());
//! loop {
//!     session.process();
//!     while let Some(msg) = session.next_inbound() {
//!         bridge.on_message(&msg);
//!     }
//!     bridge.process(&mut session);
//! }
//! ```

mod bridge;
mod uplink;

pub use bridge::*;
pub use uplink::*;
