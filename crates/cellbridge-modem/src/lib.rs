//! Driver for the MQTT client built into A7600-series cellular modems.
//!
//! The modem is controlled entirely through line-oriented AT commands on a
//! UART. This crate layers three things on top of a [`cellbridge_uart::SerialPort`]:
//!
//! - [`CommandChannel`]: one command, one expected reply, one deadline.
//! - [`Session`]: the ten-step bring-up from module liveness to a connected
//!   broker session, and teardown.
//! - Publish/subscribe on a connected session, plus parsing of the modem's
//!   unsolicited notifications into [`InboundMessage`]s.
//!
//! # Protocol Overview
//!
//! Commands are ASCII lines terminated by CRLF. The modem answers with
//! optional information lines followed by `OK` or `ERROR`; MQTT operations
//! additionally report `+CMQTT<op>: <client>,<result>` where result 0 means
//! success. Data bodies (topics, payloads, files) are announced by length,
//! prompted with `>`, and sent raw.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellbridge_modem::{MqttConfig, QoS, Session};
//! use cellbridge_uart::SystemClock;
//!
//! let mut session = Session::new(modem_uart, SystemClock::new(), MqttConfig::default());
//! session.connect()?;
//! session.subscribe("uav4g/command", QoS::AtMostOnce)?;
//! session.publish_str("uav4g/status", "online", QoS::AtLeastOnce)?;
//!
//! loop {
//!     session.process();
//!     while let Some(msg) = session.next_inbound() {
//!         println!("{}: {} bytes", msg.topic, msg.payload.len());
//!     }
//! }
//! ```

mod buffer;
mod cert;
mod channel;
mod commands;
mod config;
mod error;
mod pubsub;
mod responses;
mod session;
pub mod sim;

pub use buffer::*;
pub use cert::*;
pub use channel::*;
pub use commands::*;
pub use config::*;
pub use error::*;
pub use pubsub::*;
pub use responses::*;
pub use session::*;
