//! The bridge's view of the MQTT session.

use cellbridge_modem::{PubSubResult, QoS, Session};
use cellbridge_uart::{Clock, SerialPort};

/// Something frames can be published through.
///
/// Implemented by [`Session`]; tests substitute a recorder.
pub trait Uplink {
    /// Whether publishing is currently possible.
    fn is_connected(&self) -> bool;

    /// Publish `payload` on `topic` without retain.
    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> PubSubResult<()>;
}

impl<P: SerialPort, C: Clock> Uplink for Session<P, C> {
    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> PubSubResult<()> {
        Session::publish(self, topic, payload, qos, false)
    }
}
