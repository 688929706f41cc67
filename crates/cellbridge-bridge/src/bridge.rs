//! Frame forwarding between the telemetry UART and the broker.

use cellbridge_mavlink::{FrameAssembler, FrameHeader, TextCodec, BRIDGE_CODEC};
use cellbridge_metrics::metric_defs;
use cellbridge_modem::{InboundMessage, QoS};
use cellbridge_uart::{Clock, SerialPort, UartError};
use log::{debug, info, trace, warn};

use crate::uplink::Uplink;

/// Topic frames from the telemetry UART are published on.
pub const DEFAULT_TX_TOPIC: &str = "uav4g/mavlink/tx";

/// Topic whose messages are written to the telemetry UART.
pub const DEFAULT_RX_TOPIC: &str = "uav4g/mavlink/rx";

/// Topics and encoding of a [`Bridge`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Uplink topic (UART to MQTT).
    pub tx_topic: String,
    /// Downlink topic (MQTT to UART).
    pub rx_topic: String,
    /// Transport encoding.
    pub codec: TextCodec,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        BridgeConfig {
            tx_topic: DEFAULT_TX_TOPIC.to_string(),
            rx_topic: DEFAULT_RX_TOPIC.to_string(),
            codec: BRIDGE_CODEC,
        }
    }
}

/// Bridge counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames published.
    pub frames_forwarded: u64,
    /// Frames whose publish failed.
    pub publish_failures: u64,
    /// Bytes dropped while resynchronising.
    pub resync_bytes: u64,
    /// Partial frames abandoned after the frame timeout.
    pub frame_timeouts: u64,
    /// Downlink messages written to the UART.
    pub inbound_messages: u64,
    /// Downlink bytes written to the UART.
    pub inbound_bytes: u64,
    /// Downlink messages that produced no write.
    pub inbound_dropped: u64,
}

/// Why a downlink message was not written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DropReason {
    Topic,
    Empty,
    Busy,
    Transport,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Topic => "topic",
            DropReason::Empty => "empty",
            DropReason::Busy => "busy",
            DropReason::Transport => "transport",
        }
    }
}

/// Forwards MAVLink frames between a telemetry port and an [`Uplink`].
///
/// Owns the telemetry port and the frame accumulation state. The uplink is
/// lent to each [`Bridge::process`] call, so the same session can be used for
/// other traffic between ticks.
pub struct Bridge<P: SerialPort, C: Clock> {
    port: P,
    clock: C,
    config: BridgeConfig,
    assembler: FrameAssembler,
    stats: BridgeStats,
}

impl<P: SerialPort, C: Clock> Bridge<P, C> {
    /// Create a bridge over a telemetry port.
    pub fn new(port: P, clock: C, config: BridgeConfig) -> Self {
        info!(
            "MAVLink bridge: UART -> {}, {} -> UART ({})",
            config.tx_topic, config.rx_topic, config.codec
        );
        Bridge {
            port,
            clock,
            config,
            assembler: FrameAssembler::new(),
            stats: BridgeStats::default(),
        }
    }

    /// One bridge tick: read telemetry, publish every complete frame.
    ///
    /// Does nothing while the uplink is down; bytes stay in the UART ring
    /// until it comes back. Returns the number of frames published.
    pub fn process<U: Uplink + ?Sized>(&mut self, uplink: &mut U) -> usize {
        if !uplink.is_connected() {
            return 0;
        }

        let now = self.clock.now_ms();
        let read = self.assembler.fill_from(&mut self.port, now);
        if read > 0 {
            trace!("Telemetry: {} bytes, {} held", read, self.assembler.len());
        }

        let discarded = self.assembler.expire(now);
        if discarded > 0 {
            self.stats.frame_timeouts += 1;
            metrics::counter!(metric_defs::FRAME_TIMEOUTS.name).increment(1);
            return 0;
        }

        let resync_before = self.assembler.stats().resync_bytes;
        let mut forwarded = 0;
        while let Some(frame) = self.assembler.next_frame() {
            if self.forward(uplink, &frame) {
                forwarded += 1;
            }
        }

        let resynced = self.assembler.stats().resync_bytes - resync_before;
        if resynced > 0 {
            debug!("Dropped {} bytes while resynchronising", resynced);
            self.stats.resync_bytes += resynced;
            metrics::counter!(metric_defs::RESYNC_BYTES.name).increment(resynced);
        }
        forwarded
    }

    fn forward<U: Uplink + ?Sized>(&mut self, uplink: &mut U, frame: &[u8]) -> bool {
        if let Ok(header) = FrameHeader::parse(frame) {
            trace!(
                "Frame msgid={} sys={} comp={} seq={} len={}",
                header.message_id,
                header.system_id,
                header.component_id,
                header.sequence,
                frame.len()
            );
        }

        let text = self.config.codec.encode(frame);
        match uplink.publish(&self.config.tx_topic, text.as_bytes(), QoS::AtMostOnce) {
            Ok(()) => {
                self.stats.frames_forwarded += 1;
                metrics::counter!(metric_defs::FRAMES_FORWARDED.name).increment(1);
                metrics::histogram!(metric_defs::FRAME_SIZE.name).record(frame.len() as f64);
                true
            }
            Err(err) => {
                self.stats.publish_failures += 1;
                metrics::counter!(metric_defs::PUBLISH_FAILURES.name).increment(1);
                debug!("Frame of {} bytes not forwarded: {}", frame.len(), err);
                false
            }
        }
    }

    /// Handle a message delivered by the broker.
    ///
    /// Messages on the downlink topic are decoded and written to the
    /// telemetry port as-is. Returns the number of bytes written.
    pub fn on_message(&mut self, message: &InboundMessage) -> usize {
        debug!(
            "Bridge downlink: topic={:?} len={}",
            message.topic,
            message.payload.len()
        );

        if message.topic != self.config.rx_topic {
            warn!("Bridge ignoring topic {:?}", message.topic);
            self.drop_inbound(DropReason::Topic);
            return 0;
        }

        let bytes = self.config.codec.decode(&message.payload);
        if bytes.is_empty() {
            warn!("Downlink message decoded to nothing ({})", self.config.codec);
            self.drop_inbound(DropReason::Empty);
            return 0;
        }

        match self.port.transmit(&bytes) {
            Ok(written) => {
                debug!("Decoded {} bytes to telemetry UART", written);
                self.stats.inbound_messages += 1;
                self.stats.inbound_bytes += written as u64;
                metrics::counter!(metric_defs::INBOUND_BYTES.name).increment(written as u64);
                written
            }
            Err(UartError::Busy) => {
                warn!("Telemetry UART busy, dropping {} downlink bytes", bytes.len());
                self.drop_inbound(DropReason::Busy);
                0
            }
            Err(err) => {
                warn!("Telemetry UART write failed: {}", err);
                self.drop_inbound(DropReason::Transport);
                0
            }
        }
    }

    fn drop_inbound(&mut self, reason: DropReason) {
        self.stats.inbound_dropped += 1;
        metrics::counter!(metric_defs::INBOUND_DROPPED.name, "reason" => reason.as_str())
            .increment(1);
    }

    /// Counters so far.
    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Topics and codec.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Bytes held waiting for the rest of a frame.
    pub fn pending_bytes(&self) -> usize {
        self.assembler.len()
    }

    /// The telemetry port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable access to the telemetry port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: SerialPort, C: Clock> std::fmt::Debug for Bridge<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("config", &self.config)
            .field("pending", &self.assembler.len())
            .field("stats", &self.stats)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.tx_topic, "uav4g/mavlink/tx");
        assert_eq!(config.rx_topic, "uav4g/mavlink/rx");
        assert_eq!(config.codec, BRIDGE_CODEC);
    }

    #[test]
    fn test_drop_reason_labels() {
        assert_eq!(DropReason::Topic.as_str(), "topic");
        assert_eq!(DropReason::Busy.as_str(), "busy");
    }
}
