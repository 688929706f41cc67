//! Simulated flight controller for the telemetry link.
//!
//! [`HeartbeatSource`] pushes a MAVLink v2 HEARTBEAT into the receive ring
//! at a fixed interval, as an autopilot would. Frames written back by the
//! bridge go to a [`LoggingTx`] that only logs them.

use cellbridge_mavlink::{FrameBuilder, FrameHeader, Heartbeat};
use cellbridge_uart::{
    dma_channel, DmaRegion, DmaWriter, TxComplete, TxDma, UartDma, UartResult, RX_BUFFER_SIZE,
};
use tracing::{debug, trace};

/// Heartbeat period of the simulated autopilot.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1000;

/// System id the simulated autopilot uses.
pub const SIM_SYSTEM_ID: u8 = 1;

/// Component id of the autopilot.
pub const SIM_COMPONENT_ID: u8 = 1;

/// Transmit engine that logs what the bridge writes to the telemetry port.
#[derive(Debug, Default)]
pub struct LoggingTx {
    transfers: u64,
    bytes: u64,
}

impl LoggingTx {
    /// Transfers seen.
    pub fn transfers(&self) -> u64 {
        self.transfers
    }

    /// Bytes seen.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl TxDma for LoggingTx {
    fn start(&mut self, data: &[u8], done: TxComplete) -> UartResult<()> {
        self.transfers += 1;
        self.bytes += data.len() as u64;
        match FrameHeader::parse(data) {
            Ok(header) => debug!(
                "Autopilot received msgid={} from sys={} comp={} ({} bytes)",
                header.message_id,
                header.system_id,
                header.component_id,
                data.len()
            ),
            Err(_) => debug!("Autopilot received {} unframed bytes", data.len()),
        }
        done.signal();
        Ok(())
    }
}

/// The telemetry UART of the simulated link.
pub type SimTelemetryUart = UartDma<DmaRegion, LoggingTx>;

/// Produces heartbeat frames into a telemetry receive ring.
#[derive(Debug)]
pub struct HeartbeatSource {
    writer: DmaWriter,
    builder: FrameBuilder,
    heartbeat: Heartbeat,
    interval_ms: u64,
    next_due_ms: u64,
    sent: u64,
}

impl HeartbeatSource {
    /// Create a source writing into `writer`. The first heartbeat is due
    /// immediately.
    pub fn new(writer: DmaWriter, interval_ms: u64) -> Self {
        HeartbeatSource {
            writer,
            builder: FrameBuilder::new(SIM_SYSTEM_ID, SIM_COMPONENT_ID),
            // Quadrotor, ArduPilot, custom mode enabled, standby.
            heartbeat: Heartbeat {
                custom_mode: 0,
                mav_type: 2,
                autopilot: 3,
                base_mode: 0x51,
                system_status: 3,
            },
            interval_ms,
            next_due_ms: 0,
            sent: 0,
        }
    }

    /// Emit a heartbeat if one is due. Returns whether a frame was written.
    pub fn tick(&mut self, now_ms: u64) -> bool {
        if now_ms < self.next_due_ms {
            return false;
        }
        let frame = self.builder.heartbeat(&self.heartbeat);
        trace!("Autopilot heartbeat seq={}", frame[4]);
        self.writer.push(&frame);
        self.next_due_ms = now_ms + self.interval_ms;
        self.sent += 1;
        true
    }

    /// Heartbeats written so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// A telemetry UART fed by a fresh [`HeartbeatSource`].
pub fn sim_telemetry(interval_ms: u64) -> (SimTelemetryUart, HeartbeatSource) {
    let (writer, region) = dma_channel(RX_BUFFER_SIZE);
    (
        UartDma::new(region, LoggingTx::default()),
        HeartbeatSource::new(writer, interval_ms),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbridge_mavlink::{FrameAssembler, HEARTBEAT_ID};
    use cellbridge_uart::SerialPort;

    #[test]
    fn test_heartbeat_interval() {
        let (uart, mut source) = sim_telemetry(1000);
        assert!(source.tick(0));
        assert!(!source.tick(999));
        assert!(source.tick(1000));
        assert_eq!(source.sent(), 2);
        assert_eq!(uart.available(), 42);
    }

    #[test]
    fn test_heartbeats_parse() {
        let (mut uart, mut source) = sim_telemetry(10);
        source.tick(0);
        source.tick(10);

        let mut asm = FrameAssembler::new();
        asm.fill_from(&mut uart, 10);
        let first = asm.next_frame().expect("first frame");
        let second = asm.next_frame().expect("second frame");

        let a = FrameHeader::parse(&first).expect("header");
        let b = FrameHeader::parse(&second).expect("header");
        assert_eq!(a.message_id, HEARTBEAT_ID);
        assert_eq!(a.system_id, SIM_SYSTEM_ID);
        assert_eq!(b.sequence, a.sequence.wrapping_add(1));
    }

    #[test]
    fn test_downlink_logged() {
        let (mut uart, _source) = sim_telemetry(1000);
        uart.transmit(&[0xFD, 0x00]).expect("transmit");
        assert!(!uart.is_tx_busy());
        assert_eq!(uart.tx_engine().transfers(), 1);
        assert_eq!(uart.tx_engine().bytes(), 2);
    }
}
