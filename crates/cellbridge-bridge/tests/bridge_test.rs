//! Bridge behaviour against a recording uplink and against the simulated
//! modem session.

use std::sync::{Arc, Mutex};

use cellbridge_bridge::{Bridge, BridgeConfig, Uplink, DEFAULT_RX_TOPIC, DEFAULT_TX_TOPIC};
use cellbridge_mavlink::{FrameBuilder, Heartbeat, Signature, BRIDGE_CODEC};
use cellbridge_modem::sim::sim_uart;
use cellbridge_modem::{InboundMessage, MqttConfig, PubSubError, PubSubResult, QoS, Session};
use cellbridge_uart::{
    dma_channel, DmaRegion, DmaWriter, MockClock, TxComplete, TxDma, UartDma, UartResult,
    RX_BUFFER_SIZE,
};

/// Telemetry transmit engine that records writes. With `hold` set it never
/// signals completion, leaving the port busy after the first write.
#[derive(Clone, Default)]
struct RecordingTx {
    writes: Arc<Mutex<Vec<Vec<u8>>>>,
    hold: bool,
}

impl RecordingTx {
    fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().expect("lock").clone()
    }
}

impl TxDma for RecordingTx {
    fn start(&mut self, data: &[u8], done: TxComplete) -> UartResult<()> {
        self.writes.lock().expect("lock").push(data.to_vec());
        if !self.hold {
            done.signal();
        }
        Ok(())
    }
}

type TelemetryUart = UartDma<DmaRegion, RecordingTx>;

fn telemetry(tx: RecordingTx) -> (TelemetryUart, DmaWriter) {
    let (writer, region) = dma_channel(RX_BUFFER_SIZE);
    (UartDma::new(region, tx), writer)
}

#[derive(Default)]
struct RecordingUplink {
    connected: bool,
    fail: bool,
    published: Vec<(String, Vec<u8>, QoS)>,
}

impl Uplink for RecordingUplink {
    fn is_connected(&self) -> bool {
        self.connected
    }

    fn publish(&mut self, topic: &str, payload: &[u8], qos: QoS) -> PubSubResult<()> {
        if self.fail {
            return Err(PubSubError::NotConnected);
        }
        self.published.push((topic.to_string(), payload.to_vec(), qos));
        Ok(())
    }
}

fn connected_uplink() -> RecordingUplink {
    RecordingUplink {
        connected: true,
        ..RecordingUplink::default()
    }
}

fn heartbeat(builder: &mut FrameBuilder) -> Vec<u8> {
    builder
        .heartbeat(&Heartbeat {
            custom_mode: 0,
            mav_type: 1,
            autopilot: 3,
            base_mode: 0x59,
            system_status: 3,
        })
        .to_vec()
}

#[test]
fn test_forwards_frames_after_garbage() {
    let mut builder = FrameBuilder::new(1, 1);
    let unsigned = heartbeat(&mut builder);
    let signed = builder
        .build_signed(
            42,
            &[],
            0,
            Signature {
                link_id: 0,
                timestamp: 1,
                signature: [0; 6],
            },
        )
        .expect("frame")
        .to_vec();

    let (uart, writer) = telemetry(RecordingTx::default());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());
    let mut uplink = connected_uplink();

    writer.push(&[0x77]);
    writer.push(&unsigned);
    writer.push(&signed);

    assert_eq!(bridge.process(&mut uplink), 2);

    assert_eq!(
        uplink.published,
        vec![
            (
                DEFAULT_TX_TOPIC.to_string(),
                BRIDGE_CODEC.encode(&unsigned).into_bytes(),
                QoS::AtMostOnce
            ),
            (
                DEFAULT_TX_TOPIC.to_string(),
                BRIDGE_CODEC.encode(&signed).into_bytes(),
                QoS::AtMostOnce
            ),
        ]
    );
    let stats = bridge.stats();
    assert_eq!(stats.frames_forwarded, 2);
    assert_eq!(stats.resync_bytes, 1);
    assert_eq!(bridge.pending_bytes(), 0);
}

#[test]
fn test_idle_while_uplink_down() {
    let mut builder = FrameBuilder::new(1, 1);
    let (uart, writer) = telemetry(RecordingTx::default());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());
    let mut uplink = RecordingUplink::default();

    writer.push(&heartbeat(&mut builder));
    assert_eq!(bridge.process(&mut uplink), 0);
    assert_eq!(bridge.pending_bytes(), 0);

    // Bytes waited in the ring and go out once the uplink is back.
    uplink.connected = true;
    assert_eq!(bridge.process(&mut uplink), 1);
}

#[test]
fn test_partial_frame_across_ticks() {
    let mut builder = FrameBuilder::new(1, 1);
    let frame = heartbeat(&mut builder);
    let clock = MockClock::new();
    let (uart, writer) = telemetry(RecordingTx::default());
    let mut bridge = Bridge::new(uart, clock.clone(), BridgeConfig::default());
    let mut uplink = connected_uplink();

    writer.push(&frame[..10]);
    assert_eq!(bridge.process(&mut uplink), 0);
    assert_eq!(bridge.pending_bytes(), 10);

    clock.advance(30);
    writer.push(&frame[10..]);
    assert_eq!(bridge.process(&mut uplink), 1);
    assert_eq!(uplink.published[0].1, BRIDGE_CODEC.encode(&frame).into_bytes());
}

#[test]
fn test_stalled_partial_frame_discarded() {
    let mut builder = FrameBuilder::new(1, 1);
    let stalled = heartbeat(&mut builder);
    let next = heartbeat(&mut builder);
    let clock = MockClock::new();
    let (uart, writer) = telemetry(RecordingTx::default());
    let mut bridge = Bridge::new(uart, clock.clone(), BridgeConfig::default());
    let mut uplink = connected_uplink();

    writer.push(&stalled[..12]);
    bridge.process(&mut uplink);

    clock.advance(51);
    assert_eq!(bridge.process(&mut uplink), 0);
    assert_eq!(bridge.pending_bytes(), 0);
    assert_eq!(bridge.stats().frame_timeouts, 1);

    writer.push(&next);
    assert_eq!(bridge.process(&mut uplink), 1);
    assert_eq!(uplink.published.len(), 1);
    assert_eq!(uplink.published[0].1, BRIDGE_CODEC.encode(&next).into_bytes());
}

#[test]
fn test_publish_failure_drops_frame() {
    let mut builder = FrameBuilder::new(1, 1);
    let (uart, writer) = telemetry(RecordingTx::default());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());
    let mut uplink = RecordingUplink {
        connected: true,
        fail: true,
        ..RecordingUplink::default()
    };

    writer.push(&heartbeat(&mut builder));
    assert_eq!(bridge.process(&mut uplink), 0);
    assert_eq!(bridge.stats().publish_failures, 1);
    assert_eq!(bridge.pending_bytes(), 0);

    // Not retried on the next tick.
    uplink.fail = false;
    assert_eq!(bridge.process(&mut uplink), 0);
    assert!(uplink.published.is_empty());
}

#[test]
fn test_downlink_written_to_uart() {
    let mut builder = FrameBuilder::new(255, 190);
    let frame = heartbeat(&mut builder);
    let tx = RecordingTx::default();
    let (uart, _writer) = telemetry(tx.clone());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());

    let message = InboundMessage {
        topic: DEFAULT_RX_TOPIC.to_string(),
        payload: BRIDGE_CODEC.encode(&frame).into_bytes(),
    };
    assert_eq!(bridge.on_message(&message), frame.len());

    assert_eq!(tx.writes(), vec![frame.clone()]);
    let stats = bridge.stats();
    assert_eq!(stats.inbound_messages, 1);
    assert_eq!(stats.inbound_bytes, frame.len() as u64);
}

#[test]
fn test_downlink_other_topic_ignored() {
    let tx = RecordingTx::default();
    let (uart, _writer) = telemetry(tx.clone());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());

    let message = InboundMessage {
        topic: "uav4g/command".to_string(),
        payload: BRIDGE_CODEC.encode(b"\xfd\x00").into_bytes(),
    };
    assert_eq!(bridge.on_message(&message), 0);
    assert!(tx.writes().is_empty());
    assert_eq!(bridge.stats().inbound_dropped, 1);
}

#[test]
fn test_downlink_undecodable_writes_nothing() {
    let tx = RecordingTx::default();
    let (uart, _writer) = telemetry(tx.clone());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());

    for payload in [&b""[..], &b"***"[..], &b"Z"[..]] {
        let message = InboundMessage {
            topic: DEFAULT_RX_TOPIC.to_string(),
            payload: payload.to_vec(),
        };
        assert_eq!(bridge.on_message(&message), 0);
    }
    assert!(tx.writes().is_empty());
    assert_eq!(bridge.stats().inbound_dropped, 3);
}

#[test]
fn test_downlink_dropped_while_uart_busy() {
    let tx = RecordingTx {
        hold: true,
        ..RecordingTx::default()
    };
    let (uart, _writer) = telemetry(tx.clone());
    let mut bridge = Bridge::new(uart, MockClock::new(), BridgeConfig::default());
    let message = InboundMessage {
        topic: DEFAULT_RX_TOPIC.to_string(),
        payload: BRIDGE_CODEC.encode(b"\xfd\x01\x02").into_bytes(),
    };

    assert_eq!(bridge.on_message(&message), 3);
    assert_eq!(bridge.on_message(&message), 0);

    assert_eq!(tx.writes().len(), 1);
    assert_eq!(bridge.stats().inbound_dropped, 1);
}

#[test]
fn test_round_trip_through_simulated_modem() {
    let (modem, sim) = sim_uart();
    let clock = MockClock::new();
    let config = MqttConfig {
        use_ssl: false,
        ..MqttConfig::default()
    };
    let mut session = Session::new(modem, clock.clone(), config);
    session.connect().expect("bring-up");
    session
        .subscribe(DEFAULT_RX_TOPIC, QoS::AtMostOnce)
        .expect("subscribe");

    let tx = RecordingTx::default();
    let (uart, writer) = telemetry(tx.clone());
    let mut bridge = Bridge::new(uart, clock, BridgeConfig::default());

    // Uplink: telemetry frame to the broker.
    let mut builder = FrameBuilder::new(1, 1);
    let frame = heartbeat(&mut builder);
    writer.push(&frame);
    assert_eq!(bridge.process(&mut session), 1);

    let published = sim.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].topic, DEFAULT_TX_TOPIC);
    assert_eq!(published[0].payload, BRIDGE_CODEC.encode(&frame).into_bytes());
    assert_eq!(published[0].qos, 0);

    // Downlink: broker message to the telemetry UART.
    let command = heartbeat(&mut builder);
    sim.inject_message(DEFAULT_RX_TOPIC, BRIDGE_CODEC.encode(&command).as_bytes());
    session.process();
    let message = session.next_inbound().expect("downlink message");
    bridge.on_message(&message);

    assert_eq!(tx.writes(), vec![command]);
}
