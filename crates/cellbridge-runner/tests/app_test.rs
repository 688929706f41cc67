//! Supervisor behaviour against the simulated modem and autopilot.
//!
//! All timing runs on a [`MockClock`]: bring-up delays and retry intervals
//! elapse instantly.

use cellbridge_mavlink::{FrameBuilder, Heartbeat, BRIDGE_CODEC};
use cellbridge_modem::sim::{sim_uart, Reply, SimHandle, SimUart};
use cellbridge_runner::{
    sim_telemetry, App, AppState, HeartbeatSource, RunnerConfig, SimTelemetryUart,
};
use cellbridge_uart::{Clock, MockClock};

type SimApp = App<SimUart, SimTelemetryUart, MockClock>;

fn plain_config() -> RunnerConfig {
    let mut config = RunnerConfig::default();
    config.mqtt.use_ssl = false;
    config
}

fn sim_app(config: &RunnerConfig) -> (SimApp, SimHandle, HeartbeatSource, MockClock) {
    let (modem, sim) = sim_uart();
    let (telemetry, source) = sim_telemetry(1000);
    let clock = MockClock::new();
    let app = App::new(modem, telemetry, clock.clone(), config).expect("valid config");
    (app, sim, source, clock)
}

/// Start the supervisor and let the first bring-up attempt run.
fn bring_up(app: &mut SimApp, clock: &MockClock) {
    app.tick();
    assert_eq!(app.state(), AppState::WaitModule);
    app.tick();
    assert_eq!(app.state(), AppState::WaitModule, "attempt before the delay");

    clock.advance(5000);
    app.tick();
}

fn published_on(sim: &SimHandle, topic: &str) -> Vec<(Vec<u8>, u8)> {
    sim.published()
        .into_iter()
        .filter(|m| m.topic == topic)
        .map(|m| (m.payload, m.qos))
        .collect()
}

#[test]
fn test_connect_subscribes_and_announces() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);

    assert_eq!(app.state(), AppState::Connected);
    assert!(app.is_connected());
    assert_eq!(app.error_count(), 0);

    let subscriptions = sim.subscriptions();
    assert!(subscriptions.contains(&"uav4g/command".to_string()));
    assert!(subscriptions.contains(&"uav4g/mavlink/rx".to_string()));

    assert_eq!(
        published_on(&sim, "uav4g/status"),
        vec![(b"online".to_vec(), 1)]
    );
}

#[test]
fn test_heartbeat_interval() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);
    sim.clear_log();

    app.tick();
    let reports = published_on(&sim, "uav4g/sensor");
    assert_eq!(reports.len(), 1);
    let (payload, qos) = &reports[0];
    assert_eq!(*qos, 0);
    let json: serde_json::Value = serde_json::from_slice(payload).expect("JSON heartbeat");
    assert_eq!(json["errors"], 0);
    assert!(json["uptime"].as_u64().expect("uptime") >= 5);

    app.tick();
    assert_eq!(published_on(&sim, "uav4g/sensor").len(), 1);

    clock.advance(5000);
    app.tick();
    assert_eq!(published_on(&sim, "uav4g/sensor").len(), 2);
}

#[test]
fn test_telemetry_forwarded_while_connected() {
    let (mut app, sim, mut source, clock) = sim_app(&plain_config());

    // Heartbeats produced before the link is up wait in the ring.
    source.tick(clock.now_ms());
    bring_up(&mut app, &clock);
    sim.clear_log();

    app.tick();
    assert_eq!(published_on(&sim, "uav4g/mavlink/tx").len(), 1);

    source.tick(clock.now_ms());
    app.tick();
    let frames = published_on(&sim, "uav4g/mavlink/tx");
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|(_, qos)| *qos == 0));
    assert_eq!(app.bridge_stats().frames_forwarded, 2);
}

#[test]
fn test_downlink_and_commands_routed() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);

    let frame = FrameBuilder::new(255, 190).heartbeat(&Heartbeat {
        custom_mode: 0,
        mav_type: 6,
        autopilot: 8,
        base_mode: 0,
        system_status: 4,
    });
    sim.inject_message("uav4g/mavlink/rx", BRIDGE_CODEC.encode(&frame).as_bytes());
    sim.inject_message("uav4g/command", b"reboot");
    app.tick();

    let autopilot = app.bridge().port().tx_engine();
    assert_eq!(autopilot.transfers(), 1);
    assert_eq!(autopilot.bytes(), frame.len() as u64);
    assert_eq!(app.commands_received(), 1);
    assert_eq!(app.bridge_stats().inbound_dropped, 0);
}

#[test]
fn test_reconnects_after_connection_loss() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);

    sim.inject_connection_lost();
    app.tick();
    assert_eq!(app.state(), AppState::Error);
    assert!(!app.is_connected());

    clock.advance(30_000);
    sim.clear_log();
    app.tick();
    assert_eq!(app.state(), AppState::WaitModule);
    assert_eq!(sim.command_count("AT+CMQTTDISC"), 1);

    clock.advance(5000);
    app.tick();
    assert_eq!(app.state(), AppState::Connected);
    assert!(sim.is_broker_connected());
    assert_eq!(
        published_on(&sim, "uav4g/status"),
        vec![(b"online".to_vec(), 1)]
    );
}

#[test]
fn test_connection_lost_while_forwarding_telemetry() {
    let (mut app, sim, mut source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);
    sim.clear_log();

    source.tick(clock.now_ms());
    sim.reply_once(
        "AT+CMQTTPUB",
        Reply::Text("\r\nOK\r\n\r\n+CMQTTPUB: 0,0\r\n\r\n+CMQTTCONNLOST: 0,1\r\n".to_string()),
    );
    app.tick();

    assert_eq!(app.state(), AppState::Error);
    assert!(!app.is_connected());
    // No heartbeat is attempted on a dead link.
    assert_eq!(sim.command_count("AT+CMQTTPUB"), 1);

    clock.advance(30_000);
    app.tick();
    clock.advance(5000);
    app.tick();
    assert_eq!(app.state(), AppState::Connected);
}

#[test]
fn test_failed_bring_up_counts_errors() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    sim.set_reply("AT+CMQTTCONNECT", Reply::Error);

    bring_up(&mut app, &clock);
    assert_eq!(app.state(), AppState::Error);
    assert_eq!(app.error_count(), 1);

    // Nothing happens until the reconnect interval has passed.
    app.tick();
    assert_eq!(app.state(), AppState::Error);

    clock.advance(30_000);
    app.tick();
    assert_eq!(app.state(), AppState::WaitModule);
    clock.advance(5000);
    app.tick();
    assert_eq!(app.state(), AppState::Error);
    assert_eq!(app.error_count(), 2);

    sim.clear_replies();
    clock.advance(30_000);
    app.tick();
    clock.advance(5000);
    app.tick();
    assert_eq!(app.state(), AppState::Connected);
    assert_eq!(app.error_count(), 0);
}

#[test]
fn test_shutdown_announces_offline() {
    let (mut app, sim, _source, clock) = sim_app(&plain_config());
    bring_up(&mut app, &clock);
    sim.clear_log();

    app.shutdown();

    assert_eq!(
        published_on(&sim, "uav4g/status"),
        vec![(b"offline".to_vec(), 1)]
    );
    let commands = sim.commands();
    let publish = commands
        .iter()
        .position(|c| c.starts_with("AT+CMQTTPUB"))
        .expect("offline published");
    let disconnect = commands
        .iter()
        .position(|c| c.starts_with("AT+CMQTTDISC"))
        .expect("disconnect sent");
    assert!(publish < disconnect);
    assert!(!sim.is_broker_connected());
    assert_eq!(app.state(), AppState::WaitModule);
}

#[test]
fn test_shutdown_before_connect_publishes_nothing() {
    let (mut app, sim, _source, _clock) = sim_app(&plain_config());
    app.tick();
    app.shutdown();
    assert!(sim.published().is_empty());
    assert_eq!(sim.command_count("AT+CMQTTPUB"), 0);
}

#[test]
fn test_certificate_installed_before_connect() {
    let pem = b"-----BEGIN CERTIFICATE-----\nMIIBszCCAVmgAwIBAgIU\n-----END CERTIFICATE-----\n";
    let mut config = RunnerConfig::default();
    config.tls.ca_cert_path = Some("ca.pem".into());

    let (app, sim, _source, clock) = sim_app(&config);
    let mut app = app.with_certificate("ca.pem", pem.to_vec());
    bring_up(&mut app, &clock);

    assert_eq!(app.state(), AppState::Connected);
    assert_eq!(sim.certificates(), vec![("ca.pem".to_string(), pem.to_vec())]);

    let commands = sim.commands();
    let upload = commands
        .iter()
        .position(|c| c.starts_with("AT+CCERTDOWN=\"ca.pem\""))
        .expect("certificate upload");
    let connect = commands
        .iter()
        .position(|c| c.starts_with("AT+CMQTTCONNECT"))
        .expect("connect");
    assert!(upload < connect);
    assert!(commands
        .iter()
        .any(|c| c.contains("\"cacert\"") && c.contains("ca.pem")));
}
