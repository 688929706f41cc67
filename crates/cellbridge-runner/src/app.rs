//! Application supervisor.
//!
//! Drives the session through bring-up, keeps it serviced while connected,
//! and backs off and retries after failures:
//!
//! ```text
//! Init ──► WaitModule ──(every initial_connect_delay_ms)──► Connecting
//!              ▲                                            │      │
//!              │                                          ok│      │fail
//!              │                                            ▼      ▼
//!              └──(after reconnect_interval_ms)── Error ◄── Connected
//!                                                     (connection lost)
//! ```
//!
//! While connected each tick services the modem, hands inbound messages to
//! the bridge, forwards telemetry frames and publishes a JSON heartbeat on
//! the sensor topic.

use cellbridge_bridge::{Bridge, BridgeStats};
use cellbridge_modem::{QoS, Session, SessionState};
use cellbridge_uart::{Clock, SerialPort};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{RunnerConfig, TimingConfig, TopicConfig};
use crate::error::RunnerResult;

/// Pause after tearing the session down before the next attempt.
pub const TEARDOWN_SETTLE_MS: u64 = 1000;

/// Pause after announcing `offline`, so the modem can flush it.
pub const OFFLINE_SETTLE_MS: u64 = 500;

/// Supervisor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Not started.
    Init,
    /// Waiting to attempt bring-up.
    WaitModule,
    /// Bring-up in progress.
    Connecting,
    /// Connected and serviced every tick.
    Connected,
    /// Bring-up failed or the connection dropped.
    Error,
}

/// Heartbeat published on the sensor topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    /// Seconds since start.
    pub uptime: u64,
    /// Failed bring-ups since the last successful one.
    pub errors: u32,
}

/// The supervisor: session, bridge and retry policy.
pub struct App<M: SerialPort, T: SerialPort, C: Clock + Clone> {
    session: Session<M, C>,
    bridge: Bridge<T, C>,
    clock: C,
    topics: TopicConfig,
    timing: TimingConfig,
    certificate: Option<(String, Vec<u8>)>,
    state: AppState,
    last_reconnect_ms: u64,
    last_publish_ms: u64,
    error_count: u32,
    commands_received: u64,
}

impl<M: SerialPort, T: SerialPort, C: Clock + Clone> App<M, T, C> {
    /// Build the supervisor over a modem port and a telemetry port.
    pub fn new(modem: M, telemetry: T, clock: C, config: &RunnerConfig) -> RunnerResult<Self> {
        config.validate()?;
        let session = Session::new(modem, clock.clone(), config.session_config());
        let bridge = Bridge::new(telemetry, clock.clone(), config.bridge_config());
        Ok(App {
            session,
            bridge,
            clock,
            topics: config.topics.clone(),
            timing: config.timing,
            certificate: None,
            state: AppState::Init,
            last_reconnect_ms: 0,
            last_publish_ms: 0,
            error_count: 0,
            commands_received: 0,
        })
    }

    /// Install `pem` on the modem as `name` before the next bring-up.
    pub fn with_certificate(mut self, name: &str, pem: Vec<u8>) -> Self {
        self.certificate = Some((name.to_string(), pem));
        self
    }

    /// Run one supervisor step.
    pub fn tick(&mut self) {
        match self.state {
            AppState::Init => {
                info!("Supervisor started, waiting for the module");
                self.last_reconnect_ms = self.clock.now_ms();
                self.state = AppState::WaitModule;
            }
            AppState::WaitModule => {
                if self.clock.elapsed_since(self.last_reconnect_ms)
                    >= self.timing.initial_connect_delay_ms
                {
                    self.last_reconnect_ms = self.clock.now_ms();
                    self.connect();
                }
            }
            AppState::Connecting => self.connect(),
            AppState::Connected => self.service(),
            AppState::Error => {
                if self.clock.elapsed_since(self.last_reconnect_ms)
                    >= self.timing.reconnect_interval_ms
                {
                    info!("Resetting session before retrying");
                    self.session.disconnect();
                    self.clock.delay_ms(TEARDOWN_SETTLE_MS);
                    self.last_reconnect_ms = self.clock.now_ms();
                    self.state = AppState::WaitModule;
                }
            }
        }
    }

    fn connect(&mut self) {
        self.state = AppState::Connecting;

        if let Some((name, pem)) = self.certificate.take() {
            if let Err(err) = self.session.upload_certificate(&name, &pem) {
                error!("Certificate upload failed: {}", err);
                self.certificate = Some((name, pem));
                self.fail();
                return;
            }
            info!("Installed CA certificate {}", name);
        }

        match self.session.connect() {
            Ok(()) => {
                self.state = AppState::Connected;
                self.error_count = 0;
                for topic in [&self.topics.command, &self.topics.bridge_rx] {
                    if let Err(err) = self.session.subscribe(topic, QoS::AtMostOnce) {
                        warn!("Subscribe to {} failed: {}", topic, err);
                    }
                }
                self.publish_status("online");
            }
            Err(err) => {
                error!("Bring-up failed: {}", err);
                self.fail();
            }
        }
    }

    fn fail(&mut self) {
        self.state = AppState::Error;
        self.error_count += 1;
    }

    fn service(&mut self) {
        self.session.process();
        if self.link_lost() {
            return;
        }

        while let Some(message) = self.session.next_inbound() {
            if message.topic == self.topics.command {
                info!(
                    "Command received: {}",
                    String::from_utf8_lossy(&message.payload)
                );
                self.commands_received += 1;
            } else {
                self.bridge.on_message(&message);
            }
        }

        self.bridge.process(&mut self.session);
        if self.link_lost() {
            return;
        }

        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_publish_ms) >= self.timing.publish_interval_ms {
            self.last_publish_ms = now;
            self.publish_report(StatusReport {
                uptime: now / 1000,
                errors: self.error_count,
            });
        }
    }

    /// Move to `Error` if the session noticed the broker going away.
    fn link_lost(&mut self) -> bool {
        if self.session.is_connected() {
            return false;
        }
        warn!("Broker connection lost");
        self.state = AppState::Error;
        true
    }

    fn publish_report(&mut self, report: StatusReport) {
        let json = match serde_json::to_string(&report) {
            Ok(json) => json,
            Err(err) => {
                warn!("Heartbeat not serialized: {}", err);
                return;
            }
        };
        info!("Publishing sensor data: {}", json);
        if let Err(err) = self
            .session
            .publish_str(&self.topics.sensor, &json, QoS::AtMostOnce)
        {
            warn!("Heartbeat publish failed: {}", err);
        }
    }

    fn publish_status(&mut self, status: &str) {
        if self.state != AppState::Connected {
            return;
        }
        if let Err(err) = self
            .session
            .publish_str(&self.topics.status, status, QoS::AtLeastOnce)
        {
            warn!("Status {:?} not published: {}", status, err);
        }
    }

    /// Announce `offline`, tear the session down and wait for the module
    /// again.
    pub fn shutdown(&mut self) {
        if self.state == AppState::Connected && self.session.is_connected() {
            self.publish_status("offline");
            self.clock.delay_ms(OFFLINE_SETTLE_MS);
        }
        if self.session.state() != SessionState::Idle || self.session.is_connected() {
            self.session.disconnect();
        }
        debug!("Supervisor stopped");
        self.state = AppState::WaitModule;
    }

    /// Current state.
    pub fn state(&self) -> AppState {
        self.state
    }

    /// Failed bring-ups since the last successful one.
    pub fn error_count(&self) -> u32 {
        self.error_count
    }

    /// Whether the supervisor is connected and the session agrees.
    pub fn is_connected(&self) -> bool {
        self.state == AppState::Connected && self.session.is_connected()
    }

    /// Messages received on the command topic.
    pub fn commands_received(&self) -> u64 {
        self.commands_received
    }

    /// Bridge counters.
    pub fn bridge_stats(&self) -> BridgeStats {
        self.bridge.stats()
    }

    /// The session.
    pub fn session(&self) -> &Session<M, C> {
        &self.session
    }

    /// The bridge.
    pub fn bridge(&self) -> &Bridge<T, C> {
        &self.bridge
    }
}
