//! MQTT session bring-up and teardown.
//!
//! [`Session::connect`] walks the modem through ten strictly ordered steps,
//! from "is anything there" to "broker accepted us". The first step that
//! cannot be satisfied is recorded in [`Session::error_step`] together with a
//! snapshot of what the modem said, and the session parks in
//! [`SessionState::Error`]. There is no retry across steps; the supervisor
//! decides when to try again.

use std::collections::VecDeque;

use cellbridge_metrics::metric_defs;
use cellbridge_uart::{Clock, SerialPort};
use log::{debug, error, info, warn};

use crate::channel::CommandChannel;
use crate::commands::{AtCommand, SslParam};
use crate::config::MqttConfig;
use crate::error::{ExchangeResult, SessionError, SessionResult};
use crate::responses::{
    InboundMessage, RegistrationStatus, SignalQuality, CONNECT_OK, OK, SERVICE_STARTED,
    SIM_READY,
};

/// Default timeout for ordinary AT commands.
pub const COMMAND_TIMEOUT_MS: u64 = 5000;

/// Timeout for commands that involve the network (PDP, broker connect).
pub const NETWORK_TIMEOUT_MS: u64 = 10_000;

/// Timeout for probes and housekeeping commands.
pub const SHORT_TIMEOUT_MS: u64 = 2000;

/// Liveness probe attempts.
pub const LIVENESS_ATTEMPTS: u32 = 3;

/// Registration polls before giving up.
pub const REGISTRATION_POLLS: u32 = 30;

/// Seconds the modem may spend on a broker disconnect.
pub const DISCONNECT_TIMEOUT_SECS: u16 = 60;

/// Capacity of the inbound message queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 4;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Not connected, nothing in progress.
    #[default]
    Idle,
    /// Checking the module, SIM, network and data context.
    Starting,
    /// Acquiring the MQTT client.
    Acquiring,
    /// Configuring TLS.
    SslConfig,
    /// Connecting to the broker.
    Connecting,
    /// Connected to the broker.
    Connected,
    /// Subscribe in progress.
    Subscribing,
    /// Publish in progress.
    Publishing,
    /// Teardown in progress.
    Disconnecting,
    /// Bring-up failed; see [`Session::error_step`].
    Error,
}

/// The numbered bring-up steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    /// Module answers `AT`.
    ModuleLiveness = 1,
    /// SIM is ready.
    SimReady = 2,
    /// Registered on the circuit-switched network.
    NetworkRegistration = 3,
    /// Registered on the packet-switched network.
    PacketRegistration = 4,
    /// PDP context active.
    PdpContext = 5,
    /// Signal quality read (never fails).
    SignalCheck = 6,
    /// MQTT service running.
    ServiceStart = 7,
    /// MQTT client acquired.
    ClientAcquire = 8,
    /// SSL context bound.
    SslConfig = 9,
    /// Broker accepted the connection.
    BrokerConnect = 10,
}

impl BringUpStep {
    /// Step number, 1 to 10.
    pub fn number(self) -> u8 {
        self as u8
    }

    /// Look a step up by number.
    pub fn from_number(number: u8) -> Option<Self> {
        use BringUpStep::*;
        [
            ModuleLiveness,
            SimReady,
            NetworkRegistration,
            PacketRegistration,
            PdpContext,
            SignalCheck,
            ServiceStart,
            ClientAcquire,
            SslConfig,
            BrokerConnect,
        ]
        .into_iter()
        .find(|step| step.number() == number)
    }

    /// Short description for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            BringUpStep::ModuleLiveness => "module communication",
            BringUpStep::SimReady => "SIM card",
            BringUpStep::NetworkRegistration => "network registration",
            BringUpStep::PacketRegistration => "packet registration",
            BringUpStep::PdpContext => "PDP context",
            BringUpStep::SignalCheck => "signal quality",
            BringUpStep::ServiceStart => "MQTT service start",
            BringUpStep::ClientAcquire => "MQTT client acquisition",
            BringUpStep::SslConfig => "SSL configuration",
            BringUpStep::BrokerConnect => "broker connect",
        }
    }
}

impl std::fmt::Display for BringUpStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An MQTT session driven through the modem's AT interface.
///
/// Owns the modem link. Besides bring-up it offers publish/subscribe
/// ([`Session::publish`], [`Session::process`]) and
/// [`Session::upload_certificate`].
pub struct Session<P: SerialPort, C: Clock> {
    pub(crate) channel: CommandChannel<P, C>,
    pub(crate) config: MqttConfig,
    pub(crate) state: SessionState,
    pub(crate) connected: bool,
    pub(crate) error_step: u8,
    pub(crate) last_response: String,
    pub(crate) signal: Option<SignalQuality>,
    pub(crate) subscriptions: Vec<String>,
    pub(crate) inbound: VecDeque<InboundMessage>,
}

impl<P: SerialPort, C: Clock> Session<P, C> {
    /// Create an idle session over a modem link.
    pub fn new(port: P, clock: C, config: MqttConfig) -> Self {
        info!("A7600 MQTT session initialised for {}", config.broker);
        Session {
            channel: CommandChannel::new(port, clock),
            config,
            state: SessionState::Idle,
            connected: false,
            error_step: 0,
            last_response: String::new(),
            signal: None,
            subscriptions: Vec::new(),
            inbound: VecDeque::with_capacity(INBOUND_QUEUE_CAPACITY),
        }
    }

    /// Run the full bring-up sequence.
    ///
    /// Blocks for as long as the steps take (up to a couple of minutes when
    /// the network is slow to register).
    pub fn connect(&mut self) -> SessionResult<()> {
        self.config.validate()?;

        self.error_step = 0;
        self.last_response.clear();
        self.connected = false;
        self.subscriptions.clear();
        self.channel.discard_notifications();
        let started = self.channel.clock().now_ms();

        // Step 1
        info!("Step 1: testing module communication");
        self.state = SessionState::Starting;
        let mut alive = false;
        for attempt in 1..=LIVENESS_ATTEMPTS {
            if self.exchange(&AtCommand::Attention, OK, SHORT_TIMEOUT_MS).is_ok() {
                alive = true;
                break;
            }
            debug!("Module silent (attempt {}/{})", attempt, LIVENESS_ATTEMPTS);
            if attempt < LIVENESS_ATTEMPTS {
                self.channel.delay_ms(1000);
            }
        }
        if !alive {
            return Err(self.fail(BringUpStep::ModuleLiveness));
        }
        self.channel.delay_ms(500);

        // Step 2
        info!("Step 2: checking SIM card");
        if self.exchange(&AtCommand::SimStatus, SIM_READY, COMMAND_TIMEOUT_MS).is_err() {
            return Err(self.fail(BringUpStep::SimReady));
        }
        self.channel.delay_ms(500);

        // Steps 3 and 4
        info!("Step 3: checking network registration");
        if !self.await_registration(&AtCommand::NetworkRegistration, "+CREG:") {
            return Err(self.fail(BringUpStep::NetworkRegistration));
        }
        self.channel.delay_ms(500);

        info!("Step 4: checking packet registration");
        if !self.await_registration(&AtCommand::PacketRegistration, "+CGREG:") {
            return Err(self.fail(BringUpStep::PacketRegistration));
        }
        self.channel.delay_ms(500);

        // Step 5
        info!("Step 5: activating PDP context (APN {:?})", self.config.apn);
        let _ = self.exchange(&AtCommand::PdpActivate { active: false }, OK, COMMAND_TIMEOUT_MS);
        self.channel.delay_ms(500);
        let define = AtCommand::PdpDefine {
            apn: self.config.apn.clone(),
        };
        let _ = self.exchange(&define, OK, SHORT_TIMEOUT_MS);
        self.channel.delay_ms(200);
        if self
            .exchange(&AtCommand::PdpActivate { active: true }, OK, NETWORK_TIMEOUT_MS)
            .is_err()
        {
            return Err(self.fail(BringUpStep::PdpContext));
        }
        self.channel.delay_ms(1000);

        // Step 6
        info!("Step 6: checking signal quality");
        if self.exchange(&AtCommand::SignalQuality, OK, SHORT_TIMEOUT_MS).is_ok() {
            self.record_signal();
        }
        self.channel.delay_ms(200);

        // Step 7
        info!("Step 7: starting MQTT service");
        self.stop_service(SHORT_TIMEOUT_MS, 200);
        self.channel.delay_ms(500);
        if self.exchange(&AtCommand::MqttStart, OK, COMMAND_TIMEOUT_MS).is_err()
            && !self.channel.response().contains(SERVICE_STARTED)
        {
            return Err(self.fail(BringUpStep::ServiceStart));
        }
        self.channel.delay_ms(500);

        // Step 8
        info!("Step 8: acquiring MQTT client {:?}", self.config.client_id);
        self.state = SessionState::Acquiring;
        let acquire = AtCommand::MqttAcquire {
            client_id: self.config.client_id.clone(),
        };
        if self.exchange(&acquire, OK, COMMAND_TIMEOUT_MS).is_err() {
            return Err(self.fail(BringUpStep::ClientAcquire));
        }
        self.channel.delay_ms(500);

        // Step 9
        if self.config.use_ssl {
            info!("Step 9: configuring SSL");
            self.state = SessionState::SslConfig;
            self.configure_ssl();
            if self
                .exchange(&AtCommand::MqttSslBind, OK, COMMAND_TIMEOUT_MS)
                .is_err()
            {
                return Err(self.fail(BringUpStep::SslConfig));
            }
            self.channel.delay_ms(200);
        }

        // Step 10
        info!(
            "Step 10: connecting to {}:{}",
            self.config.broker, self.config.port
        );
        self.state = SessionState::Connecting;
        let connect = AtCommand::MqttConnect {
            host: self.config.broker.clone(),
            port: self.config.port,
            keepalive: self.config.keepalive,
            username: self.config.username.clone(),
            password: self.config.password.clone(),
        };
        if self
            .exchange(&connect, CONNECT_OK, NETWORK_TIMEOUT_MS)
            .is_err()
        {
            error!(
                "MQTT connect failed, response: {:?}",
                self.channel.response().text()
            );
            return Err(self.fail(BringUpStep::BrokerConnect));
        }

        self.state = SessionState::Connected;
        self.connected = true;
        self.channel.response_mut().clear();
        let elapsed = self.channel.clock().elapsed_since(started);
        metrics::histogram!(metric_defs::BRINGUP_TIME.name).record(elapsed as f64);
        info!(
            "MQTT connected to {} in {} ms",
            self.config.broker, elapsed
        );
        Ok(())
    }

    /// Tear the session down. Never fails; every step is best effort.
    pub fn disconnect(&mut self) {
        info!("Disconnecting MQTT session");
        self.state = SessionState::Disconnecting;
        self.stop_service(COMMAND_TIMEOUT_MS, 500);
        self.state = SessionState::Idle;
        self.connected = false;
        self.subscriptions.clear();
    }

    /// `DISC`, `REL`, `STOP` with `pause_ms` between them; results ignored.
    fn stop_service(&mut self, timeout_ms: u64, pause_ms: u64) {
        let steps = [
            AtCommand::MqttDisconnect {
                timeout_secs: DISCONNECT_TIMEOUT_SECS,
            },
            AtCommand::MqttRelease,
            AtCommand::MqttStop,
        ];
        for (i, command) in steps.iter().enumerate() {
            if let Err(err) = self.exchange(command, OK, timeout_ms) {
                debug!("{} ignored: {}", command, err);
            }
            if i + 1 < steps.len() {
                self.channel.delay_ms(pause_ms);
            }
        }
    }

    fn configure_ssl(&mut self) {
        let verify = self.config.ca_cert.is_some();
        let mut commands = vec![AtCommand::SslConfig {
            param: SslParam::Version,
            value: 4,
        }];
        if let Some(name) = &self.config.ca_cert {
            commands.push(AtCommand::SslConfigText {
                param: SslParam::CaCert,
                value: name.clone(),
            });
        }
        commands.extend([
            AtCommand::SslConfig {
                param: SslParam::AuthMode,
                value: u8::from(verify),
            },
            AtCommand::SslConfig {
                param: SslParam::EnableSni,
                value: 1,
            },
            AtCommand::SslConfig {
                param: SslParam::IgnoreLocalTime,
                value: 1,
            },
        ]);
        for command in &commands {
            if let Err(err) = self.exchange(command, OK, SHORT_TIMEOUT_MS) {
                warn!("{} ignored: {}", command, err);
            }
            self.channel.delay_ms(100);
        }
    }

    /// Poll a registration query until the modem reports home or roaming.
    fn await_registration(&mut self, command: &AtCommand, prefix: &str) -> bool {
        for poll in 1..=REGISTRATION_POLLS {
            if self.exchange(command, OK, SHORT_TIMEOUT_MS).is_ok() {
                let text = self.channel.response().text();
                match RegistrationStatus::parse(&text, prefix) {
                    Some(status) if status.is_registered() => {
                        debug!("{} {:?} after {} poll(s)", prefix, status, poll);
                        return true;
                    }
                    status => debug!("{} not registered yet: {:?}", prefix, status),
                }
            }
            if poll < REGISTRATION_POLLS {
                self.channel.delay_ms(1000);
            }
        }
        false
    }

    fn record_signal(&mut self) {
        let text = self.channel.response().text();
        match SignalQuality::parse(&text) {
            Some(quality) => {
                if let Some(dbm) = quality.dbm() {
                    metrics::gauge!(metric_defs::SIGNAL_RSSI.name).set(f64::from(dbm));
                }
                info!(
                    "Signal quality: rssi={} ber={} ({:?} dBm)",
                    quality.rssi,
                    quality.ber,
                    quality.dbm()
                );
                self.signal = Some(quality);
            }
            None => debug!("No +CSQ line in {:?}", text),
        }
    }

    /// Record a failed step and park in the error state.
    fn fail(&mut self, step: BringUpStep) -> SessionError {
        self.error_step = step.number();
        self.last_response = self.channel.response().snapshot();
        self.state = SessionState::Error;
        self.connected = false;
        metrics::counter!(metric_defs::BRINGUP_FAILURES.name, "step" => step.number().to_string())
            .increment(1);
        error!(
            "Bring-up failed at step {} ({}): {:?}",
            step.number(),
            step,
            self.last_response
        );
        SessionError::BringUp {
            step,
            response: self.last_response.clone(),
        }
    }

    pub(crate) fn exchange(
        &mut self,
        command: &AtCommand,
        expected: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<()> {
        let result = self.channel.send_and_wait(command, expected, timeout_ms);
        self.absorb_notifications();
        result
    }

    /// Like [`Session::exchange`] for a data-mode body.
    pub(crate) fn exchange_raw(
        &mut self,
        data: &[u8],
        expected: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<()> {
        let result = self.channel.send_raw_and_wait(data, expected, timeout_ms);
        self.absorb_notifications();
        result
    }

    /// Whether the broker connection is up.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Step that failed last bring-up, 0 if none.
    pub fn error_step(&self) -> u8 {
        self.error_step
    }

    /// Modem output captured when the last bring-up failed.
    pub fn last_response(&self) -> &str {
        &self.last_response
    }

    /// Signal quality read during the last bring-up.
    pub fn signal_quality(&self) -> Option<SignalQuality> {
        self.signal
    }

    /// Session configuration.
    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    /// Topics subscribed since the last connect.
    pub fn subscriptions(&self) -> &[String] {
        &self.subscriptions
    }

    /// The modem link.
    pub fn channel(&self) -> &CommandChannel<P, C> {
        &self.channel
    }

    /// Mutable access to the modem link.
    pub fn channel_mut(&mut self) -> &mut CommandChannel<P, C> {
        &mut self.channel
    }
}

impl<P: SerialPort, C: Clock> std::fmt::Debug for Session<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("connected", &self.connected)
            .field("error_step", &self.error_step)
            .field("broker", &self.config.broker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_numbers() {
        assert_eq!(BringUpStep::ModuleLiveness.number(), 1);
        assert_eq!(BringUpStep::BrokerConnect.number(), 10);
        for n in 1..=10 {
            let step = BringUpStep::from_number(n).expect("step");
            assert_eq!(step.number(), n);
        }
        assert_eq!(BringUpStep::from_number(0), None);
        assert_eq!(BringUpStep::from_number(11), None);
        assert_eq!(BringUpStep::PdpContext.to_string(), "PDP context");
    }

    #[test]
    fn test_default_state() {
        assert_eq!(SessionState::default(), SessionState::Idle);
    }
}
