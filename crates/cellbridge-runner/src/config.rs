//! Runner configuration, loaded from YAML.
//!
//! Every section is optional; missing fields fall back to the firmware
//! defaults.
//!
//! ```yaml
//! mqtt:
//!   broker: example.s1.eu.hivemq.cloud
//!   username: uav4g
//!   password: secret
//! links:
//!   modem: 127.0.0.1:7000
//!   telemetry: sim
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use cellbridge_bridge::{BridgeConfig, DEFAULT_RX_TOPIC, DEFAULT_TX_TOPIC};
use cellbridge_modem::{is_quotable, MqttConfig, MAX_TOPIC_LEN};
use serde::{Deserialize, Serialize};

use crate::error::{RunnerError, RunnerResult};

/// Complete runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Broker and network settings handed to the session.
    pub mqtt: MqttConfig,
    /// Application and bridge topics.
    pub topics: TopicConfig,
    /// Supervisor timing.
    pub timing: TimingConfig,
    /// Where the modem and telemetry bytes come from.
    pub links: LinkConfig,
    /// Optional CA certificate to install on the modem.
    pub tls: TlsConfig,
}

/// Topic names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicConfig {
    /// `online`/`offline` announcements.
    pub status: String,
    /// Periodic JSON heartbeat.
    pub sensor: String,
    /// Commands from the ground.
    pub command: String,
    /// MAVLink frames from the telemetry UART.
    pub bridge_tx: String,
    /// MAVLink frames for the telemetry UART.
    pub bridge_rx: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        TopicConfig {
            status: "uav4g/status".to_string(),
            sensor: "uav4g/sensor".to_string(),
            command: "uav4g/command".to_string(),
            bridge_tx: DEFAULT_TX_TOPIC.to_string(),
            bridge_rx: DEFAULT_RX_TOPIC.to_string(),
        }
    }
}

/// Supervisor intervals, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Heartbeat period while connected.
    pub publish_interval_ms: u64,
    /// Wait in the error state before tearing down and retrying.
    pub reconnect_interval_ms: u64,
    /// Spacing of bring-up attempts while waiting for the module.
    pub initial_connect_delay_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        TimingConfig {
            publish_interval_ms: 5000,
            reconnect_interval_ms: 30_000,
            initial_connect_delay_ms: 5000,
        }
    }
}

/// A byte link: a TCP endpoint carrying the raw serial stream, or the
/// built-in simulator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LinkSpec {
    /// Built-in simulator.
    Sim,
    /// `host:port` of a serial-over-TCP bridge.
    Tcp(String),
}

impl From<String> for LinkSpec {
    fn from(value: String) -> Self {
        if value.eq_ignore_ascii_case("sim") {
            LinkSpec::Sim
        } else {
            LinkSpec::Tcp(value)
        }
    }
}

impl From<&str> for LinkSpec {
    fn from(value: &str) -> Self {
        LinkSpec::from(value.to_string())
    }
}

impl From<LinkSpec> for String {
    fn from(value: LinkSpec) -> Self {
        value.to_string()
    }
}

impl fmt::Display for LinkSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkSpec::Sim => write!(f, "sim"),
            LinkSpec::Tcp(addr) => write!(f, "{}", addr),
        }
    }
}

/// Modem and telemetry links.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Link to the A7600 UART.
    pub modem: LinkSpec,
    /// Link to the flight controller's telemetry UART.
    pub telemetry: LinkSpec,
}

impl Default for LinkConfig {
    fn default() -> Self {
        LinkConfig {
            modem: LinkSpec::Sim,
            telemetry: LinkSpec::Sim,
        }
    }
}

/// CA certificate installation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM file on the host to upload before the first connect.
    pub ca_cert_path: Option<PathBuf>,
    /// File name the certificate is stored under on the modem.
    pub cert_name: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        TlsConfig {
            ca_cert_path: None,
            cert_name: "ca.pem".to_string(),
        }
    }
}

impl RunnerConfig {
    /// Load and validate a configuration file.
    pub fn load(path: &Path) -> RunnerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    /// Parse and validate a YAML document.
    pub fn from_yaml_str(yaml: &str) -> RunnerResult<Self> {
        let config: RunnerConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before anything is sent to the modem.
    pub fn validate(&self) -> RunnerResult<()> {
        self.session_config().validate()?;

        let topics = [
            ("status", &self.topics.status),
            ("sensor", &self.topics.sensor),
            ("command", &self.topics.command),
            ("bridge_tx", &self.topics.bridge_tx),
            ("bridge_rx", &self.topics.bridge_rx),
        ];
        for (name, topic) in topics {
            if topic.is_empty() || topic.len() > MAX_TOPIC_LEN || !is_quotable(topic) {
                return Err(RunnerError::InvalidConfig(format!(
                    "topics.{} {:?} is not a usable topic",
                    name, topic
                )));
            }
        }
        if self.topics.command == self.topics.bridge_rx {
            return Err(RunnerError::InvalidConfig(
                "topics.command and topics.bridge_rx must differ".into(),
            ));
        }

        let timing = &self.timing;
        if timing.publish_interval_ms == 0
            || timing.reconnect_interval_ms == 0
            || timing.initial_connect_delay_ms == 0
        {
            return Err(RunnerError::InvalidConfig(
                "timing intervals must be non-zero".into(),
            ));
        }

        if self.tls.ca_cert_path.is_some() && self.tls.cert_name.is_empty() {
            return Err(RunnerError::InvalidConfig("tls.cert_name is empty".into()));
        }
        Ok(())
    }

    /// Session settings. An uploaded CA certificate is verified against
    /// unless the MQTT section names one explicitly.
    pub fn session_config(&self) -> MqttConfig {
        let mut mqtt = self.mqtt.clone();
        if mqtt.ca_cert.is_none() && self.tls.ca_cert_path.is_some() {
            mqtt.ca_cert = Some(self.tls.cert_name.clone());
        }
        mqtt
    }

    /// Bridge topics with the build's codec.
    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            tx_topic: self.topics.bridge_tx.clone(),
            rx_topic: self.topics.bridge_rx.clone(),
            ..BridgeConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.topics.status, "uav4g/status");
        assert_eq!(config.topics.bridge_rx, "uav4g/mavlink/rx");
        assert_eq!(config.timing.reconnect_interval_ms, 30_000);
        assert_eq!(config.links.modem, LinkSpec::Sim);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_link_spec_strings() {
        assert_eq!(LinkSpec::from("sim"), LinkSpec::Sim);
        assert_eq!(LinkSpec::from("SIM"), LinkSpec::Sim);
        assert_eq!(
            LinkSpec::from("127.0.0.1:7000"),
            LinkSpec::Tcp("127.0.0.1:7000".into())
        );
        assert_eq!(LinkSpec::Tcp("h:1".into()).to_string(), "h:1");
    }

    #[test]
    fn test_session_config_uses_uploaded_cert() {
        let mut config = RunnerConfig::default();
        assert_eq!(config.session_config().ca_cert, None);

        config.tls.ca_cert_path = Some(PathBuf::from("/etc/ca.pem"));
        assert_eq!(config.session_config().ca_cert.as_deref(), Some("ca.pem"));

        config.mqtt.ca_cert = Some("root.pem".into());
        assert_eq!(config.session_config().ca_cert.as_deref(), Some("root.pem"));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let mut config = RunnerConfig::default();
        config.timing.publish_interval_ms = 0;
        assert!(matches!(
            config.validate(),
            Err(RunnerError::InvalidConfig(_))
        ));
    }
}
