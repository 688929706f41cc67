//! Broker and network configuration for a session.

use serde::{Deserialize, Serialize};

use crate::commands::is_quotable;
use crate::error::{SessionError, SessionResult};

/// Broker, credentials and network settings.
///
/// Fixed for the lifetime of a [`crate::Session`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    /// Broker host name.
    pub broker: String,
    /// Broker port (8883 for TLS, 1883 plain).
    pub port: u16,
    /// User name, may be empty.
    pub username: String,
    /// Password, may be empty.
    pub password: String,
    /// Client identifier presented to the broker.
    pub client_id: String,
    /// Bind an SSL context to the MQTT client before connecting.
    pub use_ssl: bool,
    /// Keepalive interval in seconds.
    pub keepalive: u16,
    /// Access point name for the PDP context.
    pub apn: String,
    /// CA certificate file name on the modem. When set, certificates are
    /// verified against it instead of being accepted blindly.
    pub ca_cert: Option<String>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            broker: "broker.hivemq.com".to_string(),
            port: 8883,
            username: String::new(),
            password: String::new(),
            client_id: "stm32_uav4g".to_string(),
            use_ssl: true,
            keepalive: 120,
            apn: "internet".to_string(),
            ca_cert: None,
        }
    }
}

impl MqttConfig {
    /// Check that every value can be embedded in an AT command.
    pub fn validate(&self) -> SessionResult<()> {
        if self.broker.is_empty() {
            return Err(SessionError::InvalidArgument("broker host is empty".into()));
        }
        if self.client_id.is_empty() {
            return Err(SessionError::InvalidArgument("client id is empty".into()));
        }

        let quoted = [
            ("broker", self.broker.as_str()),
            ("username", self.username.as_str()),
            ("password", self.password.as_str()),
            ("client_id", self.client_id.as_str()),
            ("apn", self.apn.as_str()),
            ("ca_cert", self.ca_cert.as_deref().unwrap_or("")),
        ];
        for (field, value) in quoted {
            if !is_quotable(value) {
                return Err(SessionError::InvalidArgument(format!(
                    "{} contains a quote or line break",
                    field
                )));
            }
        }
        Ok(())
    }
}
