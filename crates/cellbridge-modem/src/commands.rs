//! AT commands understood by the A7600 MQTT stack.
//!
//! Every MQTT command addresses client index 0; the driver only ever runs one
//! client. Commands render without their terminator through
//! [`AtCommand::to_command_string`]; [`AtCommand::encode`] appends CRLF.

use serde::{Deserialize, Serialize};

/// Client index used for all `AT+CMQTT*` commands.
pub const CLIENT_INDEX: u8 = 0;

/// SSL context bound to the MQTT client when TLS is enabled.
pub const SSL_CONTEXT: u8 = 0;

/// Line terminator the modem expects after a command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// MQTT quality-of-service level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// Fire and forget.
    #[default]
    AtMostOnce = 0,
    /// Acknowledged delivery, duplicates possible.
    AtLeastOnce = 1,
    /// Exactly one delivery.
    ExactlyOnce = 2,
}

impl QoS {
    /// Numeric level as sent on the wire.
    pub fn level(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(format!("invalid QoS level {}", other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos.level()
    }
}

/// `AT+CSSLCFG` parameters set before binding the SSL context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslParam {
    /// Protocol version (`4` = all versions, negotiates TLS 1.2).
    Version,
    /// Certificate verification mode (`0` = no verification).
    AuthMode,
    /// Server Name Indication.
    EnableSni,
    /// Skip certificate validity checks against the local clock.
    IgnoreLocalTime,
    /// CA certificate file name stored on the modem.
    CaCert,
}

impl SslParam {
    /// Parameter name as the modem spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            SslParam::Version => "sslversion",
            SslParam::AuthMode => "authmode",
            SslParam::EnableSni => "enableSNI",
            SslParam::IgnoreLocalTime => "ignorelocaltime",
            SslParam::CaCert => "cacert",
        }
    }
}

/// Commands sent to the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AtCommand {
    // ========== Module ==========
    /// Liveness probe (`AT`).
    Attention,

    /// SIM status query.
    SimStatus,

    /// Circuit-switched network registration query.
    NetworkRegistration,

    /// Packet-switched network registration query.
    PacketRegistration,

    /// Activate or deactivate PDP context 1.
    PdpActivate {
        /// `true` activates, `false` deactivates.
        active: bool,
    },

    /// Define PDP context 1 as IP with the given APN.
    PdpDefine {
        /// Access point name.
        apn: String,
    },

    /// Signal quality query.
    SignalQuality,

    // ========== MQTT service ==========
    /// Start the MQTT service.
    MqttStart,

    /// Stop the MQTT service.
    MqttStop,

    /// Acquire the MQTT client.
    MqttAcquire {
        /// Client identifier presented to the broker.
        client_id: String,
    },

    /// Release the MQTT client.
    MqttRelease,

    /// Disconnect from the broker.
    MqttDisconnect {
        /// Seconds the modem may spend on the disconnect.
        timeout_secs: u16,
    },

    /// Set an SSL context parameter.
    SslConfig {
        /// Parameter to set.
        param: SslParam,
        /// Numeric value.
        value: u8,
    },

    /// Set an SSL context parameter that takes a quoted string.
    SslConfigText {
        /// Parameter to set.
        param: SslParam,
        /// Value, quoted on the wire.
        value: String,
    },

    /// Bind the SSL context to the MQTT client.
    MqttSslBind,

    /// Connect to the broker.
    MqttConnect {
        /// Broker host name.
        host: String,
        /// Broker port.
        port: u16,
        /// Keepalive in seconds.
        keepalive: u16,
        /// User name.
        username: String,
        /// Password.
        password: String,
    },

    // ========== Publish / subscribe ==========
    /// Subscribe to one topic.
    MqttSubscribe {
        /// Topic filter.
        topic: String,
        /// Requested QoS.
        qos: QoS,
    },

    /// Unsubscribe from one topic.
    MqttUnsubscribe {
        /// Topic filter.
        topic: String,
    },

    /// Announce the length of the topic that follows (prompts with `>`).
    MqttTopic {
        /// Topic length in bytes.
        len: usize,
    },

    /// Announce the length of the payload that follows (prompts with `>`).
    MqttPayload {
        /// Payload length in bytes.
        len: usize,
    },

    /// Publish the previously supplied topic and payload.
    MqttPublish {
        /// Delivery QoS.
        qos: QoS,
        /// Seconds the modem may wait for the broker.
        timeout_secs: u16,
    },

    // ========== Files ==========
    /// Download a certificate file to the modem (prompts with `>`).
    CertDownload {
        /// File name on the modem.
        name: String,
        /// Body length in bytes.
        len: usize,
    },
}

impl AtCommand {
    /// Encode the command as bytes ready to transmit, CRLF included.
    pub fn encode(&self) -> Vec<u8> {
        let mut line = self.to_command_string();
        line.push_str(LINE_TERMINATOR);
        line.into_bytes()
    }

    /// The command line without its terminator.
    pub fn to_command_string(&self) -> String {
        match self {
            AtCommand::Attention => "AT".to_string(),
            AtCommand::SimStatus => "AT+CPIN?".to_string(),
            AtCommand::NetworkRegistration => "AT+CREG?".to_string(),
            AtCommand::PacketRegistration => "AT+CGREG?".to_string(),
            AtCommand::PdpActivate { active } => format!("AT+CGACT={},1", u8::from(*active)),
            AtCommand::PdpDefine { apn } => format!("AT+CGDCONT=1,\"IP\",\"{}\"", apn),
            AtCommand::SignalQuality => "AT+CSQ".to_string(),

            AtCommand::MqttStart => "AT+CMQTTSTART".to_string(),
            AtCommand::MqttStop => "AT+CMQTTSTOP".to_string(),
            AtCommand::MqttAcquire { client_id } => {
                // Server type 1 selects SSL/TCP; plain TCP also works with it on the A7600.
                format!("AT+CMQTTACCQ={},\"{}\",1", CLIENT_INDEX, client_id)
            }
            AtCommand::MqttRelease => format!("AT+CMQTTREL={}", CLIENT_INDEX),
            AtCommand::MqttDisconnect { timeout_secs } => {
                format!("AT+CMQTTDISC={},{}", CLIENT_INDEX, timeout_secs)
            }
            AtCommand::SslConfig { param, value } => {
                format!("AT+CSSLCFG=\"{}\",{},{}", param.as_str(), SSL_CONTEXT, value)
            }
            AtCommand::SslConfigText { param, value } => {
                format!("AT+CSSLCFG=\"{}\",{},\"{}\"", param.as_str(), SSL_CONTEXT, value)
            }
            AtCommand::MqttSslBind => format!("AT+CMQTTSSLCFG={},{}", CLIENT_INDEX, SSL_CONTEXT),
            AtCommand::MqttConnect {
                host,
                port,
                keepalive,
                username,
                password,
            } => format!(
                "AT+CMQTTCONNECT={},\"tcp://{}:{}\",{},1,\"{}\",\"{}\"",
                CLIENT_INDEX, host, port, keepalive, username, password
            ),

            AtCommand::MqttSubscribe { topic, qos } => {
                format!("AT+CMQTTSUB={},\"{}\",{}", CLIENT_INDEX, topic, qos.level())
            }
            AtCommand::MqttUnsubscribe { topic } => {
                format!("AT+CMQTTUNSUB={},\"{}\"", CLIENT_INDEX, topic)
            }
            AtCommand::MqttTopic { len } => format!("AT+CMQTTTOPIC={},{}", CLIENT_INDEX, len),
            AtCommand::MqttPayload { len } => format!("AT+CMQTTPAYLOAD={},{}", CLIENT_INDEX, len),
            AtCommand::MqttPublish { qos, timeout_secs } => {
                format!("AT+CMQTTPUB={},{},{}", CLIENT_INDEX, qos.level(), timeout_secs)
            }

            AtCommand::CertDownload { name, len } => format!("AT+CCERTDOWN=\"{}\",{}", name, len),
        }
    }
}

impl std::fmt::Display for AtCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_command_string())
    }
}

/// Check that `value` can sit inside a double-quoted AT argument.
pub fn is_quotable(value: &str) -> bool {
    !value.contains(['"', '\r', '\n'])
}
