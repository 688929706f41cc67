//! Parsing of modem responses and unsolicited result codes.
//!
//! Most exchanges only need substring matching against the markers below.
//! Registration state, signal quality and inbound MQTT messages carry data
//! worth extracting.

use crate::buffer::{find, find_from};

/// Final result of a successful command.
pub const OK: &str = "OK";
/// Final result of a failed command.
pub const ERROR: &str = "ERROR";
/// Data-mode prompt.
pub const PROMPT: &str = ">";
/// SIM unlocked and ready.
pub const SIM_READY: &str = "+CPIN: READY";
/// MQTT service started (reported when already running too).
pub const SERVICE_STARTED: &str = "+CMQTTSTART: 0";
/// Broker accepted the connection.
pub const CONNECT_OK: &str = "+CMQTTCONNECT: 0,0";
/// Broker accepted the subscription.
pub const SUBSCRIBE_OK: &str = "+CMQTTSUB: 0,0";
/// Broker accepted the publication.
pub const PUBLISH_OK: &str = "+CMQTTPUB: 0,0";

/// Start of an inbound message.
pub const RX_START: &str = "+CMQTTRXSTART:";
/// Topic section of an inbound message.
pub const RX_TOPIC: &str = "+CMQTTRXTOPIC:";
/// Payload section of an inbound message.
pub const RX_PAYLOAD: &str = "+CMQTTRXPAYLOAD:";
/// End of an inbound message.
pub const RX_END: &str = "+CMQTTRXEND:";
/// Broker connection dropped.
pub const CONNECTION_LOST: &str = "+CMQTTCONNLOST:";

/// Parse the numeric fields following `prefix` (e.g. `+CREG: 0,1`).
///
/// Returns `None` if the prefix is absent or a field is not a number.
pub fn parse_fields(text: &str, prefix: &str) -> Option<Vec<u32>> {
    let start = text.find(prefix)? + prefix.len();
    let line = text[start..].lines().next().unwrap_or("");
    line.split(',')
        .map(|field| field.trim().parse::<u32>().ok())
        .collect()
}

/// Parse a `<prefix> <client>,<result>` pair.
pub fn parse_status_pair(text: &str, prefix: &str) -> Option<(u32, u32)> {
    match parse_fields(text, prefix)?.as_slice() {
        [client, result, ..] => Some((*client, *result)),
        _ => None,
    }
}

/// Network registration state from `+CREG?` / `+CGREG?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationStatus {
    /// Not registered, not searching.
    NotRegistered,
    /// Registered on the home network.
    Home,
    /// Searching for an operator.
    Searching,
    /// Registration denied.
    Denied,
    /// Unknown (out of coverage).
    Unknown,
    /// Registered while roaming.
    Roaming,
    /// Any other status code.
    Other(u32),
}

impl RegistrationStatus {
    /// Map the `<stat>` field.
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => RegistrationStatus::NotRegistered,
            1 => RegistrationStatus::Home,
            2 => RegistrationStatus::Searching,
            3 => RegistrationStatus::Denied,
            4 => RegistrationStatus::Unknown,
            5 => RegistrationStatus::Roaming,
            other => RegistrationStatus::Other(other),
        }
    }

    /// Parse `<prefix> <n>,<stat>` out of a response.
    pub fn parse(text: &str, prefix: &str) -> Option<Self> {
        parse_status_pair(text, prefix).map(|(_, stat)| Self::from_code(stat))
    }

    /// Home or roaming.
    pub fn is_registered(&self) -> bool {
        matches!(self, RegistrationStatus::Home | RegistrationStatus::Roaming)
    }
}

/// Signal quality from `+CSQ: <rssi>,<ber>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalQuality {
    /// RSSI index, 0..=31 or 99 for unknown.
    pub rssi: u8,
    /// Bit error rate index, 0..=7 or 99 for unknown.
    pub ber: u8,
}

impl SignalQuality {
    /// Parse the `+CSQ:` line out of a response.
    pub fn parse(text: &str) -> Option<Self> {
        match parse_fields(text, "+CSQ:")?.as_slice() {
            [rssi, ber, ..] => Some(SignalQuality {
                rssi: u8::try_from(*rssi).ok()?,
                ber: u8::try_from(*ber).ok()?,
            }),
            _ => None,
        }
    }

    /// RSSI in dBm, `None` when the modem does not know.
    pub fn dbm(&self) -> Option<i16> {
        match self.rssi {
            0..=30 => Some(-113 + 2 * i16::from(self.rssi)),
            31 => Some(-51),
            _ => None,
        }
    }
}

/// A message delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    /// Topic the message was published on. Empty if the modem output did
    /// not carry a readable topic section.
    pub topic: String,
    /// Message body.
    pub payload: Vec<u8>,
}

/// Outcome of scanning modem output for an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RxScan {
    /// No complete message yet.
    Incomplete,
    /// A complete message ending `consumed` bytes into the input.
    Message {
        message: InboundMessage,
        consumed: usize,
    },
    /// Start and end markers without a payload section.
    Malformed { consumed: usize },
}

/// Scan modem output for one complete inbound message.
///
/// The expected shape is:
///
/// ```text
/// +CMQTTRXSTART: 0,<topic_len>,<payload_len>
/// +CMQTTRXTOPIC: 0,<len>
/// <topic bytes>
/// +CMQTTRXPAYLOAD: 0,<len>
/// <payload bytes>
/// +CMQTTRXEND: 0
/// ```
///
/// Long topics or payloads may arrive as several sections; they are
/// concatenated. Section lengths are honoured when present, so payloads may
/// contain CR/LF.
pub fn scan_inbound(buf: &[u8]) -> RxScan {
    let Some(start) = find(buf, RX_START.as_bytes()) else {
        return RxScan::Incomplete;
    };
    let Some(payload_at) = find_from(buf, start, RX_PAYLOAD.as_bytes()) else {
        // The end marker cannot legitimately come before any payload section.
        return match find_from(buf, start, RX_END.as_bytes()) {
            Some(end) => RxScan::Malformed {
                consumed: line_end(buf, end),
            },
            None => RxScan::Incomplete,
        };
    };

    let (payload, payload_end) = collect_sections(buf, payload_at, RX_PAYLOAD.as_bytes());
    let Some(end) = find_from(buf, payload_end, RX_END.as_bytes()) else {
        return RxScan::Incomplete;
    };

    let (topic, _) = collect_sections(&buf[..payload_at], start, RX_TOPIC.as_bytes());

    RxScan::Message {
        message: InboundMessage {
            topic: String::from_utf8_lossy(&topic).into_owned(),
            payload,
        },
        consumed: line_end(buf, end),
    }
}

/// Index just past the CRLF ending the line that contains `at`, or the end
/// of the input if the line is unterminated.
pub(crate) fn line_end(buf: &[u8], at: usize) -> usize {
    find_from(buf, at, b"\r\n").map_or(buf.len(), |eol| eol + 2)
}

/// Concatenate the data of consecutive `marker` sections, the first found at
/// or after `from`. Later sections must follow immediately (line breaks
/// aside), so a following message is never merged in.
///
/// Returns the data and the index where scanning stopped.
fn collect_sections(buf: &[u8], from: usize, marker: &[u8]) -> (Vec<u8>, usize) {
    let mut data = Vec::new();
    let mut pos = from;
    let mut next = find_from(buf, from, marker);
    while let Some(found) = next {
        let header = found + marker.len();
        let Some(eol) = find_from(buf, header, b"\r\n") else {
            break;
        };
        let body = eol + 2;
        let declared = std::str::from_utf8(&buf[header..eol])
            .ok()
            .and_then(|h| h.rsplit(',').next())
            .and_then(|n| n.trim().parse::<usize>().ok());
        let body_end = match declared {
            Some(len) if body + len <= buf.len() => body + len,
            Some(_) => break,
            // No usable length: take everything up to the next line break.
            None => find_from(buf, body, b"\r\n").unwrap_or(buf.len()),
        };
        data.extend_from_slice(&buf[body..body_end]);
        pos = body_end;

        let mut resume = pos;
        while resume < buf.len() && matches!(buf[resume], b'\r' | b'\n') {
            resume += 1;
        }
        next = buf[resume..].starts_with(marker).then_some(resume);
    }
    (data, pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urc(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "\r\n+CMQTTRXSTART: 0,{},{}\r\n+CMQTTRXTOPIC: 0,{}\r\n{}\r\n+CMQTTRXPAYLOAD: 0,{}\r\n",
            topic.len(),
            payload.len(),
            topic.len(),
            topic,
            payload.len()
        )
        .into_bytes();
        out.extend_from_slice(payload);
        out.extend_from_slice(b"\r\n+CMQTTRXEND: 0\r\n");
        out
    }

    #[test]
    fn test_parse_status_pair() {
        assert_eq!(
            parse_status_pair("\r\n+CMQTTCONNECT: 0,0\r\n", "+CMQTTCONNECT:"),
            Some((0, 0))
        );
        assert_eq!(parse_status_pair("+CMQTTSUB: 0,11", "+CMQTTSUB:"), Some((0, 11)));
        assert_eq!(parse_status_pair("OK", "+CMQTTSUB:"), None);
    }

    #[test]
    fn test_registration_status() {
        let home = RegistrationStatus::parse("\r\n+CREG: 0,1\r\n\r\nOK\r\n", "+CREG:");
        assert_eq!(home, Some(RegistrationStatus::Home));
        assert!(home.map_or(false, |s| s.is_registered()));

        let roaming = RegistrationStatus::parse("+CGREG: 0,5\r\n", "+CGREG:");
        assert_eq!(roaming, Some(RegistrationStatus::Roaming));

        let searching = RegistrationStatus::parse("+CREG: 0,2\r\n", "+CREG:");
        assert_eq!(searching, Some(RegistrationStatus::Searching));
        assert!(!RegistrationStatus::Searching.is_registered());
        assert_eq!(RegistrationStatus::from_code(9), RegistrationStatus::Other(9));
    }

    #[test]
    fn test_signal_quality() {
        let sq = SignalQuality::parse("\r\n+CSQ: 20,99\r\n\r\nOK\r\n").expect("csq");
        assert_eq!(sq, SignalQuality { rssi: 20, ber: 99 });
        assert_eq!(sq.dbm(), Some(-73));
        assert_eq!(SignalQuality { rssi: 0, ber: 0 }.dbm(), Some(-113));
        assert_eq!(SignalQuality { rssi: 31, ber: 0 }.dbm(), Some(-51));
        assert_eq!(SignalQuality { rssi: 99, ber: 99 }.dbm(), None);
        assert_eq!(SignalQuality::parse("+CSQ: x,1"), None);
    }

    #[test]
    fn test_scan_complete_message() {
        let raw = urc("uav4g/mavlink/rx", b"/QkAAAA=");
        match scan_inbound(&raw) {
            RxScan::Message { message, consumed } => {
                assert_eq!(message.topic, "uav4g/mavlink/rx");
                assert_eq!(message.payload, b"/QkAAAA=");
                assert_eq!(consumed, raw.len());
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_scan_payload_with_line_breaks() {
        let raw = urc("t", b"a\r\nb");
        match scan_inbound(&raw) {
            RxScan::Message { message, .. } => assert_eq!(message.payload, b"a\r\nb"),
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_scan_incomplete() {
        let raw = urc("uav4g/command", b"ping");
        for cut in [0, 10, raw.len() / 2, raw.len() - 6] {
            assert_eq!(scan_inbound(&raw[..cut]), RxScan::Incomplete, "cut at {}", cut);
        }
    }

    #[test]
    fn test_scan_split_sections() {
        let raw = b"+CMQTTRXSTART: 0,4,6\r\n+CMQTTRXTOPIC: 0,2\r\nab\r\n+CMQTTRXTOPIC: 0,2\r\ncd\r\n\
+CMQTTRXPAYLOAD: 0,3\r\n123\r\n+CMQTTRXPAYLOAD: 0,3\r\n456\r\n+CMQTTRXEND: 0\r\n";
        match scan_inbound(raw) {
            RxScan::Message { message, .. } => {
                assert_eq!(message.topic, "abcd");
                assert_eq!(message.payload, b"123456");
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_scan_without_topic_section() {
        let raw = b"+CMQTTRXSTART: 0,0,2\r\n+CMQTTRXPAYLOAD: 0,2\r\nhi\r\n+CMQTTRXEND: 0\r\nOK\r\n";
        match scan_inbound(raw) {
            RxScan::Message { message, consumed } => {
                assert_eq!(message.topic, "");
                assert_eq!(message.payload, b"hi");
                assert_eq!(&raw[consumed..], b"OK\r\n");
            }
            other => panic!("unexpected scan result: {:?}", other),
        }
    }

    #[test]
    fn test_scan_malformed() {
        let raw = b"+CMQTTRXSTART: 0,1,1\r\n+CMQTTRXEND: 0\r\n";
        assert_eq!(scan_inbound(raw), RxScan::Malformed { consumed: raw.len() });
    }
}
