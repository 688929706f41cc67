//! A7600 modem simulator.
//!
//! [`SimModem`] sits behind the transmit side of a [`UartDma`] and answers the
//! AT/MQTT dialect the driver speaks: data-mode prompts, publish bookkeeping,
//! subscriptions and certificate downloads. Replies are pushed straight into
//! the receive ring, so an exchange sees them on its first poll. A
//! [`SimHandle`] scripts replies, injects notifications and exposes what the
//! modem received.
//!
//! ```rust,ignore
//! let (uart, sim) = sim_uart();
//! sim.reply_once("AT+CPIN?", Reply::Text("\r\n+CPIN: SIM PIN\r\n\r\nOK\r\n".into()));
//! let mut session = Session::new(uart, MockClock::new(), MqttConfig::default());
//! assert!(session.connect().is_err());
//! ```

use std::sync::Arc;

use cellbridge_uart::{
    dma_channel, DmaRegion, DmaWriter, TxComplete, TxDma, UartDma, UartResult, RX_BUFFER_SIZE,
};
use log::{debug, trace};
use parking_lot::Mutex;

/// A UART wired to a simulated modem.
pub type SimUart = UartDma<DmaRegion, SimModem>;

/// Canned reply for a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `OK` final result.
    Ok,
    /// `ERROR` final result.
    Error,
    /// Exactly these bytes.
    Text(String),
    /// No reply at all.
    Silent,
}

impl Reply {
    fn bytes(&self) -> Vec<u8> {
        match self {
            Reply::Ok => b"\r\nOK\r\n".to_vec(),
            Reply::Error => b"\r\nERROR\r\n".to_vec(),
            Reply::Text(text) => text.as_bytes().to_vec(),
            Reply::Silent => Vec::new(),
        }
    }
}

/// A message the simulated broker accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Topic.
    pub topic: String,
    /// Payload bytes.
    pub payload: Vec<u8>,
    /// QoS level from the publish command.
    pub qos: u8,
}

#[derive(Debug)]
struct Rule {
    pattern: String,
    reply: Reply,
    remaining: Option<usize>,
}

impl Rule {
    /// A pattern without `=` names a command (`AT+CSQ` matches `AT+CSQ` and
    /// `AT+CSQ=...`, but `AT` matches only `AT`). A pattern with `=` is a
    /// line prefix (`AT+CGACT=1` matches `AT+CGACT=1,1`).
    fn matches(&self, line: &str) -> bool {
        if self.pattern.contains('=') {
            line.starts_with(&self.pattern)
        } else {
            line.split('=').next() == Some(self.pattern.as_str())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DataTarget {
    Topic,
    Payload,
    Certificate,
}

#[derive(Debug)]
struct DataMode {
    target: DataTarget,
    remaining: usize,
    body: Vec<u8>,
}

#[derive(Debug)]
struct SimState {
    writer: DmaWriter,
    rules: Vec<Rule>,
    line: Vec<u8>,
    data: Option<DataMode>,
    commands: Vec<String>,
    raw_writes: Vec<Vec<u8>>,
    topic: Option<String>,
    payload: Vec<u8>,
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    pending_cert: Option<String>,
    certificates: Vec<(String, Vec<u8>)>,
    broker_connected: bool,
    csq: (u8, u8),
}

impl SimState {
    fn receive(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            if let Some(mode) = self.data.as_mut() {
                let take = mode.remaining.min(bytes.len());
                mode.body.extend_from_slice(&bytes[..take]);
                mode.remaining -= take;
                bytes = &bytes[take..];
                if mode.remaining == 0 {
                    if let Some(done) = self.data.take() {
                        self.finish_data(done);
                    }
                }
                continue;
            }

            let byte = bytes[0];
            bytes = &bytes[1..];
            match byte {
                b'\r' | b'\n' => {
                    // Swallow the LF of a CRLF so it never lands in a data-mode body.
                    if byte == b'\r' && bytes.first() == Some(&b'\n') {
                        bytes = &bytes[1..];
                    }
                    if !self.line.is_empty() {
                        let line = String::from_utf8_lossy(&self.line).into_owned();
                        self.line.clear();
                        self.handle_command(line);
                    }
                }
                other => self.line.push(other),
            }
        }
    }

    fn finish_data(&mut self, done: DataMode) {
        self.raw_writes.push(done.body.clone());
        match done.target {
            DataTarget::Topic => self.topic = Some(String::from_utf8_lossy(&done.body).into_owned()),
            DataTarget::Payload => self.payload = done.body,
            DataTarget::Certificate => {
                let name = self.pending_cert.take().unwrap_or_default();
                debug!("SIM stored certificate {} ({} bytes)", name, done.body.len());
                self.certificates.push((name, done.body));
            }
        }
        self.push(b"\r\nOK\r\n");
    }

    fn push(&self, bytes: &[u8]) {
        self.writer.push(bytes);
    }

    fn scripted(&mut self, line: &str) -> Option<Reply> {
        let index = self.rules.iter().position(|r| r.matches(line))?;
        let rule = &mut self.rules[index];
        let reply = rule.reply.clone();
        let exhausted = match rule.remaining.as_mut() {
            Some(remaining) => {
                *remaining -= 1;
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.rules.remove(index);
        }
        Some(reply)
    }

    fn enter_data(&mut self, target: DataTarget, len: usize) {
        if len == 0 {
            self.push(b"\r\nERROR\r\n");
            return;
        }
        self.data = Some(DataMode {
            target,
            remaining: len,
            body: Vec::with_capacity(len),
        });
        self.push(b"\r\n>");
    }

    fn handle_command(&mut self, line: String) {
        trace!("SIM << {}", line);
        self.commands.push(line.clone());

        if let Some(reply) = self.scripted(&line) {
            self.push(&reply.bytes());
            return;
        }

        let (name, args) = match line.split_once('=') {
            Some((name, args)) => (name, args),
            None => (line.as_str(), ""),
        };
        let ok = b"\r\nOK\r\n";

        match name {
            "AT" | "ATE0" | "AT+CGACT" | "AT+CGDCONT" | "AT+CSSLCFG" | "AT+CMQTTSSLCFG"
            | "AT+CMQTTREL" => self.push(ok),
            "AT+CPIN?" => self.push(b"\r\n+CPIN: READY\r\n\r\nOK\r\n"),
            "AT+CREG?" => self.push(b"\r\n+CREG: 0,1\r\n\r\nOK\r\n"),
            "AT+CGREG?" => self.push(b"\r\n+CGREG: 0,1\r\n\r\nOK\r\n"),
            "AT+CSQ" => {
                let text = format!("\r\n+CSQ: {},{}\r\n\r\nOK\r\n", self.csq.0, self.csq.1);
                self.push(text.as_bytes());
            }
            "AT+CMQTTSTART" => self.push(b"\r\nOK\r\n\r\n+CMQTTSTART: 0\r\n"),
            "AT+CMQTTSTOP" => self.push(b"\r\nOK\r\n\r\n+CMQTTSTOP: 0\r\n"),
            "AT+CMQTTACCQ" => self.push(ok),
            "AT+CMQTTDISC" => {
                if self.broker_connected {
                    self.broker_connected = false;
                    self.subscriptions.clear();
                    self.push(b"\r\nOK\r\n\r\n+CMQTTDISC: 0,0\r\n");
                } else {
                    self.push(b"\r\nERROR\r\n");
                }
            }
            "AT+CMQTTCONNECT" => {
                self.broker_connected = true;
                self.push(b"\r\nOK\r\n\r\n+CMQTTCONNECT: 0,0\r\n");
            }
            "AT+CMQTTSUB" if self.broker_connected => {
                if let Some(topic) = quoted(args) {
                    self.subscriptions.push(topic);
                }
                self.push(b"\r\nOK\r\n\r\n+CMQTTSUB: 0,0\r\n");
            }
            "AT+CMQTTUNSUB" if self.broker_connected => {
                if let Some(topic) = quoted(args) {
                    self.subscriptions.retain(|t| *t != topic);
                }
                self.push(b"\r\nOK\r\n\r\n+CMQTTUNSUB: 0,0\r\n");
            }
            "AT+CMQTTTOPIC" => self.enter_data(DataTarget::Topic, last_number(args)),
            "AT+CMQTTPAYLOAD" => self.enter_data(DataTarget::Payload, last_number(args)),
            "AT+CMQTTPUB" if self.broker_connected => match self.topic.take() {
                Some(topic) => {
                    let qos = args
                        .split(',')
                        .nth(1)
                        .and_then(|q| q.trim().parse().ok())
                        .unwrap_or(0);
                    let payload = std::mem::take(&mut self.payload);
                    debug!("SIM published {} bytes to {}", payload.len(), topic);
                    self.published.push(PublishedMessage {
                        topic,
                        payload,
                        qos,
                    });
                    self.push(b"\r\nOK\r\n\r\n+CMQTTPUB: 0,0\r\n");
                }
                None => self.push(b"\r\nERROR\r\n"),
            },
            "AT+CCERTDOWN" => {
                self.pending_cert = quoted(args);
                self.enter_data(DataTarget::Certificate, last_number(args));
            }
            _ => self.push(b"\r\nERROR\r\n"),
        }
    }
}

/// First double-quoted string in `args`.
fn quoted(args: &str) -> Option<String> {
    let start = args.find('"')? + 1;
    let len = args[start..].find('"')?;
    Some(args[start..start + len].to_string())
}

/// Last comma-separated field of `args` as a number, 0 if absent.
fn last_number(args: &str) -> usize {
    args.rsplit(',')
        .next()
        .and_then(|n| n.trim().parse().ok())
        .unwrap_or(0)
}

/// Transmit engine of a simulated modem.
#[derive(Debug)]
pub struct SimModem {
    state: Arc<Mutex<SimState>>,
}

impl TxDma for SimModem {
    fn start(&mut self, data: &[u8], done: TxComplete) -> UartResult<()> {
        self.state.lock().receive(data);
        done.signal();
        Ok(())
    }
}

/// Control and inspection handle for a [`SimModem`].
#[derive(Debug, Clone)]
pub struct SimHandle {
    state: Arc<Mutex<SimState>>,
}

impl SimHandle {
    fn add_rule(&self, pattern: &str, reply: Reply, remaining: Option<usize>) {
        self.state.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            reply,
            remaining,
        });
    }

    /// Answer every command matching `pattern` with `reply`.
    ///
    /// A pattern without `=` matches a command name exactly; with `=` it
    /// matches any line starting with it. Earlier rules take precedence.
    pub fn set_reply(&self, pattern: &str, reply: Reply) {
        self.add_rule(pattern, reply, None);
    }

    /// Answer the next command matching `pattern` with `reply`.
    pub fn reply_once(&self, pattern: &str, reply: Reply) {
        self.add_rule(pattern, reply, Some(1));
    }

    /// Answer the next `times` commands matching `pattern` with `reply`.
    pub fn reply_times(&self, pattern: &str, reply: Reply, times: usize) {
        if times > 0 {
            self.add_rule(pattern, reply, Some(times));
        }
    }

    /// Remove all scripted replies.
    pub fn clear_replies(&self) {
        self.state.lock().rules.clear();
    }

    /// Signal quality reported by `AT+CSQ`.
    pub fn set_signal(&self, rssi: u8, ber: u8) {
        self.state.lock().csq = (rssi, ber);
    }

    /// Deliver an inbound message as the modem would.
    pub fn inject_message(&self, topic: &str, payload: &[u8]) {
        let mut bytes = format!(
            "\r\n+CMQTTRXSTART: 0,{tl},{pl}\r\n+CMQTTRXTOPIC: 0,{tl}\r\n{topic}\r\n+CMQTTRXPAYLOAD: 0,{pl}\r\n",
            tl = topic.len(),
            pl = payload.len(),
            topic = topic,
        )
        .into_bytes();
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(b"\r\n+CMQTTRXEND: 0\r\n");
        self.state.lock().push(&bytes);
    }

    /// Report that the broker connection dropped.
    pub fn inject_connection_lost(&self) {
        let mut state = self.state.lock();
        state.broker_connected = false;
        state.subscriptions.clear();
        state.push(b"\r\n+CMQTTCONNLOST: 0,1\r\n");
    }

    /// Push arbitrary bytes into the receive ring.
    pub fn inject_raw(&self, bytes: &[u8]) {
        self.state.lock().push(bytes);
    }

    /// Command lines received so far.
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Number of received commands starting with `prefix`.
    pub fn command_count(&self, prefix: &str) -> usize {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Data-mode bodies received so far.
    pub fn raw_writes(&self) -> Vec<Vec<u8>> {
        self.state.lock().raw_writes.clone()
    }

    /// Messages accepted for publication.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().published.clone()
    }

    /// Current subscriptions.
    pub fn subscriptions(&self) -> Vec<String> {
        self.state.lock().subscriptions.clone()
    }

    /// Stored certificates as `(name, body)`.
    pub fn certificates(&self) -> Vec<(String, Vec<u8>)> {
        self.state.lock().certificates.clone()
    }

    /// Whether the simulated broker session is up.
    pub fn is_broker_connected(&self) -> bool {
        self.state.lock().broker_connected
    }

    /// Forget recorded commands, writes and publications.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.commands.clear();
        state.raw_writes.clear();
        state.published.clear();
    }
}

/// Build a simulated modem feeding `writer`.
pub fn sim_modem(writer: DmaWriter) -> (SimModem, SimHandle) {
    let state = Arc::new(Mutex::new(SimState {
        writer,
        rules: Vec::new(),
        line: Vec::new(),
        data: None,
        commands: Vec::new(),
        raw_writes: Vec::new(),
        topic: None,
        payload: Vec::new(),
        published: Vec::new(),
        subscriptions: Vec::new(),
        pending_cert: None,
        certificates: Vec::new(),
        broker_connected: false,
        csq: (20, 99),
    }));
    (
        SimModem {
            state: Arc::clone(&state),
        },
        SimHandle { state },
    )
}

/// A UART connected to a fresh simulated modem.
pub fn sim_uart() -> (SimUart, SimHandle) {
    let (writer, region) = dma_channel(RX_BUFFER_SIZE);
    let (modem, handle) = sim_modem(writer);
    (UartDma::new(region, modem), handle)
}
