//! Command/response exchanges over the modem UART.
//!
//! An exchange clears the response buffer, transmits, lets the line settle,
//! then polls the UART until the expected text or `ERROR` shows up or the
//! deadline passes. Only one exchange runs at a time; the caller owns the
//! channel mutably for its duration.
//!
//! Unsolicited notifications can arrive in the middle of an exchange. Complete
//! inbound messages and the connection-lost notice are lifted out of the
//! buffer as soon as they are read and held until the session takes them.

use cellbridge_uart::{Clock, SerialPort, UartError};
use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::buffer::ResponseBuffer;
use crate::commands::AtCommand;
use crate::error::{ExchangeError, ExchangeResult};
use crate::responses::{
    line_end, scan_inbound, InboundMessage, RxScan, CONNECTION_LOST, ERROR, RX_START,
};

/// How long to wait for a previous transmission to finish.
pub const TX_FREE_TIMEOUT_MS: u64 = 1000;

/// Pause between transmitting and the first poll.
pub const SETTLE_MS: u64 = 50;

/// Interval between response polls.
pub const POLL_INTERVAL_MS: u64 = 10;

/// Inbound messages held between exchanges before the oldest is dropped.
pub const NOTIFICATION_CAPACITY: usize = 4;

/// A modem link: serial port, time source and response buffer.
pub struct CommandChannel<P: SerialPort, C: Clock> {
    port: P,
    clock: C,
    response: ResponseBuffer,
    notifications: VecDeque<InboundMessage>,
    connection_lost: bool,
}

impl<P: SerialPort, C: Clock> CommandChannel<P, C> {
    /// Wrap a serial port.
    pub fn new(port: P, clock: C) -> Self {
        CommandChannel {
            port,
            clock,
            response: ResponseBuffer::new(),
            notifications: VecDeque::with_capacity(NOTIFICATION_CAPACITY),
            connection_lost: false,
        }
    }

    /// Send a command and wait for `expected` in the reply.
    pub fn send_and_wait(
        &mut self,
        command: &AtCommand,
        expected: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<()> {
        trace!("AT >> {}", command);
        self.exchange(&command.encode(), expected, timeout_ms)
    }

    /// Send bytes that are not an AT line (data-mode bodies) and wait for
    /// `expected`.
    pub fn send_raw_and_wait(
        &mut self,
        data: &[u8],
        expected: &str,
        timeout_ms: u64,
    ) -> ExchangeResult<()> {
        trace!("AT >> <{} raw bytes>", data.len());
        self.exchange(data, expected, timeout_ms)
    }

    fn exchange(&mut self, data: &[u8], expected: &str, timeout_ms: u64) -> ExchangeResult<()> {
        self.send(data)?;
        self.clock.delay_ms(SETTLE_MS);
        self.wait_response(expected, timeout_ms)
    }

    /// Clear the response buffer and transmit `data`.
    ///
    /// Notifications already read are collected first. A partial inbound
    /// message survives the clear so the rest of it can complete it.
    pub fn send(&mut self, data: &[u8]) -> ExchangeResult<()> {
        self.collect_notifications();
        match self.response.find(RX_START) {
            Some(start) => self.response.consume(start),
            None => self.response.clear(),
        }
        self.write(data)
    }

    /// Transmit `data` without touching the response buffer.
    ///
    /// Waits up to [`TX_FREE_TIMEOUT_MS`] for a previous transmission to
    /// finish first.
    pub fn write(&mut self, data: &[u8]) -> ExchangeResult<()> {
        let start = self.clock.now_ms();
        while self.port.is_tx_busy() {
            if self.clock.elapsed_since(start) > TX_FREE_TIMEOUT_MS {
                warn!("Modem TX still busy after {} ms", TX_FREE_TIMEOUT_MS);
                return Err(ExchangeError::Busy);
            }
            self.clock.delay_ms(1);
        }

        match self.port.transmit(data) {
            Ok(sent) if sent < data.len() => {
                warn!("Modem TX accepted {} of {} bytes", sent, data.len());
                Ok(())
            }
            Ok(_) => Ok(()),
            Err(UartError::Busy) => Err(ExchangeError::Busy),
            Err(err) => Err(ExchangeError::Transport(err)),
        }
    }

    /// Poll until `expected` or `ERROR` appears in the response buffer, or
    /// `timeout_ms` passes.
    ///
    /// If both are present the one that arrived first decides.
    pub fn wait_response(&mut self, expected: &str, timeout_ms: u64) -> ExchangeResult<()> {
        let start = self.clock.now_ms();
        loop {
            self.poll();
            self.collect_notifications();

            let hit = self.response.find(expected);
            let error = self.response.find(ERROR);
            match (hit, error) {
                (Some(h), Some(e)) if e < h => return Err(self.rejected(expected)),
                (Some(_), _) => {
                    trace!("AT << {:?}", self.response.text());
                    return Ok(());
                }
                (None, Some(_)) => return Err(self.rejected(expected)),
                (None, None) => {}
            }

            if self.clock.elapsed_since(start) >= timeout_ms {
                debug!(
                    "Timed out after {} ms waiting for {:?}, got {:?}",
                    timeout_ms,
                    expected,
                    self.response.text()
                );
                return Err(ExchangeError::Timeout {
                    expected: expected.to_string(),
                    timeout_ms,
                });
            }
            self.clock.delay_ms(POLL_INTERVAL_MS);
        }
    }

    fn rejected(&self, expected: &str) -> ExchangeError {
        debug!("Modem answered ERROR waiting for {:?}: {:?}", expected, self.response.text());
        ExchangeError::Rejected {
            expected: expected.to_string(),
        }
    }

    /// Lift complete inbound messages and the connection-lost notice out of
    /// the response buffer.
    ///
    /// Text around them stays in place. Returns `true` if the notice was
    /// found in this pass.
    pub fn collect_notifications(&mut self) -> bool {
        while let Some(start) = self.response.find(RX_START) {
            match scan_inbound(&self.response.as_bytes()[start..]) {
                RxScan::Message { message, consumed } => {
                    self.response.remove(start, start + consumed);
                    if self.notifications.len() >= NOTIFICATION_CAPACITY {
                        warn!("Notification backlog full, dropping oldest message");
                        self.notifications.pop_front();
                    }
                    trace!("AT << inbound message on {:?}", message.topic);
                    self.notifications.push_back(message);
                }
                RxScan::Malformed { consumed } => {
                    warn!("Discarding inbound notification without payload");
                    self.response.remove(start, start + consumed);
                }
                RxScan::Incomplete => break,
            }
        }

        let Some(at) = self.response.find(CONNECTION_LOST) else {
            return false;
        };
        let end = line_end(self.response.as_bytes(), at);
        self.response.remove(at, end);
        debug!("Connection-lost notice collected");
        self.connection_lost = true;
        true
    }

    /// Take the oldest collected inbound message.
    pub fn take_notification(&mut self) -> Option<InboundMessage> {
        self.notifications.pop_front()
    }

    /// Whether a connection-lost notice was collected since the last call.
    pub fn take_connection_lost(&mut self) -> bool {
        std::mem::take(&mut self.connection_lost)
    }

    /// Forget collected notifications.
    pub fn discard_notifications(&mut self) {
        self.notifications.clear();
        self.connection_lost = false;
    }

    /// Move any received bytes into the response buffer without waiting.
    pub fn poll(&mut self) -> usize {
        self.response.fill_from(&mut self.port)
    }

    /// Modem output collected since the last clear.
    pub fn response(&self) -> &ResponseBuffer {
        &self.response
    }

    /// Mutable access to the response buffer.
    pub fn response_mut(&mut self) -> &mut ResponseBuffer {
        &mut self.response
    }

    /// Time source.
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Sleep through the channel's clock.
    pub fn delay_ms(&self, ms: u64) {
        self.clock.delay_ms(ms);
    }

    /// Underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Mutable access to the underlying port.
    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }
}

impl<P: SerialPort, C: Clock> std::fmt::Debug for CommandChannel<P, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandChannel")
            .field("response", &self.response.text())
            .field("notifications", &self.notifications.len())
            .field("connection_lost", &self.connection_lost)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cellbridge_uart::{MockClock, UartResult};
    use std::collections::VecDeque;

    /// Port whose replies appear after a scripted delay.
    struct ScriptedPort {
        clock: MockClock,
        pending: VecDeque<(u64, Vec<u8>)>,
        rx: VecDeque<u8>,
        sent: Vec<Vec<u8>>,
        busy_until: u64,
        replies: VecDeque<(u64, Vec<u8>)>,
    }

    impl ScriptedPort {
        fn new(clock: MockClock) -> Self {
            ScriptedPort {
                clock,
                pending: VecDeque::new(),
                rx: VecDeque::new(),
                sent: Vec::new(),
                busy_until: 0,
                replies: VecDeque::new(),
            }
        }

        /// Queue a reply delivered `delay` ms after the next transmit.
        fn reply_after(&mut self, delay: u64, bytes: &[u8]) {
            self.replies.push_back((delay, bytes.to_vec()));
        }

        fn pump(&mut self) {
            let now = self.clock.now_ms();
            while self.pending.front().map_or(false, |(at, _)| *at <= now) {
                if let Some((_, bytes)) = self.pending.pop_front() {
                    self.rx.extend(bytes);
                }
            }
        }
    }

    impl SerialPort for ScriptedPort {
        fn available(&self) -> usize {
            let now = self.clock.now_ms();
            self.rx.len()
                + self
                    .pending
                    .iter()
                    .filter(|(at, _)| *at <= now)
                    .map(|(_, b)| b.len())
                    .sum::<usize>()
        }

        fn read(&mut self, buf: &mut [u8]) -> usize {
            self.pump();
            let n = buf.len().min(self.rx.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.rx.pop_front().unwrap_or(0);
            }
            n
        }

        fn read_byte(&mut self) -> Option<u8> {
            self.pump();
            self.rx.pop_front()
        }

        fn transmit(&mut self, data: &[u8]) -> UartResult<usize> {
            if self.is_tx_busy() {
                return Err(UartError::Busy);
            }
            self.sent.push(data.to_vec());
            if let Some((delay, bytes)) = self.replies.pop_front() {
                self.pending.push_back((self.clock.now_ms() + delay, bytes));
            }
            Ok(data.len())
        }

        fn is_tx_busy(&self) -> bool {
            self.clock.now_ms() < self.busy_until
        }

        fn flush(&mut self) {
            self.pump();
            self.rx.clear();
        }
    }

    fn channel() -> (CommandChannel<ScriptedPort, MockClock>, MockClock) {
        let clock = MockClock::new();
        let port = ScriptedPort::new(clock.clone());
        (CommandChannel::new(port, clock.clone()), clock)
    }

    #[test]
    fn test_expected_within_window() {
        let (mut ch, clock) = channel();
        ch.port_mut().reply_after(300, b"\r\nOK\r\n");
        assert_eq!(ch.send_and_wait(&AtCommand::Attention, "OK", 2000), Ok(()));
        assert!(clock.now_ms() >= 300);
        assert!(clock.now_ms() < 2000);
        assert_eq!(ch.port().sent[0], b"AT\r\n");
    }

    #[test]
    fn test_error_first_fails_early() {
        let (mut ch, clock) = channel();
        ch.port_mut().reply_after(100, b"\r\nERROR\r\n");
        let result = ch.send_and_wait(&AtCommand::SimStatus, "+CPIN: READY", 5000);
        assert_eq!(
            result,
            Err(ExchangeError::Rejected {
                expected: "+CPIN: READY".into()
            })
        );
        assert!(clock.now_ms() < 5000);
    }

    #[test]
    fn test_earlier_marker_wins() {
        let (mut ch, _clock) = channel();
        ch.port_mut().reply_after(0, b"\r\nOK\r\n\r\n+CMQTTSTART: 23\r\nERROR\r\n");
        assert_eq!(ch.send_and_wait(&AtCommand::MqttStart, "OK", 1000), Ok(()));

        ch.port_mut().reply_after(0, b"\r\nERROR\r\n\r\nOK\r\n");
        assert!(ch.send_and_wait(&AtCommand::MqttStart, "OK", 1000).is_err());
    }

    #[test]
    fn test_silence_times_out_after_full_window() {
        let (mut ch, clock) = channel();
        let result = ch.send_and_wait(&AtCommand::Attention, "OK", 2000);
        assert!(matches!(result, Err(ExchangeError::Timeout { timeout_ms: 2000, .. })));
        assert!(clock.now_ms() >= SETTLE_MS + 2000);
    }

    #[test]
    fn test_late_reply_is_a_timeout() {
        let (mut ch, _clock) = channel();
        ch.port_mut().reply_after(3000, b"OK\r\n");
        assert!(ch.send_and_wait(&AtCommand::Attention, "OK", 2000).is_err());
    }

    #[test]
    fn test_busy_transmitter() {
        let (mut ch, clock) = channel();
        ch.port_mut().busy_until = 5000;
        assert_eq!(ch.send(b"AT\r\n"), Err(ExchangeError::Busy));
        assert!(clock.now_ms() > TX_FREE_TIMEOUT_MS);
        assert!(ch.port().sent.is_empty());

        // A transmitter that frees up inside the grace period is waited out.
        let (mut ch, clock) = channel();
        ch.port_mut().busy_until = 400;
        assert_eq!(ch.send(b"AT\r\n"), Ok(()));
        assert!(clock.now_ms() >= 400);
    }

    #[test]
    fn test_send_clears_previous_response() {
        let (mut ch, _clock) = channel();
        ch.response_mut().extend(b"stale OK");
        ch.port_mut().reply_after(0, b"\r\n>");
        assert_eq!(ch.send_raw_and_wait(b"payload", ">", 500), Ok(()));
        assert!(!ch.response().contains("stale"));
        assert_eq!(ch.port().sent[0], b"payload");
    }

    const URC: &[u8] = b"\r\n+CMQTTRXSTART: 0,1,2\r\n+CMQTTRXTOPIC: 0,1\r\nt\r\n\
+CMQTTRXPAYLOAD: 0,2\r\nOK\r\n+CMQTTRXEND: 0\r\n";

    #[test]
    fn test_message_before_reply_is_kept() {
        let (mut ch, _clock) = channel();
        let mut reply = URC.to_vec();
        reply.extend_from_slice(b"\r\n>");
        ch.port_mut().reply_after(0, &reply);

        assert_eq!(ch.send_and_wait(&AtCommand::MqttTopic { len: 1 }, ">", 500), Ok(()));

        let message = ch.take_notification().expect("message collected");
        assert_eq!(message.topic, "t");
        assert_eq!(message.payload, b"OK");
        assert!(ch.take_notification().is_none());
        assert_eq!(ch.response().as_bytes(), b"\r\n\r\n>");
    }

    #[test]
    fn test_message_payload_does_not_answer_exchange() {
        let (mut ch, _clock) = channel();
        // The payload reads "OK" but the command itself is never answered.
        ch.port_mut().reply_after(0, URC);

        let result = ch.send_and_wait(&AtCommand::Attention, "OK", 500);
        assert!(matches!(result, Err(ExchangeError::Timeout { .. })));
        assert!(ch.take_notification().is_some());
    }

    #[test]
    fn test_unread_message_survives_next_send() {
        let (mut ch, _clock) = channel();
        ch.response_mut().extend(b"\r\nOK\r\n");
        ch.response_mut().extend(URC);

        ch.port_mut().reply_after(0, b"\r\nOK\r\n");
        assert_eq!(ch.send_and_wait(&AtCommand::Attention, "OK", 500), Ok(()));
        assert_eq!(ch.take_notification().map(|m| m.payload), Some(b"OK".to_vec()));
    }

    #[test]
    fn test_partial_message_survives_send() {
        let (mut ch, _clock) = channel();
        let (head, tail) = URC.split_at(30);
        ch.response_mut().extend(b"\r\nstale\r\n");
        ch.response_mut().extend(head);

        ch.send(b"AT\r\n").expect("send");
        assert!(!ch.response().contains("stale"));
        assert!(ch.response().contains("+CMQTTRXSTART:"));

        ch.response_mut().extend(tail);
        ch.collect_notifications();
        assert_eq!(ch.take_notification().map(|m| m.topic), Some("t".to_string()));
        assert!(ch.response().is_empty());
    }

    #[test]
    fn test_connection_lost_during_exchange() {
        let (mut ch, _clock) = channel();
        ch.port_mut()
            .reply_after(0, b"\r\n+CMQTTCONNLOST: 0,1\r\n\r\nOK\r\n");

        assert_eq!(ch.send_and_wait(&AtCommand::SignalQuality, "OK", 500), Ok(()));
        assert!(!ch.response().contains("+CMQTTCONNLOST:"));
        assert!(ch.take_connection_lost());
        assert!(!ch.take_connection_lost());
    }

    #[test]
    fn test_notification_backlog_drops_oldest() {
        let (mut ch, _clock) = channel();
        for _ in 0..NOTIFICATION_CAPACITY + 1 {
            ch.response_mut().extend(URC);
            ch.collect_notifications();
        }
        let held = std::iter::from_fn(|| ch.take_notification()).count();
        assert_eq!(held, NOTIFICATION_CAPACITY);

        ch.response_mut().extend(b"+CMQTTCONNLOST: 0,1\r\n");
        assert!(ch.collect_notifications());
        ch.discard_notifications();
        assert!(!ch.take_connection_lost());
    }
}
