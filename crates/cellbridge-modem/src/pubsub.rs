//! Publish, subscribe and inbound message handling on a connected session.
//!
//! Publishing is a three-stage exchange: the topic and the payload are each
//! announced by length, sent raw after the modem's `>` prompt, and finally
//! committed with `AT+CMQTTPUB`. A failed stage abandons the rest and the
//! session returns to [`SessionState::Connected`].
//!
//! Inbound messages and the connection-lost notice are picked up after every
//! exchange as well as by [`Session::process`], so neither is missed while a
//! publish or subscribe is running.

use cellbridge_metrics::metric_defs;
use cellbridge_uart::{Clock, SerialPort, TX_BUFFER_SIZE};
use log::{debug, error, info, trace, warn};

use crate::commands::{is_quotable, AtCommand, QoS};
use crate::error::{ExchangeError, PubSubError, PubSubResult};
use crate::responses::{InboundMessage, OK, PROMPT, PUBLISH_OK, RX_START, SUBSCRIBE_OK};
use crate::session::{Session, SessionState, COMMAND_TIMEOUT_MS, INBOUND_QUEUE_CAPACITY};

/// Longest topic accepted.
pub const MAX_TOPIC_LEN: usize = 64;

/// Seconds the modem may wait for the broker to acknowledge a publish.
pub const PUBLISH_TIMEOUT_SECS: u16 = 60;

/// Pause after each data-mode body.
const DATA_SETTLE_MS: u64 = 100;

fn check_topic(topic: &str) -> PubSubResult<()> {
    if topic.is_empty() || topic.len() > MAX_TOPIC_LEN {
        return Err(PubSubError::InvalidArgument(format!(
            "topic length {} outside 1..={}",
            topic.len(),
            MAX_TOPIC_LEN
        )));
    }
    if !is_quotable(topic) {
        return Err(PubSubError::InvalidArgument(
            "topic contains a quote or line break".into(),
        ));
    }
    Ok(())
}

impl<P: SerialPort, C: Clock> Session<P, C> {
    /// Subscribe to `topic`.
    pub fn subscribe(&mut self, topic: &str, qos: QoS) -> PubSubResult<()> {
        if !self.connected {
            return Err(PubSubError::NotConnected);
        }
        check_topic(topic)?;

        self.state = SessionState::Subscribing;
        let command = AtCommand::MqttSubscribe {
            topic: topic.to_string(),
            qos,
        };
        let result = self
            .exchange(&command, SUBSCRIBE_OK, COMMAND_TIMEOUT_MS)
            .and_then(|()| self.check_link());
        if self.connected {
            self.state = SessionState::Connected;
        }

        result.map_err(|source| {
            warn!("Subscribe to {} failed: {}", topic, source);
            PubSubError::Failed {
                stage: "subscribe",
                source,
            }
        })?;

        if !self.subscriptions.iter().any(|t| t == topic) {
            self.subscriptions.push(topic.to_string());
        }
        info!("Subscribed to {} (QoS {})", topic, qos.level());
        Ok(())
    }

    /// Unsubscribe from `topic`.
    pub fn unsubscribe(&mut self, topic: &str) -> PubSubResult<()> {
        if !self.connected {
            return Err(PubSubError::NotConnected);
        }
        check_topic(topic)?;

        let command = AtCommand::MqttUnsubscribe {
            topic: topic.to_string(),
        };
        self.exchange(&command, OK, COMMAND_TIMEOUT_MS)
            .map_err(|source| PubSubError::Failed {
                stage: "unsubscribe",
                source,
            })?;
        self.subscriptions.retain(|t| t != topic);
        info!("Unsubscribed from {}", topic);
        Ok(())
    }

    /// Publish `payload` on `topic`.
    ///
    /// `retain` is accepted for API completeness; the modem's publish command
    /// has no retain flag, so it is not transmitted.
    pub fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
        retain: bool,
    ) -> PubSubResult<()> {
        if !self.connected {
            return Err(PubSubError::NotConnected);
        }
        check_topic(topic)?;
        if payload.is_empty() || payload.len() > TX_BUFFER_SIZE {
            return Err(PubSubError::InvalidArgument(format!(
                "payload length {} outside 1..={}",
                payload.len(),
                TX_BUFFER_SIZE
            )));
        }
        if retain {
            trace!("Retain flag not supported by the modem, ignoring");
        }

        self.state = SessionState::Publishing;
        let result = self.publish_stages(topic, payload, qos);
        if self.connected {
            self.state = SessionState::Connected;
        }

        match result {
            Ok(()) => {
                metrics::counter!(metric_defs::MESSAGES_PUBLISHED.name, "qos" => qos.level().to_string())
                    .increment(1);
                debug!("Published {} bytes to {}", payload.len(), topic);
                Ok(())
            }
            Err(err) => {
                error!(
                    "Publish to {} failed: {}. Response: {:?}",
                    topic,
                    err,
                    self.channel.response().text()
                );
                Err(err)
            }
        }
    }

    fn publish_stages(&mut self, topic: &str, payload: &[u8], qos: QoS) -> PubSubResult<()> {
        let fail = |stage: &'static str| move |source: ExchangeError| PubSubError::Failed { stage, source };

        // Once a prompt is accepted the body is always sent, so the modem
        // leaves data mode before a lost connection ends the publish.
        self.exchange(&AtCommand::MqttTopic { len: topic.len() }, PROMPT, COMMAND_TIMEOUT_MS)
            .map_err(fail("topic length"))?;
        self.exchange_raw(topic.as_bytes(), OK, COMMAND_TIMEOUT_MS)
            .and_then(|()| self.check_link())
            .map_err(fail("topic"))?;
        self.channel.delay_ms(DATA_SETTLE_MS);

        self.exchange(&AtCommand::MqttPayload { len: payload.len() }, PROMPT, COMMAND_TIMEOUT_MS)
            .map_err(fail("payload length"))?;
        self.exchange_raw(payload, OK, COMMAND_TIMEOUT_MS)
            .and_then(|()| self.check_link())
            .map_err(fail("payload"))?;
        self.channel.delay_ms(DATA_SETTLE_MS);

        let commit = AtCommand::MqttPublish {
            qos,
            timeout_secs: PUBLISH_TIMEOUT_SECS,
        };
        self.exchange(&commit, PUBLISH_OK, COMMAND_TIMEOUT_MS)
            .map_err(fail("publish"))
    }

    fn check_link(&self) -> Result<(), ExchangeError> {
        if self.connected {
            Ok(())
        } else {
            Err(ExchangeError::ConnectionLost)
        }
    }

    /// Publish a text message without retain.
    pub fn publish_str(&mut self, topic: &str, message: &str, qos: QoS) -> PubSubResult<()> {
        self.publish(topic, message.as_bytes(), qos, false)
    }

    /// Collect modem output and handle unsolicited notifications.
    ///
    /// Call regularly while connected. Complete inbound messages are queued
    /// for [`Session::next_inbound`]; a lost connection clears the connected
    /// flag and returns the session to [`SessionState::Idle`].
    pub fn process(&mut self) {
        if !self.connected {
            return;
        }
        self.channel.poll();
        self.channel.collect_notifications();
        if self.absorb_notifications() {
            self.channel.response_mut().clear();
            return;
        }

        let response = self.channel.response_mut();
        if response.find(RX_START).is_none() {
            // Nothing pending: drop completed lines so the buffer never fills
            // with stray result codes.
            if let Some(last_eol) = response.as_bytes().iter().rposition(|&b| b == b'\n') {
                response.consume(last_eol + 1);
            }
        } else if response.is_full() {
            warn!("Inbound notification does not fit the response buffer, discarding");
            response.clear();
        }
    }

    /// Queue the messages the channel collected and act on a lost
    /// connection. Returns `true` if a connected session just went down.
    pub(crate) fn absorb_notifications(&mut self) -> bool {
        while let Some(message) = self.channel.take_notification() {
            if self.connected {
                self.queue_inbound(message);
            } else {
                debug!("Inbound message on {:?} while not connected, dropped", message.topic);
            }
        }

        if !self.channel.take_connection_lost() || !self.connected {
            return false;
        }
        warn!("MQTT connection lost (state {:?})", self.state);
        metrics::counter!(metric_defs::CONNECTION_LOSSES.name).increment(1);
        self.connected = false;
        self.state = SessionState::Idle;
        self.subscriptions.clear();
        true
    }

    fn queue_inbound(&mut self, mut message: InboundMessage) {
        if message.topic.is_empty() {
            if let [only] = self.subscriptions.as_slice() {
                message.topic = only.clone();
            } else {
                debug!("Inbound message without topic");
            }
        }
        if self.inbound.len() >= INBOUND_QUEUE_CAPACITY {
            warn!("Inbound queue full, dropping oldest message");
            metrics::counter!(metric_defs::INBOUND_OVERFLOW.name).increment(1);
            self.inbound.pop_front();
        }
        metrics::counter!(metric_defs::MESSAGES_RECEIVED.name).increment(1);
        info!(
            "Received {} bytes on {:?}",
            message.payload.len(),
            message.topic
        );
        self.inbound.push_back(message);
    }

    /// Take the oldest queued inbound message.
    pub fn next_inbound(&mut self) -> Option<InboundMessage> {
        self.inbound.pop_front()
    }

    /// Number of queued inbound messages.
    pub fn pending_inbound(&self) -> usize {
        self.inbound.len()
    }
}
