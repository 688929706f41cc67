//! Metric declarations for the cellbridge stack.
//!
//! Every counter, gauge and histogram the core crates emit is declared here as
//! a [`Metric`] constant, so names live in one place and exporters can be told
//! what each one means. Emission goes straight through the `metrics` facade,
//! which is re-exported; nothing is recorded unless the binary installs a
//! recorder.
//!
//! # Example
//!
//! ```rust,ignore
//! use cellbridge_metrics::{describe_metrics, metric_defs};
//!
//! describe_metrics();
//! metrics::counter!(metric_defs::FRAMES_FORWARDED.name).increment(1);
//! metrics::counter!(metric_defs::BRINGUP_FAILURES.name, "step" => "3").increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// What a metric measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonically increasing.
    Counter,
    /// Current value, can go either way.
    Gauge,
    /// Distribution of observed values.
    Histogram,
}

impl MetricKind {
    /// Lowercase name of the kind.
    pub const fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl std::fmt::Display for MetricKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric declaration: name plus the metadata handed to the recorder.
///
/// Built with const constructors so declarations can be `const` items:
///
/// ```rust
/// use cellbridge_metrics::{Metric, MetricKind};
/// use metrics::Unit;
///
/// const RETRIES: Metric = Metric::counter("cellbridge.example.retries")
///     .with_description("Retries issued")
///     .with_unit(Unit::Count)
///     .with_labels(&["step"]);
///
/// assert_eq!(RETRIES.kind, MetricKind::Counter);
/// ```
#[derive(Debug, Clone)]
pub struct Metric {
    /// Metric name as passed to the `metrics` macros.
    pub name: &'static str,
    /// Counter, gauge or histogram.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// Unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Label keys the emitting code attaches.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declare a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Declare a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Declare a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Attach a description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Attach a unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Attach the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Register the description (and unit) with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }

    /// Unit as a short string, empty when unset.
    pub fn unit_str(&self) -> &'static str {
        match self.unit {
            Some(Unit::Count) => "count",
            Some(Unit::Bytes) => "bytes",
            Some(Unit::Milliseconds) => "milliseconds",
            Some(Unit::Seconds) => "seconds",
            Some(_) => "other",
            None => "",
        }
    }
}

/// All metrics emitted by the stack.
pub mod metric_defs {
    use super::Metric;
    use metrics::Unit;

    // ========================================================================
    // Frame bridge
    // ========================================================================

    /// Complete telemetry frames published to the uplink.
    pub const FRAMES_FORWARDED: Metric = Metric::counter("cellbridge.bridge.frames_forwarded")
        .with_description("Telemetry frames published to the broker")
        .with_unit(Unit::Count);

    /// Size of each forwarded frame.
    pub const FRAME_SIZE: Metric = Metric::histogram("cellbridge.bridge.frame_size")
        .with_description("Raw size of forwarded telemetry frames")
        .with_unit(Unit::Bytes);

    /// Bytes dropped while searching for a frame start.
    pub const RESYNC_BYTES: Metric = Metric::counter("cellbridge.bridge.resync_bytes")
        .with_description("Bytes discarded while resynchronising on the frame magic")
        .with_unit(Unit::Bytes);

    /// Partial frames discarded after the inter-byte timeout.
    pub const FRAME_TIMEOUTS: Metric = Metric::counter("cellbridge.bridge.frame_timeouts")
        .with_description("Partial frames discarded after going stale")
        .with_unit(Unit::Count);

    /// Frames the uplink refused.
    pub const PUBLISH_FAILURES: Metric = Metric::counter("cellbridge.bridge.publish_failures")
        .with_description("Frames that could not be published")
        .with_unit(Unit::Count);

    /// Decoded downlink bytes written to the telemetry port.
    pub const INBOUND_BYTES: Metric = Metric::counter("cellbridge.bridge.inbound_bytes")
        .with_description("Downlink bytes written to the telemetry UART")
        .with_unit(Unit::Bytes);

    /// Downlink messages that produced no UART write.
    pub const INBOUND_DROPPED: Metric = Metric::counter("cellbridge.bridge.inbound_dropped")
        .with_description("Downlink messages dropped before reaching the telemetry UART")
        .with_unit(Unit::Count)
        .with_labels(&["reason"]);

    // ========================================================================
    // Modem session
    // ========================================================================

    /// Bring-up attempts that stopped at a numbered step.
    pub const BRINGUP_FAILURES: Metric = Metric::counter("cellbridge.session.bringup_failures")
        .with_description("Session bring-up failures by step")
        .with_unit(Unit::Count)
        .with_labels(&["step"]);

    /// Time spent in a successful bring-up.
    pub const BRINGUP_TIME: Metric = Metric::histogram("cellbridge.session.bringup_time_ms")
        .with_description("Duration of successful session bring-ups")
        .with_unit(Unit::Milliseconds);

    /// Broker connections lost after being established.
    pub const CONNECTION_LOSSES: Metric = Metric::counter("cellbridge.session.connection_losses")
        .with_description("Broker connections reported lost by the modem")
        .with_unit(Unit::Count);

    /// Last reported received signal strength.
    pub const SIGNAL_RSSI: Metric = Metric::gauge("cellbridge.session.signal_rssi_dbm")
        .with_description("Received signal strength reported by the modem in dBm");

    // ========================================================================
    // Publish/subscribe
    // ========================================================================

    /// Messages accepted by the broker.
    pub const MESSAGES_PUBLISHED: Metric = Metric::counter("cellbridge.pubsub.published")
        .with_description("Messages published through the modem")
        .with_unit(Unit::Count)
        .with_labels(&["qos"]);

    /// Inbound messages parsed from modem notifications.
    pub const MESSAGES_RECEIVED: Metric = Metric::counter("cellbridge.pubsub.received")
        .with_description("Inbound messages parsed from modem notifications")
        .with_unit(Unit::Count);

    /// Inbound messages evicted because the queue was full.
    pub const INBOUND_OVERFLOW: Metric = Metric::counter("cellbridge.pubsub.inbound_overflow")
        .with_description("Inbound messages dropped because the queue was full")
        .with_unit(Unit::Count);

    /// Every declared metric.
    pub const ALL: &[&Metric] = &[
        &FRAMES_FORWARDED,
        &FRAME_SIZE,
        &RESYNC_BYTES,
        &FRAME_TIMEOUTS,
        &PUBLISH_FAILURES,
        &INBOUND_BYTES,
        &INBOUND_DROPPED,
        &BRINGUP_FAILURES,
        &BRINGUP_TIME,
        &CONNECTION_LOSSES,
        &SIGNAL_RSSI,
        &MESSAGES_PUBLISHED,
        &MESSAGES_RECEIVED,
        &INBOUND_OVERFLOW,
    ];
}

/// Register descriptions for every metric in [`metric_defs::ALL`].
///
/// Call once after installing a recorder.
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metric_builders() {
        const TEST: Metric = Metric::histogram("test.latency")
            .with_description("latency")
            .with_unit(Unit::Milliseconds)
            .with_labels(&["step"]);

        assert_eq!(TEST.name, "test.latency");
        assert_eq!(TEST.kind, MetricKind::Histogram);
        assert_eq!(TEST.description, "latency");
        assert_eq!(TEST.unit_str(), "milliseconds");
        assert_eq!(TEST.labels, &["step"]);
    }

    #[test]
    fn test_minimal_metric() {
        const MINIMAL: Metric = Metric::gauge("minimal");
        assert_eq!(MINIMAL.kind, MetricKind::Gauge);
        assert_eq!(MINIMAL.description, "");
        assert_eq!(MINIMAL.unit, None);
        assert_eq!(MINIMAL.unit_str(), "");
        assert!(MINIMAL.labels.is_empty());
    }

    #[test]
    fn test_metric_names_unique_and_prefixed() {
        let mut names: Vec<&str> = metric_defs::ALL.iter().map(|m| m.name).collect();
        assert!(names.iter().all(|n| n.starts_with("cellbridge.")));
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), metric_defs::ALL.len());
    }

    #[test]
    fn test_labelled_metrics() {
        assert_eq!(metric_defs::BRINGUP_FAILURES.labels, &["step"]);
        assert_eq!(metric_defs::INBOUND_DROPPED.labels, &["reason"]);
        assert_eq!(metric_defs::SIGNAL_RSSI.kind, MetricKind::Gauge);
        assert_eq!(MetricKind::Counter.to_string(), "counter");
    }

    #[test]
    fn test_describe_without_recorder() {
        // No recorder installed: describing is a no-op.
        describe_metrics();
    }
}
