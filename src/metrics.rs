//! Observability hooks for the consumer.
//!
//! The consumer never touches process-wide state; every count and timing is
//! reported through the [`MetricsSink`] handed to the worker.

use std::collections::HashMap;

use parking_lot::Mutex;
use prometheus::{Counter, Encoder, Gauge, Opts, Registry, TextEncoder};

use crate::errors::{ConsumerError, GenericError};

/// Messages returned by receive calls.
pub const RECEIVED_TOTAL: &str = "received_total";
/// Failed receive calls.
pub const RECEIVE_ERROR_TOTAL: &str = "receive_error_total";
/// Messages whose handler returned with the lease handled.
pub const JOB_PROCESSED_TOTAL: &str = "job_processed_total";
/// Handler panics.
pub const JOB_PANIC_TOTAL: &str = "job_panic_total";
/// Handler errors, panics and messages left unhandled.
pub const JOB_ERROR_TOTAL: &str = "job_error_total";

/// Seconds spent in a receive call.
pub const SQS_RECEIVE_TIMER: &str = "sqs_receive_timer";
/// Seconds spent in a delete or change-visibility call.
pub const SQS_JOB_TIMER: &str = "sqs_job_timer";
/// Seconds spent inside the handler.
pub const JOB_HANDLER_TIMER: &str = "job_handler_timer";

const COUNTERS: [(&str, &str); 5] = [
    (RECEIVED_TOTAL, "Number of messages received from SQS."),
    (RECEIVE_ERROR_TOTAL, "Number of errors when receiving messages from SQS."),
    (JOB_PROCESSED_TOTAL, "Number of messages successfully processed."),
    (JOB_PANIC_TOTAL, "Number of panics when calling the message handler."),
    (JOB_ERROR_TOTAL, "Number of errors when calling the message handler."),
];

const GAUGES: [(&str, &str); 3] = [
    (SQS_RECEIVE_TIMER, "Time taken by the last SQS receive message request."),
    (SQS_JOB_TIMER, "Time taken by the last SQS update to a message."),
    (JOB_HANDLER_TIMER, "Time taken by the last message handler call."),
];

/// Receives counts and timings from the consumer.
pub trait MetricsSink: Send + Sync {
    fn increment(&self, name: &str) {
        self.increment_by(name, 1);
    }

    fn increment_by(&self, name: &str, value: u64);

    fn observe(&self, name: &str, value: f64);
}

/// Discards everything. Used when no sink is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_by(&self, _name: &str, _value: u64) {}

    fn observe(&self, _name: &str, _value: f64) {}
}

/// Keeps counters and the last observed value of each timer in memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<HashMap<String, u64>>,
    observations: Mutex<HashMap<String, f64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn last_observation(&self, name: &str) -> Option<f64> {
        self.observations.lock().get(name).copied()
    }
}

impl MetricsSink for InMemoryMetrics {
    fn increment_by(&self, name: &str, value: u64) {
        *self.counters.lock().entry(name.to_string()).or_insert(0) += value;
    }

    fn observe(&self, name: &str, value: f64) {
        self.observations.lock().insert(name.to_string(), value);
    }
}

/// Exposes the consumer metrics through a Prometheus registry.
///
/// Counters become `<namespace>_<name>` counters and timers become gauges
/// holding the most recent value.
pub struct PrometheusMetrics {
    registry: Registry,
    counters: HashMap<&'static str, Counter>,
    gauges: HashMap<&'static str, Gauge>,
}

impl PrometheusMetrics {
    /// Registers the consumer metrics into a fresh registry.
    pub fn new(namespace: &str) -> Result<Self, ConsumerError> {
        Self::with_registry(namespace, Registry::new())
    }

    /// Registers the consumer metrics into an existing registry.
    pub fn with_registry(namespace: &str, registry: Registry) -> Result<Self, ConsumerError> {
        let mut counters = HashMap::new();
        for (name, help) in COUNTERS {
            let counter = Counter::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(prometheus_error)?;
            registry
                .register(Box::new(counter.clone()))
                .map_err(prometheus_error)?;
            counters.insert(name, counter);
        }

        let mut gauges = HashMap::new();
        for (name, help) in GAUGES {
            let gauge = Gauge::with_opts(Opts::new(name, help).namespace(namespace))
                .map_err(prometheus_error)?;
            registry
                .register(Box::new(gauge.clone()))
                .map_err(prometheus_error)?;
            gauges.insert(name, gauge);
        }

        Ok(PrometheusMetrics {
            registry,
            counters,
            gauges,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Renders every registered metric in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, ConsumerError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(prometheus_error)?;
        String::from_utf8(buffer).map_err(|e| GenericError::new(e.to_string()).into())
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment_by(&self, name: &str, value: u64) {
        if let Some(counter) = self.counters.get(name) {
            counter.inc_by(value as f64);
        }
    }

    fn observe(&self, name: &str, value: f64) {
        if let Some(gauge) = self.gauges.get(name) {
            gauge.set(value);
        }
    }
}

fn prometheus_error(err: prometheus::Error) -> ConsumerError {
    GenericError::new(format!("prometheus: {err}")).into()
}
