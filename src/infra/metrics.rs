//! Prometheus metrics for the ledger

use prometheus::{
    CounterVec, Encoder, IntGaugeVec, TextEncoder, register_counter_vec, register_int_gauge_vec,
};
use std::sync::OnceLock;

use crate::domain::AppError;

static METRICS: OnceLock<Metrics> = OnceLock::new();

pub struct Metrics {
    /// Breaker state (0 = closed, 1 = half-open, 2 = open)
    pub breaker_state: IntGaugeVec,

    /// Breaker transitions (by breaker, from, to)
    pub breaker_transitions: CounterVec,

    /// Calls through a breaker (by breaker, outcome)
    pub breaker_requests: CounterVec,

    /// Events dispatched on the bus (by event type, mode)
    pub events_published: CounterVec,

    /// Handler failures (by event type)
    pub handler_failures: CounterVec,

    /// Outbox relay attempts (by outcome)
    pub outbox_relayed: CounterVec,

    /// Finished transactions (by kind, status)
    pub transactions: CounterVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    pub fn init() -> Result<&'static Metrics, AppError> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            breaker_state: register_int_gauge_vec!(
                "ledger_breaker_state",
                "Circuit breaker state (0 = closed, 1 = half-open, 2 = open)",
                &["breaker"]
            )
            .map_err(|e| AppError::Internal(format!("breaker_state: {e}")))?,

            breaker_transitions: register_counter_vec!(
                "ledger_breaker_transitions_total",
                "Circuit breaker state transitions",
                &["breaker", "from", "to"]
            )
            .map_err(|e| AppError::Internal(format!("breaker_transitions: {e}")))?,

            breaker_requests: register_counter_vec!(
                "ledger_breaker_requests_total",
                "Calls through a circuit breaker",
                &["breaker", "outcome"]
            )
            .map_err(|e| AppError::Internal(format!("breaker_requests: {e}")))?,

            events_published: register_counter_vec!(
                "ledger_events_published_total",
                "Domain events dispatched on the event bus",
                &["event_type", "mode"]
            )
            .map_err(|e| AppError::Internal(format!("events_published: {e}")))?,

            handler_failures: register_counter_vec!(
                "ledger_event_handler_failures_total",
                "Event handler failures",
                &["event_type"]
            )
            .map_err(|e| AppError::Internal(format!("handler_failures: {e}")))?,

            outbox_relayed: register_counter_vec!(
                "ledger_outbox_relayed_total",
                "Outbox relay attempts",
                &["outcome"]
            )
            .map_err(|e| AppError::Internal(format!("outbox_relayed: {e}")))?,

            transactions: register_counter_vec!(
                "ledger_transactions_total",
                "Finished ledger transactions",
                &["kind", "status"]
            )
            .map_err(|e| AppError::Internal(format!("transactions: {e}")))?,
        };

        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| AppError::Internal("Failed to initialize metrics".to_string()))
    }

    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }
}

/// Encode every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

pub fn try_set_breaker_state(breaker: &str, value: i64) {
    if let Some(m) = Metrics::get() {
        m.breaker_state.with_label_values(&[breaker]).set(value);
    }
}

pub fn try_record_breaker_transition(breaker: &str, from: &str, to: &str) {
    if let Some(m) = Metrics::get() {
        m.breaker_transitions
            .with_label_values(&[breaker, from, to])
            .inc();
    }
}

pub fn try_record_breaker_request(breaker: &str, outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.breaker_requests
            .with_label_values(&[breaker, outcome])
            .inc();
    }
}

pub fn try_record_published(event_type: &str, mode: &str) {
    if let Some(m) = Metrics::get() {
        m.events_published
            .with_label_values(&[event_type, mode])
            .inc();
    }
}

pub fn try_record_handler_failures(event_type: &str, count: usize) {
    if let Some(m) = Metrics::get() {
        m.handler_failures
            .with_label_values(&[event_type])
            .inc_by(count as f64);
    }
}

pub fn try_record_outbox(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.outbox_relayed.with_label_values(&[outcome]).inc();
    }
}

pub fn try_record_transaction(kind: &str, status: &str) {
    if let Some(m) = Metrics::get() {
        m.transactions.with_label_values(&[kind, status]).inc();
    }
}
