//! Observability infrastructure for the collector agent
//!
//! Provides:
//! - Prometheus metrics (reconciliation latency and outcome, input panics, running inputs)
//! - Structured JSON logging with tracing

use chrono::{DateTime, Utc};
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge_vec,
    Histogram, IntCounter, IntCounterVec, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Histogram buckets for reconciliation passes (in seconds)
const RECONCILE_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<AgentMetricsInner> = OnceLock::new();

struct AgentMetricsInner {
    reconcile_duration_seconds: Histogram,
    reconcile_operations: IntCounterVec,
    reconcile_errors: IntCounter,
    input_panics: IntCounterVec,
    inputs_abandoned: IntCounterVec,
    running_inputs: IntGaugeVec,
}

impl AgentMetricsInner {
    fn new() -> Self {
        Self {
            reconcile_duration_seconds: register_histogram!(
                "collector_agent_reconcile_duration_seconds",
                "Time spent applying a desired input set",
                RECONCILE_BUCKETS.to_vec()
            )
            .expect("Failed to register reconcile_duration_seconds"),

            reconcile_operations: register_int_counter_vec!(
                "collector_agent_reconcile_operations_total",
                "Operations applied by reconciliation, by action",
                &["action"]
            )
            .expect("Failed to register reconcile_operations_total"),

            reconcile_errors: register_int_counter!(
                "collector_agent_reconcile_errors_total",
                "Errors collected during reconciliation passes"
            )
            .expect("Failed to register reconcile_errors_total"),

            input_panics: register_int_counter_vec!(
                "collector_agent_input_panics_total",
                "Panics recovered from collector inputs",
                &["kind"]
            )
            .expect("Failed to register input_panics_total"),

            inputs_abandoned: register_int_counter_vec!(
                "collector_agent_inputs_abandoned_total",
                "Inputs stopped permanently after exceeding the crash ceiling",
                &["kind"]
            )
            .expect("Failed to register inputs_abandoned_total"),

            running_inputs: register_int_gauge_vec!(
                "collector_agent_running_inputs",
                "Input instances held in the registry, by kind",
                &["kind"]
            )
            .expect("Failed to register running_inputs"),
        }
    }
}

/// Agent metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct AgentMetrics {
    _private: (),
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &AgentMetricsInner {
        GLOBAL_METRICS.get_or_init(AgentMetricsInner::new)
    }

    pub fn observe_reconcile_duration(&self, duration_secs: f64) {
        self.inner().reconcile_duration_seconds.observe(duration_secs);
    }

    pub fn inc_operations(&self, action: &str) {
        self.inner()
            .reconcile_operations
            .with_label_values(&[action])
            .inc();
    }

    pub fn inc_reconcile_errors(&self, count: u64) {
        self.inner().reconcile_errors.inc_by(count);
    }

    pub fn inc_input_panics(&self, kind: &str) {
        self.inner().input_panics.with_label_values(&[kind]).inc();
    }

    pub fn inc_inputs_abandoned(&self, kind: &str) {
        self.inner().inputs_abandoned.with_label_values(&[kind]).inc();
    }

    /// Replace the running-input gauges with the given per-kind counts
    pub fn set_running_inputs<'a>(&self, counts: impl IntoIterator<Item = (&'a str, usize)>) {
        let gauge = &self.inner().running_inputs;
        gauge.reset();
        for (kind, count) in counts {
            gauge.with_label_values(&[kind]).set(count as i64);
        }
    }
}

/// Structured logger for agent events
///
/// Provides consistent JSON-formatted logging for reconciliation and
/// supervision events.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            "Collector agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Collector agent shutting down"
        );
    }

    /// Log the outcome of one reconciliation pass
    pub fn log_reconcile(
        &self,
        operations: usize,
        errors: usize,
        elapsed_ms: u128,
        deadline_exceeded: bool,
    ) {
        if errors == 0 {
            info!(
                event = "reconcile_complete",
                node = %self.node_name,
                operations = operations,
                elapsed_ms = elapsed_ms,
                "Reconciliation pass complete"
            );
        } else {
            error!(
                event = "reconcile_complete",
                node = %self.node_name,
                operations = operations,
                errors = errors,
                elapsed_ms = elapsed_ms,
                deadline_exceeded = deadline_exceeded,
                "Reconciliation pass finished with errors"
            );
        }
    }

    pub fn log_input_panic(
        &self,
        kind: &str,
        index: usize,
        crash_count: usize,
        message: &str,
        backtrace: Option<&str>,
    ) {
        warn!(
            event = "input_panicked",
            node = %self.node_name,
            kind = %kind,
            index = index,
            crash_count = crash_count,
            panic = %message,
            backtrace = %backtrace.unwrap_or("unavailable"),
            "Input panicked"
        );
    }

    pub fn log_input_abandoned(
        &self,
        kind: &str,
        index: usize,
        crashes: usize,
        crash_times: &[DateTime<Utc>],
    ) {
        let times: Vec<String> = crash_times.iter().map(|t| t.to_rfc3339()).collect();
        error!(
            event = "input_abandoned",
            node = %self.node_name,
            kind = %kind,
            index = index,
            crashes = crashes,
            crash_times = ?times,
            "Input exceeded the crash ceiling and will not be restarted"
        );
    }
}
