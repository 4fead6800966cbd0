//! Prometheus metrics for the export agent
//!
//! Counters are process-wide. Service mode logs a snapshot after every cycle.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, register_int_gauge,
    CounterVec, Encoder, HistogramVec, IntCounter, IntGauge, TextEncoder,
};

lazy_static! {
    /// Counter: sessions by command and status
    pub static ref SESSIONS: CounterVec = register_counter_vec!(
        "export_agent_sessions_total",
        "Export sessions by command and status",
        &["command", "status"]
    )
    .expect("Failed to create sessions metric");

    /// Histogram: integration run duration (seconds)
    pub static ref INTEGRATION_DURATION: HistogramVec = register_histogram_vec!(
        "export_agent_integration_duration_seconds",
        "Duration of one integration run inside a session",
        &["integration", "status"],
        vec![0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    )
    .expect("Failed to create integration_duration metric");

    /// Counter: recovered integration panics
    pub static ref INTEGRATION_PANICS: CounterVec = register_counter_vec!(
        "export_agent_integration_panics_total",
        "Panics recovered at the plugin host boundary",
        &["integration"]
    )
    .expect("Failed to create integration_panics metric");

    /// Counter: records delivered to the sink
    pub static ref RECORDS_DELIVERED: CounterVec = register_counter_vec!(
        "export_agent_records_delivered_total",
        "Records delivered by integration and object type",
        &["integration", "object_type"]
    )
    .expect("Failed to create records_delivered metric");

    /// Counter: checkpoint commits
    pub static ref CHECKPOINT_COMMITS: CounterVec = register_counter_vec!(
        "export_agent_checkpoint_commits_total",
        "Checkpoint commits by integration and object type",
        &["integration", "object_type"]
    )
    .expect("Failed to create checkpoint_commits metric");

    /// Counter: supervisor restarts of the child process
    pub static ref SUPERVISOR_RESTARTS: IntCounter = register_int_counter!(
        "export_agent_supervisor_restarts_total",
        "Child restarts performed by the process supervisor"
    )
    .expect("Failed to create supervisor_restarts metric");

    /// Gauge: open plugin handles
    pub static ref OPEN_HANDLES: IntGauge = register_int_gauge!(
        "export_agent_open_plugin_handles",
        "Plugin handles currently open"
    )
    .expect("Failed to create open_plugin_handles metric");
}

pub fn record_session(command: &str, status: &str) {
    SESSIONS.with_label_values(&[command, status]).inc();
}

/// Record how long one integration took inside a session
pub fn record_integration_run(integration: &str, status: &str, duration_secs: f64) {
    INTEGRATION_DURATION
        .with_label_values(&[integration, status])
        .observe(duration_secs);
}

pub fn record_panic(integration: &str) {
    INTEGRATION_PANICS.with_label_values(&[integration]).inc();
}

pub fn record_delivered(integration: &str, object_type: &str, count: usize) {
    RECORDS_DELIVERED
        .with_label_values(&[integration, object_type])
        .inc_by(count as f64);
}

pub fn record_checkpoint_commit(integration: &str, object_type: &str) {
    CHECKPOINT_COMMITS
        .with_label_values(&[integration, object_type])
        .inc();
}

pub fn record_restart() {
    SUPERVISOR_RESTARTS.inc();
}

pub fn handle_opened() {
    OPEN_HANDLES.inc();
}

pub fn handle_closed() {
    OPEN_HANDLES.dec();
}

/// Encode all metrics as Prometheus text format
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        record_session("export", "success");
        record_integration_run("jira@work", "success", 1.5);
        record_panic("jira@work");
        record_delivered("jira@work", "work.issue", 10);
        record_checkpoint_commit("jira@work", "work.issue");
        record_restart();
        handle_opened();
        handle_closed();

        let output = encode_metrics();
        assert!(output.contains("export_agent_sessions_total"));
        assert!(output.contains("export_agent_records_delivered_total"));
        assert!(output.contains("export_agent_supervisor_restarts_total"));
    }
}
