//! Prometheus metrics registration and export.
//!
//! Defines every metric the runner exposes and provides functions for
//! initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, HistogramOpts, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;

/// Global Prometheus registry for all cron-runner metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Messages handed to the consumer by the broker, redeliveries included.
pub static MESSAGES_RECEIVED: OnceLock<Counter> = OnceLock::new();

/// Messages acknowledged after dispatch.
pub static MESSAGES_ACKNOWLEDGED: OnceLock<Counter> = OnceLock::new();

/// Messages whose payload could not be decoded.
pub static MESSAGES_UNDECODABLE: OnceLock<Counter> = OnceLock::new();

/// Acknowledge calls that failed.
pub static ACK_FAILURES: OnceLock<Counter> = OnceLock::new();

/// Receive calls that failed.
pub static RECEIVE_ERRORS: OnceLock<Counter> = OnceLock::new();

/// Jobs dispatched, labeled by job name and status.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Job duration in seconds, labeled by job name.
pub static JOB_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Deployment reconciliations, labeled by deployment and outcome.
pub static DEPLOYMENTS_RECONCILED: OnceLock<CounterVec> = OnceLock::new();

/// Write conflicts hit while reconciling deployments.
pub static DEPLOYMENT_CONFLICTS: OnceLock<Counter> = OnceLock::new();

/// Initialize all metrics and register them with the registry.
///
/// Call once at startup. Later calls build a fresh registry but leave the
/// first set of metrics in place.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let registry = Registry::new();

    // Broker metrics
    let messages_received = Counter::new(
        "cron_messages_received_total",
        "Messages received from the subscription",
    )?;

    let messages_acknowledged = Counter::new(
        "cron_messages_acknowledged_total",
        "Messages acknowledged after dispatch",
    )?;

    let messages_undecodable = Counter::new(
        "cron_messages_undecodable_total",
        "Messages left unacknowledged because their payload could not be decoded",
    )?;

    let ack_failures = Counter::new("cron_ack_failures_total", "Failed acknowledge calls")?;

    let receive_errors = Counter::new(
        "cron_broker_receive_errors_total",
        "Failed receive calls against the broker",
    )?;

    // Job metrics
    let jobs_total = CounterVec::new(
        Opts::new("cron_jobs_total", "Jobs dispatched"),
        &["job", "status"],
    )?;

    let job_duration = HistogramVec::new(
        HistogramOpts::new("cron_job_duration_seconds", "Job duration in seconds")
            .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0]),
        &["job"],
    )?;

    // Deployment metrics
    let deployments_reconciled = CounterVec::new(
        Opts::new(
            "cron_deployments_reconciled_total",
            "Deployment reconciliations by outcome",
        ),
        &["deployment", "outcome"],
    )?;

    let deployment_conflicts = Counter::new(
        "cron_deployment_conflicts_total",
        "Write conflicts while updating deployments",
    )?;

    registry.register(Box::new(messages_received.clone()))?;
    registry.register(Box::new(messages_acknowledged.clone()))?;
    registry.register(Box::new(messages_undecodable.clone()))?;
    registry.register(Box::new(ack_failures.clone()))?;
    registry.register(Box::new(receive_errors.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(job_duration.clone()))?;
    registry.register(Box::new(deployments_reconciled.clone()))?;
    registry.register(Box::new(deployment_conflicts.clone()))?;

    // If any of these fail, metrics were already initialized
    let _ = REGISTRY.set(registry);
    let _ = MESSAGES_RECEIVED.set(messages_received);
    let _ = MESSAGES_ACKNOWLEDGED.set(messages_acknowledged);
    let _ = MESSAGES_UNDECODABLE.set(messages_undecodable);
    let _ = ACK_FAILURES.set(ack_failures);
    let _ = RECEIVE_ERRORS.set(receive_errors);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = JOB_DURATION.set(job_duration);
    let _ = DEPLOYMENTS_RECONCILED.set(deployments_reconciled);
    let _ = DEPLOYMENT_CONFLICTS.set(deployment_conflicts);

    tracing::info!("Prometheus metrics initialized");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead of metrics when the registry has not been
/// initialized or encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

/// HTTP handler for the /metrics endpoint.
pub async fn metrics_handler() -> String {
    export_metrics()
}
