//! High-level metric recording.
//!
//! `MetricsCollector` wraps the raw Prometheus statics so call sites never
//! touch labels or `OnceLock`s directly. Every method is a no-op until
//! `init_metrics()` has run, which keeps unit tests free of global setup.

use super::prometheus::{
    ACK_FAILURES, DEPLOYMENTS_RECONCILED, DEPLOYMENT_CONFLICTS, JOBS_TOTAL, JOB_DURATION,
    MESSAGES_ACKNOWLEDGED, MESSAGES_RECEIVED, MESSAGES_UNDECODABLE, RECEIVE_ERRORS,
};

/// Metrics collector for recording cron-runner operational metrics.
///
/// # Example
///
/// ```ignore
/// use cron_runner::metrics::{init_metrics, MetricsCollector};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_message_received();
/// collector.record_job("spider", "success", 4.2);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a message handed over by the broker.
    pub fn record_message_received(&self) {
        if let Some(counter) = MESSAGES_RECEIVED.get() {
            counter.inc();
        }
    }

    /// Record a successful acknowledge.
    pub fn record_message_acknowledged(&self) {
        if let Some(counter) = MESSAGES_ACKNOWLEDGED.get() {
            counter.inc();
        }
    }

    /// Record a payload that could not be decoded.
    pub fn record_undecodable_message(&self) {
        if let Some(counter) = MESSAGES_UNDECODABLE.get() {
            counter.inc();
        }
    }

    /// Record a failed acknowledge call.
    pub fn record_ack_failure(&self) {
        if let Some(counter) = ACK_FAILURES.get() {
            counter.inc();
        }
    }

    /// Record a failed receive call.
    pub fn record_receive_error(&self) {
        if let Some(counter) = RECEIVE_ERRORS.get() {
            counter.inc();
        }
    }

    /// Record a dispatched job.
    ///
    /// # Arguments
    ///
    /// * `job` - Job name, or "unknown" for unrecognized names
    /// * `status` - One of "success", "failure", "misconfigured", "rejected"
    /// * `duration_secs` - Time spent running the job
    pub fn record_job(&self, job: &str, status: &str, duration_secs: f64) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[job, status]).inc();
        }

        if let Some(job_duration) = JOB_DURATION.get() {
            job_duration.with_label_values(&[job]).observe(duration_secs);
        }

        tracing::trace!(
            job = job,
            status = status,
            duration_secs = duration_secs,
            "Recorded job metric"
        );
    }

    /// Record the outcome of reconciling one deployment.
    ///
    /// # Arguments
    ///
    /// * `deployment` - Deployment name
    /// * `outcome` - One of "updated", "unchanged", "failed"
    pub fn record_reconcile(&self, deployment: &str, outcome: &str) {
        if let Some(reconciled) = DEPLOYMENTS_RECONCILED.get() {
            reconciled.with_label_values(&[deployment, outcome]).inc();
        }

        tracing::trace!(
            deployment = deployment,
            outcome = outcome,
            "Recorded reconcile metric"
        );
    }

    /// Record a write conflict.
    pub fn record_conflict(&self) {
        if let Some(conflicts) = DEPLOYMENT_CONFLICTS.get() {
            conflicts.inc();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{export_metrics, init_metrics};

    #[test]
    fn test_metrics_collector_new() {
        let collector = MetricsCollector::new();
        assert!(std::mem::size_of_val(&collector) == 0);
    }

    #[test]
    fn test_record_job_shows_up_in_export() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_job("pinboard", "success", 1.5);
        collector.record_job("unknown", "rejected", 0.0);

        let metrics = export_metrics();
        assert!(metrics.contains("cron_jobs_total"));
        assert!(metrics.contains("job=\"pinboard\""));
        assert!(metrics.contains("cron_job_duration_seconds"));
    }

    #[test]
    fn test_record_broker_and_deployment_metrics() {
        let _ = init_metrics();
        let collector = MetricsCollector::new();

        collector.record_message_received();
        collector.record_message_acknowledged();
        collector.record_undecodable_message();
        collector.record_ack_failure();
        collector.record_receive_error();
        collector.record_reconcile("etu", "updated");
        collector.record_conflict();

        let metrics = export_metrics();
        assert!(metrics.contains("cron_deployments_reconciled_total"));
        assert!(metrics.contains("deployment=\"etu\""));
        assert!(metrics.contains("cron_deployment_conflicts_total"));
    }
}
