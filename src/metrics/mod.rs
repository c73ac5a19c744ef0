//! Metrics module for Prometheus-based monitoring.
//!
//! Covers the broker (received, acknowledged, undecodable messages), job
//! dispatch, and deployment reconciliation. Exposed over HTTP at `/metrics`.
//!
//! # Example
//!
//! ```ignore
//! use cron_runner::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("minute", "success", 0.001);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics, metrics_handler};

pub use prometheus::{
    ACK_FAILURES, DEPLOYMENTS_RECONCILED, DEPLOYMENT_CONFLICTS, JOBS_TOTAL, JOB_DURATION,
    MESSAGES_ACKNOWLEDGED, MESSAGES_RECEIVED, MESSAGES_UNDECODABLE, RECEIVE_ERRORS, REGISTRY,
};
