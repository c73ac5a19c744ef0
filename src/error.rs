//! Error types for cron-runner operations.
//!
//! Defines error types for the major subsystems:
//! - Configuration and credential checks
//! - Job dispatch
//! - Source revision lookups
//! - Orchestrator (Kubernetes) access and deployment reconciliation
//! - Workspace update batches
//! - Job integrations (GraphQL sink and third-party APIs)
//!
//! Broker errors live next to the broker adapter in `scheduler::queue`.

use thiserror::Error;

/// Errors raised while validating configuration before a job runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} is unset")]
    MissingCredential(&'static str),

    #[error("{0} is not configured")]
    MissingSetting(&'static str),

    #[error("Invalid value '{value}' for {setting}")]
    InvalidValue { setting: &'static str, value: String },

    #[error("In-cluster configuration unavailable: {0}")]
    InClusterUnavailable(String),
}

/// Errors returned by the job dispatcher.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Unknown job type: {0}")]
    UnknownJob(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Job '{job}' failed: {source}")]
    JobFailed {
        job: &'static str,
        #[source]
        source: JobError,
    },
}

/// Errors from the source revision service.
#[derive(Debug, Error)]
pub enum RevisionError {
    #[error("Rate limited by revision service (reset at {reset:?})")]
    RateLimited {
        /// Epoch seconds at which the quota resets, when advertised.
        reset: Option<u64>,
    },

    #[error("could not get {owner}/{repo}")]
    NotFound { owner: String, repo: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Failed to parse response: {0}")]
    Parse(String),
}

impl RevisionError {
    /// Returns whether this error signals an exhausted rate budget.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, RevisionError::RateLimited { .. })
    }
}

/// Errors from the orchestrator API.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Deployment '{0}' not found")]
    NotFound(String),

    #[error("Conflict writing deployment '{name}': {message}")]
    Conflict { name: String, message: String },

    #[error("Orchestrator API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Malformed deployment manifest: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Returns whether the write lost an optimistic-concurrency race.
    pub fn is_conflict(&self) -> bool {
        matches!(self, OrchestratorError::Conflict { .. })
    }
}

/// Errors from the deployment reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("Failed to get latest version of Deployment: {0}")]
    Read(#[source] OrchestratorError),

    #[error("Deployment '{0}' has no containers")]
    NoContainers(String),

    #[error("Update failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: OrchestratorError,
    },

    #[error("Update failed: {0}")]
    Write(#[source] OrchestratorError),
}

/// Errors that end a workspace update batch.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Revision lookup for {owner}/{repo} failed: {source}")]
    Revision {
        owner: String,
        repo: String,
        #[source]
        source: RevisionError,
    },

    #[error("Reconciling deployment '{deployment}' failed: {source}")]
    Reconcile {
        deployment: String,
        #[source]
        source: ReconcileError,
    },
}

/// Errors raised by the job integrations.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("GraphQL errors: {0}")]
    GraphQl(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] OrchestratorError),

    #[error("Workspace update failed: {0}")]
    Update(#[from] UpdateError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for JobError {
    fn from(err: reqwest::Error) -> Self {
        JobError::Http(err.to_string())
    }
}
