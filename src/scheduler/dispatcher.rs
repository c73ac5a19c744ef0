//! Job dispatcher.
//!
//! Resolves a job name to a [`JobKind`], checks the credentials that job
//! needs, and hands it to a [`JobRunner`] inside a tracing span tagged with
//! the job name.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{info_span, warn, Instrument};

use crate::error::{DispatchError, JobError};
use crate::metrics::MetricsCollector;

use super::job::{CredentialPolicy, Credentials, JobKind};

/// Something that can handle a job by name.
///
/// The consumption loop depends on this seam rather than on the dispatcher
/// directly.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Handles the named job and returns once it has finished.
    async fn handle(&self, job: &str) -> Result<(), DispatchError>;
}

/// Executes the side effects of a job.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs `kind` with the already-checked credentials.
    async fn run(&self, kind: JobKind, credentials: &Credentials) -> Result<(), JobError>;
}

/// Maps job names to actions.
pub struct Dispatcher {
    runner: Arc<dyn JobRunner>,
    credentials: Credentials,
    policy: CredentialPolicy,
    metrics: MetricsCollector,
}

impl Dispatcher {
    /// Creates a dispatcher.
    ///
    /// # Arguments
    ///
    /// * `runner` - Executes each job's side effects
    /// * `credentials` - Credentials read once at startup
    /// * `policy` - Which credentials must be present before a job runs
    pub fn new(
        runner: Arc<dyn JobRunner>,
        credentials: Credentials,
        policy: CredentialPolicy,
    ) -> Self {
        Self {
            runner,
            credentials,
            policy,
            metrics: MetricsCollector::new(),
        }
    }

    /// Dispatches the named job and waits for it to finish.
    ///
    /// # Errors
    ///
    /// - `DispatchError::UnknownJob` if the name is not a known job; nothing runs
    /// - `DispatchError::Config` if a required credential is missing; nothing runs
    /// - `DispatchError::JobFailed` with the job's own error otherwise
    pub async fn dispatch(&self, job: &str) -> Result<(), DispatchError> {
        let kind: JobKind = match job.parse() {
            Ok(kind) => kind,
            Err(e) => {
                self.metrics.record_job("unknown", "rejected", 0.0);
                return Err(e);
            }
        };

        let span = info_span!("job", job = kind.name());
        async move {
            if let Err(e) = self.credentials.check(self.policy.required_for(kind)) {
                warn!(error = %e, "Refusing to run job without credentials");
                self.metrics.record_job(kind.name(), "misconfigured", 0.0);
                return Err(DispatchError::Config(e));
            }

            let start = Instant::now();
            let result = self.runner.run(kind, &self.credentials).await;
            let elapsed = start.elapsed().as_secs_f64();

            let status = if result.is_ok() { "success" } else { "failure" };
            self.metrics.record_job(kind.name(), status, elapsed);

            result.map_err(|source| DispatchError::JobFailed {
                job: kind.name(),
                source,
            })
        }
        .instrument(span)
        .await
    }

    /// Returns the credential policy in force.
    pub fn policy(&self) -> CredentialPolicy {
        self.policy
    }
}

#[async_trait]
impl JobHandler for Dispatcher {
    async fn handle(&self, job: &str) -> Result<(), DispatchError> {
        self.dispatch(job).await
    }
}
