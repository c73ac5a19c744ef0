//! Deployment reconciliation.
//!
//! Points a deployment's primary container at a target image using a
//! read-modify-write cycle. A write that loses a race to a concurrent writer
//! is retried against a fresh read, up to a small fixed budget.

use std::sync::Arc;
use std::time::Duration;

use rand::RngExt;
use tracing::{debug, info, warn};

use crate::error::ReconcileError;
use crate::metrics::MetricsCollector;

use super::orchestrator::Orchestrator;

/// Retry policy for conflicting writes.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total write attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_backoff: Duration,
    /// Growth factor between retries.
    pub backoff_multiplier: f64,
    /// Upper bound on any single delay.
    pub max_backoff: Duration,
    /// Random jitter as a fraction of the delay (0.1 = ±10%).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            backoff_multiplier: 1.0,
            max_backoff: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            jitter: 0.0,
            ..Default::default()
        }
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let base_ms = self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.max_backoff.as_millis() as f64);

        let factor = if self.jitter > 0.0 {
            1.0 + rand::rng().random_range(-self.jitter..=self.jitter)
        } else {
            1.0
        };

        Duration::from_millis((capped_ms * factor).max(0.0).round() as u64)
    }
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The image was written; `attempts` counts write attempts made.
    Updated { attempts: u32 },
    /// The deployment already ran the target image; nothing was written.
    Unchanged,
}

impl ReconcileOutcome {
    /// Metric label for this outcome.
    pub fn label(&self) -> &'static str {
        match self {
            ReconcileOutcome::Updated { .. } => "updated",
            ReconcileOutcome::Unchanged => "unchanged",
        }
    }
}

/// Moves deployments to new images with conflict retries.
pub struct DeploymentReconciler {
    orchestrator: Arc<dyn Orchestrator>,
    retry: RetryPolicy,
    metrics: MetricsCollector,
}

impl DeploymentReconciler {
    /// Create a reconciler.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, retry: RetryPolicy) -> Self {
        Self {
            orchestrator,
            retry,
            metrics: MetricsCollector::new(),
        }
    }

    /// Makes `deployment` run `image` in its primary container.
    ///
    /// Each attempt re-reads the deployment, so every write is based on the
    /// latest stored version. Only the primary container image changes.
    ///
    /// # Errors
    ///
    /// - `ReconcileError::Read` if a read fails; reads are not retried
    /// - `ReconcileError::NoContainers` if the pod template is empty
    /// - `ReconcileError::RetriesExhausted` if every attempt hit a conflict
    /// - `ReconcileError::Write` for any other write failure
    pub async fn reconcile(
        &self,
        deployment: &str,
        image: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let result = self.reconcile_inner(deployment, image).await;

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "failed",
        };
        self.metrics.record_reconcile(deployment, label);

        result
    }

    async fn reconcile_inner(
        &self,
        deployment: &str,
        image: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let mut state = self
                .orchestrator
                .get_deployment(deployment)
                .await
                .map_err(ReconcileError::Read)?;

            match state.primary_image() {
                None => return Err(ReconcileError::NoContainers(deployment.to_string())),
                Some(current) if current == image => {
                    debug!(deployment, image, "Deployment already up to date");
                    return Ok(ReconcileOutcome::Unchanged);
                }
                Some(_) => {}
            }

            if !state.set_primary_image(image) {
                return Err(ReconcileError::NoContainers(deployment.to_string()));
            }

            match self.orchestrator.replace_deployment(&state).await {
                Ok(_) => {
                    info!(deployment, image, attempts = attempt, "Updated deployment");
                    return Ok(ReconcileOutcome::Updated { attempts: attempt });
                }
                Err(e) if e.is_conflict() => {
                    self.metrics.record_conflict();

                    if attempt >= self.retry.max_attempts {
                        warn!(deployment, attempts = attempt, "Giving up after conflicts");
                        return Err(ReconcileError::RetriesExhausted {
                            attempts: attempt,
                            last: e,
                        });
                    }

                    let delay = self.retry.delay_for(attempt);
                    debug!(
                        deployment,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Write conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(ReconcileError::Write(e)),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::deploy::orchestrator::WorkloadState;
    use crate::error::OrchestratorError;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory orchestrator with resource-version checks.
    #[derive(Default)]
    pub(crate) struct MockOrchestrator {
        deployments: Mutex<HashMap<String, (String, u64)>>,
        /// Number of upcoming writes to reject with a conflict.
        forced_conflicts: Mutex<u32>,
        writes: Mutex<Vec<(String, String)>>,
        reads: Mutex<u32>,
        fail_reads: bool,
    }

    impl MockOrchestrator {
        pub(crate) fn with_deployment(self, name: &str, image: &str) -> Self {
            self.deployments
                .lock()
                .expect("lock poisoned")
                .insert(name.to_string(), (image.to_string(), 1));
            self
        }

        pub(crate) fn with_conflicts(self, conflicts: u32) -> Self {
            *self.forced_conflicts.lock().expect("lock poisoned") = conflicts;
            self
        }

        pub(crate) fn failing_reads() -> Self {
            Self {
                fail_reads: true,
                ..Default::default()
            }
        }

        pub(crate) fn image(&self, name: &str) -> Option<String> {
            self.deployments
                .lock()
                .expect("lock poisoned")
                .get(name)
                .map(|(image, _)| image.clone())
        }

        pub(crate) fn writes(&self) -> Vec<(String, String)> {
            self.writes.lock().expect("lock poisoned").clone()
        }

        pub(crate) fn version(&self, name: &str) -> Option<u64> {
            self.deployments
                .lock()
                .expect("lock poisoned")
                .get(name)
                .map(|(_, version)| *version)
        }

        pub(crate) fn reads(&self) -> u32 {
            *self.reads.lock().expect("lock poisoned")
        }

        fn manifest(name: &str, image: Option<&str>, version: u64) -> Value {
            let containers = match image {
                Some(image) => json!([{ "name": name, "image": image }]),
                None => json!([]),
            };
            json!({
                "metadata": { "name": name, "resourceVersion": version.to_string() },
                "spec": { "template": { "spec": { "containers": containers } } }
            })
        }
    }

    #[async_trait]
    impl Orchestrator for MockOrchestrator {
        async fn get_deployment(&self, name: &str) -> Result<WorkloadState, OrchestratorError> {
            *self.reads.lock().expect("lock poisoned") += 1;
            if self.fail_reads {
                return Err(OrchestratorError::Http("connection refused".to_string()));
            }

            let deployments = self.deployments.lock().expect("lock poisoned");
            let (image, version) = deployments
                .get(name)
                .ok_or_else(|| OrchestratorError::NotFound(name.to_string()))?;
            let image = (!image.is_empty()).then_some(image.as_str());
            WorkloadState::from_manifest(Self::manifest(name, image, *version))
        }

        async fn replace_deployment(
            &self,
            state: &WorkloadState,
        ) -> Result<WorkloadState, OrchestratorError> {
            let name = state.name().to_string();
            let image = state.primary_image().unwrap_or_default().to_string();

            let mut deployments = self.deployments.lock().expect("lock poisoned");
            let (stored_image, stored_version) = deployments
                .get_mut(&name)
                .ok_or_else(|| OrchestratorError::NotFound(name.clone()))?;

            let mut conflicts = self.forced_conflicts.lock().expect("lock poisoned");
            if *conflicts > 0 {
                *conflicts -= 1;
                // Someone else wrote in between.
                *stored_version += 1;
            }

            if state.resource_version() != Some(stored_version.to_string().as_str()) {
                return Err(OrchestratorError::Conflict {
                    name,
                    message: "the object has been modified".to_string(),
                });
            }

            *stored_image = image.clone();
            *stored_version += 1;
            self.writes
                .lock()
                .expect("lock poisoned")
                .push((name.clone(), image.clone()));

            WorkloadState::from_manifest(Self::manifest(&name, Some(&image), *stored_version))
        }
    }

    fn reconciler(orchestrator: Arc<MockOrchestrator>) -> DeploymentReconciler {
        DeploymentReconciler::new(orchestrator, RetryPolicy::immediate(5))
    }

    #[tokio::test]
    async fn test_updates_image() {
        let orchestrator = Arc::new(MockOrchestrator::default().with_deployment("etu", "etu:old"));

        let outcome = reconciler(orchestrator.clone())
            .reconcile("etu", "etu:new")
            .await
            .expect("reconcile succeeds");

        assert_eq!(outcome, ReconcileOutcome::Updated { attempts: 1 });
        assert_eq!(orchestrator.image("etu").as_deref(), Some("etu:new"));
    }

    #[tokio::test]
    async fn test_same_image_is_not_written() {
        let orchestrator = Arc::new(MockOrchestrator::default().with_deployment("etu", "etu:abc"));

        let outcome = reconciler(orchestrator.clone())
            .reconcile("etu", "etu:abc")
            .await
            .expect("reconcile succeeds");

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(orchestrator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_against_fresh_reads() {
        let orchestrator = Arc::new(
            MockOrchestrator::default()
                .with_deployment("etu", "etu:old")
                .with_conflicts(2),
        );

        let outcome = reconciler(orchestrator.clone())
            .reconcile("etu", "etu:new")
            .await
            .expect("third attempt wins");

        assert_eq!(outcome, ReconcileOutcome::Updated { attempts: 3 });
        assert_eq!(orchestrator.reads(), 3);
        assert_eq!(orchestrator.writes(), vec![("etu".to_string(), "etu:new".to_string())]);
    }

    #[tokio::test]
    async fn test_conflicts_past_budget_fail() {
        let orchestrator = Arc::new(
            MockOrchestrator::default()
                .with_deployment("etu", "etu:old")
                .with_conflicts(5),
        );

        let err = reconciler(orchestrator.clone())
            .reconcile("etu", "etu:new")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::RetriesExhausted { attempts: 5, .. }));
        assert_eq!(orchestrator.image("etu").as_deref(), Some("etu:old"));
        assert!(orchestrator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_read_failure_is_not_retried() {
        let orchestrator = Arc::new(MockOrchestrator::failing_reads());

        let err = reconciler(orchestrator.clone())
            .reconcile("etu", "etu:new")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Read(_)));
        assert_eq!(orchestrator.reads(), 1);
        assert!(err.to_string().starts_with("Failed to get latest version of Deployment"));
    }

    #[tokio::test]
    async fn test_missing_deployment_is_a_read_failure() {
        let orchestrator = Arc::new(MockOrchestrator::default());

        let err = reconciler(orchestrator)
            .reconcile("ghost", "ghost:1")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::Read(OrchestratorError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_deployment_without_containers() {
        let orchestrator = Arc::new(MockOrchestrator::default().with_deployment("empty", ""));

        let err = reconciler(orchestrator.clone())
            .reconcile("empty", "empty:1")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::NoContainers(ref name) if name == "empty"));
        assert!(orchestrator.writes().is_empty());
    }

    /// Orchestrator serving one fixed manifest and counting writes.
    struct FixedManifest {
        manifest: Value,
        writes: Mutex<u32>,
    }

    #[async_trait]
    impl Orchestrator for FixedManifest {
        async fn get_deployment(&self, _name: &str) -> Result<WorkloadState, OrchestratorError> {
            WorkloadState::from_manifest(self.manifest.clone())
        }

        async fn replace_deployment(
            &self,
            state: &WorkloadState,
        ) -> Result<WorkloadState, OrchestratorError> {
            *self.writes.lock().expect("lock poisoned") += 1;
            Ok(state.clone())
        }
    }

    #[tokio::test]
    async fn test_malformed_container_is_never_written() {
        let orchestrator = Arc::new(FixedManifest {
            manifest: json!({
                "metadata": { "name": "odd", "resourceVersion": "7" },
                "spec": { "template": { "spec": { "containers": ["odd:old"] } } }
            }),
            writes: Mutex::new(0),
        });

        let err = DeploymentReconciler::new(orchestrator.clone(), RetryPolicy::immediate(5))
            .reconcile("odd", "odd:new")
            .await
            .unwrap_err();

        assert!(matches!(err, ReconcileError::NoContainers(ref name) if name == "odd"));
        assert_eq!(*orchestrator.writes.lock().expect("lock poisoned"), 0);
    }

    #[tokio::test]
    async fn test_reconciling_twice_writes_once() {
        let orchestrator = Arc::new(
            MockOrchestrator::default()
                .with_deployment("etu", "etu:old")
                .with_conflicts(1),
        );
        let reconciler = reconciler(orchestrator.clone());

        let first = reconciler.reconcile("etu", "etu:abc").await.expect("first run");
        assert_eq!(first, ReconcileOutcome::Updated { attempts: 2 });
        let version = orchestrator.version("etu");

        let second = reconciler.reconcile("etu", "etu:abc").await.expect("second run");
        assert_eq!(second, ReconcileOutcome::Unchanged);

        assert_eq!(orchestrator.writes().len(), 1);
        assert_eq!(orchestrator.version("etu"), version);
        assert_eq!(orchestrator.image("etu").as_deref(), Some("etu:abc"));
    }

    #[test]
    fn test_default_retry_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff, Duration::from_millis(10));

        for retry in 1..=4 {
            let delay = policy.delay_for(retry);
            assert!(delay >= Duration::from_millis(9), "{delay:?}");
            assert!(delay <= Duration::from_millis(11), "{delay:?}");
        }
    }

    #[test]
    fn test_growing_backoff_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            jitter: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
    }
}
