//! Workspace updater.
//!
//! Walks the site catalogue in order, resolves each repository's tip commit
//! and reconciles its deployment onto the matching image. A rate-limited
//! revision lookup ends the batch early but successfully; sites before it
//! stay updated and sites after it are left for the next run.

use std::sync::Arc;

use clap::ValueEnum;
use tracing::{error, info, warn};

use crate::error::UpdateError;

use super::image::{ImageReference, DEFAULT_REGISTRY};
use super::reconciler::{DeploymentReconciler, ReconcileOutcome};
use super::revision::RevisionResolver;
use super::site_map::SiteMap;

/// What to do when one site cannot be updated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum FailurePolicy {
    /// Stop the batch and fail the job.
    #[default]
    Abort,
    /// Log the failure and carry on with the next site.
    Skip,
}

/// Configuration for a workspace update batch.
#[derive(Debug, Clone)]
pub struct UpdaterConfig {
    /// Registry prefix of the images.
    pub registry: String,
    /// Handling of per-site failures other than rate limiting.
    pub failure_policy: FailurePolicy,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            registry: DEFAULT_REGISTRY.to_string(),
            failure_policy: FailurePolicy::Abort,
        }
    }
}

/// A site left behind under [`FailurePolicy::Skip`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedSite {
    pub deployment: String,
    pub reason: String,
}

/// Summary of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Deployments whose image was written.
    pub updated: Vec<String>,
    /// Deployments already on the newest image.
    pub unchanged: Vec<String>,
    /// Deployments that failed and were skipped.
    pub skipped: Vec<SkippedSite>,
    /// Deployment whose lookup hit the rate limit, ending the batch.
    pub halted_at: Option<String>,
}

impl UpdateReport {
    /// Number of sites that were looked at, the halting one excluded.
    pub fn processed(&self) -> usize {
        self.updated.len() + self.unchanged.len() + self.skipped.len()
    }
}

/// Brings every catalogued deployment up to its repository's tip commit.
pub struct WorkspaceUpdater {
    site_maps: Vec<SiteMap>,
    resolver: Arc<dyn RevisionResolver>,
    reconciler: DeploymentReconciler,
    config: UpdaterConfig,
}

impl WorkspaceUpdater {
    /// Create an updater over `site_maps`.
    pub fn new(
        site_maps: Vec<SiteMap>,
        resolver: Arc<dyn RevisionResolver>,
        reconciler: DeploymentReconciler,
        config: UpdaterConfig,
    ) -> Self {
        Self {
            site_maps,
            resolver,
            reconciler,
            config,
        }
    }

    /// Get the configured sites.
    pub fn site_maps(&self) -> &[SiteMap] {
        &self.site_maps
    }

    /// Updates every site in catalogue order.
    ///
    /// Sites are processed one at a time; the next lookup starts only after
    /// the previous reconcile finished.
    ///
    /// # Errors
    ///
    /// Under [`FailurePolicy::Abort`], the first revision or reconcile
    /// failure ends the batch with an `UpdateError`. Rate limiting never
    /// produces an error.
    pub async fn update_all(&self) -> Result<UpdateReport, UpdateError> {
        let mut report = UpdateReport::default();

        for site in &self.site_maps {
            let sha = match self.resolver.tip_commit(&site.owner, &site.repo).await {
                Ok(sha) => sha,
                Err(e) if e.is_rate_limited() => {
                    warn!(repo = %site.full_name(), error = %e, "hit rate limit");
                    report.halted_at = Some(site.deployment.clone());
                    break;
                }
                Err(e) => {
                    error!(repo = %site.full_name(), error = %e, "could not get tip commit");
                    let err = UpdateError::Revision {
                        owner: site.owner.clone(),
                        repo: site.repo.clone(),
                        source: e,
                    };
                    self.handle_failure(site, err, &mut report)?;
                    continue;
                }
            };

            let image = ImageReference::for_commit(&self.config.registry, &site.repo, &sha);
            info!(deployment = %site.deployment, image = %image, "Updating deployment");

            match self.reconciler.reconcile(&site.deployment, &image.to_string()).await {
                Ok(ReconcileOutcome::Updated { .. }) => report.updated.push(site.deployment.clone()),
                Ok(ReconcileOutcome::Unchanged) => report.unchanged.push(site.deployment.clone()),
                Err(e) => {
                    error!(deployment = %site.deployment, error = %e, "Update failed");
                    let err = UpdateError::Reconcile {
                        deployment: site.deployment.clone(),
                        source: e,
                    };
                    self.handle_failure(site, err, &mut report)?;
                }
            }
        }

        info!(
            updated = report.updated.len(),
            unchanged = report.unchanged.len(),
            skipped = report.skipped.len(),
            halted = report.halted_at.is_some(),
            "Workspace update finished"
        );

        Ok(report)
    }

    fn handle_failure(
        &self,
        site: &SiteMap,
        err: UpdateError,
        report: &mut UpdateReport,
    ) -> Result<(), UpdateError> {
        match self.config.failure_policy {
            FailurePolicy::Abort => Err(err),
            FailurePolicy::Skip => {
                report.skipped.push(SkippedSite {
                    deployment: site.deployment.clone(),
                    reason: err.to_string(),
                });
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::reconciler::tests::MockOrchestrator;
    use crate::deploy::reconciler::RetryPolicy;
    use crate::error::{ReconcileError, RevisionError};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    enum Answer {
        Sha(&'static str),
        RateLimited,
        Missing,
    }

    /// Resolver answering from a table and recording lookups.
    struct TableResolver {
        answers: HashMap<&'static str, Answer>,
        lookups: Mutex<Vec<String>>,
    }

    impl TableResolver {
        fn new(answers: Vec<(&'static str, Answer)>) -> Self {
            Self {
                answers: answers.into_iter().collect(),
                lookups: Mutex::new(Vec::new()),
            }
        }

        fn lookups(&self) -> Vec<String> {
            self.lookups.lock().expect("lock poisoned").clone()
        }
    }

    #[async_trait]
    impl RevisionResolver for TableResolver {
        async fn tip_commit(&self, owner: &str, repo: &str) -> Result<String, RevisionError> {
            self.lookups.lock().expect("lock poisoned").push(repo.to_string());
            match self.answers.get(repo) {
                Some(Answer::Sha(sha)) => Ok(sha.to_string()),
                Some(Answer::RateLimited) => Err(RevisionError::RateLimited { reset: None }),
                Some(Answer::Missing) | None => Err(RevisionError::NotFound {
                    owner: owner.to_string(),
                    repo: repo.to_string(),
                }),
            }
        }
    }

    fn sites() -> Vec<SiteMap> {
        vec![
            SiteMap::new("a.example", "icco", "alpha", "a"),
            SiteMap::new("b.example", "icco", "beta", "b"),
            SiteMap::new("c.example", "icco", "gamma", "c"),
        ]
    }

    fn orchestrator() -> Arc<MockOrchestrator> {
        Arc::new(
            MockOrchestrator::default()
                .with_deployment("a", "gcr.io/icco-cloud/alpha:old")
                .with_deployment("b", "gcr.io/icco-cloud/beta:old")
                .with_deployment("c", "gcr.io/icco-cloud/gamma:old"),
        )
    }

    fn updater(
        resolver: Arc<TableResolver>,
        orchestrator: Arc<MockOrchestrator>,
        failure_policy: FailurePolicy,
    ) -> WorkspaceUpdater {
        WorkspaceUpdater::new(
            sites(),
            resolver,
            DeploymentReconciler::new(orchestrator, RetryPolicy::immediate(5)),
            UpdaterConfig {
                failure_policy,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_updates_every_site_in_order() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Sha("a1")),
            ("beta", Answer::Sha("old")),
            ("gamma", Answer::Sha("c3")),
        ]));
        let orchestrator = orchestrator();

        let report = updater(resolver.clone(), orchestrator.clone(), FailurePolicy::Abort)
            .update_all()
            .await
            .expect("batch succeeds");

        assert_eq!(resolver.lookups(), vec!["alpha", "beta", "gamma"]);
        assert_eq!(report.updated, vec!["a", "c"]);
        assert_eq!(report.unchanged, vec!["b"]);
        assert_eq!(
            orchestrator.image("a").as_deref(),
            Some("gcr.io/icco-cloud/alpha:a1")
        );
        assert_eq!(
            orchestrator.image("c").as_deref(),
            Some("gcr.io/icco-cloud/gamma:c3")
        );
    }

    #[tokio::test]
    async fn test_rate_limit_stops_batch_successfully() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Sha("a1")),
            ("beta", Answer::RateLimited),
            ("gamma", Answer::Sha("c3")),
        ]));
        let orchestrator = orchestrator();

        let report = updater(resolver.clone(), orchestrator.clone(), FailurePolicy::Abort)
            .update_all()
            .await
            .expect("rate limiting is not a failure");

        assert_eq!(report.updated, vec!["a"]);
        assert_eq!(report.halted_at.as_deref(), Some("b"));
        assert_eq!(report.processed(), 1);
        assert_eq!(resolver.lookups(), vec!["alpha", "beta"]);
        assert_eq!(
            orchestrator.writes(),
            vec![("a".to_string(), "gcr.io/icco-cloud/alpha:a1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_rate_limit_on_first_site_writes_nothing() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::RateLimited),
            ("beta", Answer::Sha("b2")),
            ("gamma", Answer::Sha("c3")),
        ]));
        let orchestrator = orchestrator();

        let report = updater(resolver.clone(), orchestrator.clone(), FailurePolicy::Abort)
            .update_all()
            .await
            .expect("rate limiting is not a failure");

        assert_eq!(report.halted_at.as_deref(), Some("a"));
        assert_eq!(report.processed(), 0);
        assert_eq!(resolver.lookups(), vec!["alpha"]);
        assert!(orchestrator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_rate_limit_on_last_site_keeps_earlier_updates() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Sha("a1")),
            ("beta", Answer::Sha("b2")),
            ("gamma", Answer::RateLimited),
        ]));
        let orchestrator = orchestrator();

        let report = updater(resolver.clone(), orchestrator.clone(), FailurePolicy::Abort)
            .update_all()
            .await
            .expect("rate limiting is not a failure");

        assert_eq!(report.updated, vec!["a", "b"]);
        assert_eq!(report.halted_at.as_deref(), Some("c"));
        assert_eq!(
            orchestrator.writes(),
            vec![
                ("a".to_string(), "gcr.io/icco-cloud/alpha:a1".to_string()),
                ("b".to_string(), "gcr.io/icco-cloud/beta:b2".to_string()),
            ]
        );
        assert_eq!(
            orchestrator.image("c").as_deref(),
            Some("gcr.io/icco-cloud/gamma:old")
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_aborts_by_default() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Missing),
            ("beta", Answer::Sha("b2")),
        ]));
        let orchestrator = orchestrator();

        let err = updater(resolver, orchestrator.clone(), FailurePolicy::Abort)
            .update_all()
            .await
            .unwrap_err();

        assert!(matches!(err, UpdateError::Revision { ref repo, .. } if repo == "alpha"));
        assert!(orchestrator.writes().is_empty());
    }

    #[tokio::test]
    async fn test_skip_policy_continues_past_failures() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Missing),
            ("beta", Answer::Sha("b2")),
            ("gamma", Answer::Sha("c3")),
        ]));
        let orchestrator = Arc::new(
            MockOrchestrator::default()
                .with_deployment("a", "gcr.io/icco-cloud/alpha:old")
                .with_deployment("c", "gcr.io/icco-cloud/gamma:old"),
        );

        let report = updater(resolver, orchestrator.clone(), FailurePolicy::Skip)
            .update_all()
            .await
            .expect("skip policy never fails");

        assert_eq!(report.updated, vec!["c"]);
        assert_eq!(report.skipped.len(), 2);
        assert_eq!(report.skipped[0].deployment, "a");
        assert_eq!(report.skipped[1].deployment, "b");
        assert!(report.skipped[0].reason.contains("could not get icco/alpha"));
    }

    #[tokio::test]
    async fn test_reconcile_failure_aborts() {
        let resolver = Arc::new(TableResolver::new(vec![
            ("alpha", Answer::Sha("a1")),
            ("beta", Answer::Sha("b2")),
        ]));
        let orchestrator = Arc::new(
            MockOrchestrator::default()
                .with_deployment("a", "gcr.io/icco-cloud/alpha:old")
                .with_conflicts(10),
        );

        let err = updater(resolver.clone(), orchestrator, FailurePolicy::Abort)
            .update_all()
            .await
            .unwrap_err();

        match err {
            UpdateError::Reconcile { deployment, source } => {
                assert_eq!(deployment, "a");
                assert!(matches!(source, ReconcileError::RetriesExhausted { .. }));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(resolver.lookups(), vec!["alpha"]);
    }
}
