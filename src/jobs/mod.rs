//! Job actions.
//!
//! [`Integrations`] is the production [`JobRunner`]: it owns one shared HTTP
//! client and builds the client for each job from its configuration and the
//! credentials handed over by the dispatcher.

pub mod goodreads;
pub mod graphql;
pub mod pinboard;
pub mod spider;
pub mod tweets;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::info;

use crate::deploy::{
    default_site_maps, DeploymentReconciler, GitHubConfig, GitHubResolver, KubeClient, KubeConfig,
    RetryPolicy, SiteMap, UpdaterConfig, WorkspaceUpdater,
};
use crate::error::{ConfigError, JobError};
use crate::scheduler::dispatcher::JobRunner;
use crate::scheduler::job::{Credential, Credentials, JobKind};

use goodreads::Goodreads;
use graphql::{GraphQlClient, DEFAULT_GRAPHQL_ENDPOINT};
use pinboard::Pinboard;
use spider::{Spider, DEFAULT_SPIDER_URL};
use tweets::{Twitter, TwitterAuth};

/// Settings for every job integration.
#[derive(Debug, Clone)]
pub struct IntegrationsConfig {
    /// GraphQL endpoint imports are written to.
    pub graphql_endpoint: String,
    /// Crawl start for the spider.
    pub spider_url: String,
    /// Maximum pages fetched per crawl.
    pub spider_max_pages: usize,
    /// Revision lookups.
    pub github: GitHubConfig,
    /// Namespace holding the catalogued deployments.
    pub namespace: String,
    /// Workspace update batch settings.
    pub updater: UpdaterConfig,
    /// Conflict retry policy for deployment writes.
    pub retry: RetryPolicy,
    /// Sites kept up to date by `update-deployments`.
    pub site_maps: Vec<SiteMap>,
    /// Goodreads user whose shelf is imported.
    pub goodreads_user_id: Option<String>,
    /// Posts kept per `random-tweets` run.
    pub random_sample_size: usize,
    /// Timeout for outbound HTTP calls.
    pub http_timeout: Duration,
}

impl Default for IntegrationsConfig {
    fn default() -> Self {
        Self {
            graphql_endpoint: DEFAULT_GRAPHQL_ENDPOINT.to_string(),
            spider_url: DEFAULT_SPIDER_URL.to_string(),
            spider_max_pages: 100,
            github: GitHubConfig::default(),
            namespace: "default".to_string(),
            updater: UpdaterConfig::default(),
            retry: RetryPolicy::default(),
            site_maps: default_site_maps(),
            goodreads_user_id: None,
            random_sample_size: 10,
            http_timeout: Duration::from_secs(30),
        }
    }
}

/// Runs jobs against the real third-party services.
pub struct Integrations {
    http_client: Client,
    config: IntegrationsConfig,
}

impl Integrations {
    /// Create the runner.
    pub fn new(config: IntegrationsConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.http_timeout)
            .user_agent(concat!("cron-runner/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http_client,
            config,
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &IntegrationsConfig {
        &self.config
    }

    fn graphql(&self, credentials: &Credentials) -> Result<GraphQlClient, JobError> {
        let token = credentials.require(Credential::GraphqlToken)?;
        Ok(GraphQlClient::new(
            self.http_client.clone(),
            &self.config.graphql_endpoint,
            token,
        ))
    }

    /// Builds a workspace updater against the in-cluster orchestrator.
    fn workspace_updater(&self) -> Result<WorkspaceUpdater, JobError> {
        let kube = KubeClient::new(KubeConfig::in_cluster(&self.config.namespace)?)?;
        let resolver = GitHubResolver::with_client(self.http_client.clone(), self.config.github.clone());

        Ok(WorkspaceUpdater::new(
            self.config.site_maps.clone(),
            Arc::new(resolver),
            DeploymentReconciler::new(Arc::new(kube), self.config.retry.clone()),
            self.config.updater.clone(),
        ))
    }
}

#[async_trait]
impl JobRunner for Integrations {
    async fn run(&self, kind: JobKind, credentials: &Credentials) -> Result<(), JobError> {
        match kind {
            JobKind::Minute => {
                info!("heartbeat");
            }
            JobKind::UpdateDeployments => {
                self.workspace_updater()?.update_all().await?;
            }
            JobKind::Spider => {
                Spider::new(
                    self.http_client.clone(),
                    &self.config.spider_url,
                    self.config.spider_max_pages,
                )?
                .crawl()
                .await?;
            }
            JobKind::UserTweets => {
                let auth = TwitterAuth::from_credentials(credentials)?;
                Twitter::new(
                    self.http_client.clone(),
                    auth,
                    self.graphql(credentials)?,
                    self.config.random_sample_size,
                )
                .save_user_tweets()
                .await?;
            }
            JobKind::RandomTweets => {
                let auth = TwitterAuth::from_credentials(credentials)?;
                Twitter::new(
                    self.http_client.clone(),
                    auth,
                    self.graphql(credentials)?,
                    self.config.random_sample_size,
                )
                .cache_random_tweets()
                .await?;
            }
            JobKind::Pinboard => {
                let token = credentials.require(Credential::PinboardToken)?;
                Pinboard::new(self.http_client.clone(), token, self.graphql(credentials)?)
                    .update_pins()
                    .await?;
            }
            JobKind::Goodreads => {
                let token = credentials.require(Credential::GoodreadsToken)?;
                let user_id = self
                    .config
                    .goodreads_user_id
                    .as_deref()
                    .ok_or(ConfigError::MissingSetting("GOODREADS_USER_ID"))?;
                Goodreads::new(
                    self.http_client.clone(),
                    token,
                    user_id,
                    self.graphql(credentials)?,
                )
                .upsert_books()
                .await?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integrations_config_default() {
        let config = IntegrationsConfig::default();
        assert_eq!(config.graphql_endpoint, "https://graphql.natwelch.com/graphql");
        assert_eq!(config.spider_url, "https://writing.natwelch.com/");
        assert_eq!(config.namespace, "default");
        assert_eq!(config.github.branch, "master");
        assert_eq!(config.site_maps.len(), 16);
    }

    #[tokio::test]
    async fn test_heartbeat_needs_nothing() {
        let runner = Integrations::new(IntegrationsConfig::default());
        runner
            .run(JobKind::Minute, &Credentials::new())
            .await
            .expect("heartbeat always succeeds");
    }

    #[tokio::test]
    async fn test_goodreads_without_user_id() {
        let runner = Integrations::new(IntegrationsConfig::default());
        let credentials = Credentials::new()
            .with(Credential::GoodreadsToken, Some("key".to_string()))
            .with(Credential::GraphqlToken, Some("gql".to_string()));

        let err = runner.run(JobKind::Goodreads, &credentials).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::Config(ConfigError::MissingSetting("GOODREADS_USER_ID"))
        ));
    }

    #[tokio::test]
    async fn test_pinboard_without_token_is_a_config_error() {
        let runner = Integrations::new(IntegrationsConfig::default());
        let err = runner
            .run(JobKind::Pinboard, &Credentials::new())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: PINBOARD_TOKEN is unset");
    }
}
