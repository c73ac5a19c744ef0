//! CLI command definitions for cron-runner.
//!
//! `serve` is what runs in the cluster: the HTTP endpoints on the main task
//! and the message consumer on a background task. `run` executes one job in
//! the foreground and `publish` plays the part of the external scheduler.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::deploy::{FailurePolicy, GitHubConfig, RetryPolicy, UpdaterConfig, DEFAULT_REGISTRY};
use crate::jobs::spider::DEFAULT_SPIDER_URL;
use crate::jobs::{Integrations, IntegrationsConfig};
use crate::metrics::init_metrics;
use crate::scheduler::{
    Consumer, ConsumerConfig, Credential, CredentialPolicy, Credentials, Dispatcher, JobMessage,
    StreamPublisher, StreamSubscription, SubscriptionConfig,
};
use crate::server;

/// Scheduled job runner.
#[derive(Parser)]
#[command(name = "cron-runner")]
#[command(about = "Consume scheduler messages and run the named jobs")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Consume job messages and serve the health and metrics endpoints.
    Serve(Box<ServeArgs>),

    /// Run a single job once and exit.
    Run(Box<RunArgs>),

    /// Publish a job message to the topic.
    Publish(PublishArgs),
}

/// Broker connection settings.
#[derive(clap::Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Redis connection URL.
    #[arg(long, env = "REDIS_URL", default_value = "redis://localhost:6379")]
    pub redis_url: String,

    /// Stream the scheduler publishes to.
    #[arg(long, env = "CRON_STREAM", default_value = "cron")]
    pub topic: String,
}

/// Credentials read from the environment.
#[derive(clap::Args, Clone, Default)]
pub struct CredentialArgs {
    #[arg(long, env = "GQL_TOKEN", hide_env_values = true)]
    pub gql_token: Option<String>,

    #[arg(long, env = "PINBOARD_TOKEN", hide_env_values = true)]
    pub pinboard_token: Option<String>,

    #[arg(long, env = "GOODREADS_TOKEN", hide_env_values = true)]
    pub goodreads_token: Option<String>,

    #[arg(long, env = "TWITTER_CONSUMER_KEY", hide_env_values = true)]
    pub twitter_consumer_key: Option<String>,

    #[arg(long, env = "TWITTER_CONSUMER_SECRET", hide_env_values = true)]
    pub twitter_consumer_secret: Option<String>,

    #[arg(long, env = "TWITTER_ACCESS_TOKEN", hide_env_values = true)]
    pub twitter_access_token: Option<String>,

    #[arg(long, env = "TWITTER_ACCESS_SECRET", hide_env_values = true)]
    pub twitter_access_secret: Option<String>,

    /// Which credentials must be present before a job runs.
    #[arg(long, env = "CRON_CREDENTIAL_POLICY", value_enum, default_value_t = CredentialPolicy::Scoped)]
    pub credential_policy: CredentialPolicy,
}

impl CredentialArgs {
    /// Collects the credentials into the dispatcher's form.
    pub fn credentials(&self) -> Credentials {
        Credentials::new()
            .with(Credential::GraphqlToken, self.gql_token.clone())
            .with(Credential::PinboardToken, self.pinboard_token.clone())
            .with(Credential::GoodreadsToken, self.goodreads_token.clone())
            .with(Credential::TwitterConsumerKey, self.twitter_consumer_key.clone())
            .with(Credential::TwitterConsumerSecret, self.twitter_consumer_secret.clone())
            .with(Credential::TwitterAccessToken, self.twitter_access_token.clone())
            .with(Credential::TwitterAccessSecret, self.twitter_access_secret.clone())
    }
}

/// Settings for the job integrations.
#[derive(clap::Args, Debug, Clone)]
pub struct IntegrationArgs {
    /// GraphQL endpoint imports are written to.
    #[arg(long, env = "GRAPHQL_ENDPOINT", default_value = crate::jobs::graphql::DEFAULT_GRAPHQL_ENDPOINT)]
    pub graphql_endpoint: String,

    /// Registry prefix of deployment images.
    #[arg(long, env = "IMAGE_REGISTRY", default_value = DEFAULT_REGISTRY)]
    pub registry: String,

    /// Namespace holding the deployments.
    #[arg(long, env = "DEPLOY_NAMESPACE", default_value = "default")]
    pub namespace: String,

    /// Branch whose tip gets deployed.
    #[arg(long, env = "DEPLOY_BRANCH", default_value = "master")]
    pub branch: String,

    /// Optional GitHub token for revision lookups.
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    pub github_token: Option<String>,

    /// What to do when one deployment cannot be updated.
    #[arg(long, env = "DEPLOY_FAILURE_POLICY", value_enum, default_value_t = FailurePolicy::Abort)]
    pub failure_policy: FailurePolicy,

    /// Crawl start for the spider job.
    #[arg(long, env = "SPIDER_URL", default_value = DEFAULT_SPIDER_URL)]
    pub spider_url: String,

    /// Maximum pages fetched per crawl.
    #[arg(long, env = "SPIDER_MAX_PAGES", default_value = "100")]
    pub spider_max_pages: usize,

    /// Goodreads user whose read shelf is imported.
    #[arg(long, env = "GOODREADS_USER_ID")]
    pub goodreads_user_id: Option<String>,

    /// Posts kept per random-tweets run.
    #[arg(long, env = "RANDOM_TWEETS_SAMPLE", default_value = "10")]
    pub random_sample_size: usize,

    /// Timeout for outbound HTTP calls, in seconds.
    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,
}

impl IntegrationArgs {
    /// Builds the integrations configuration.
    pub fn config(&self) -> IntegrationsConfig {
        IntegrationsConfig {
            graphql_endpoint: self.graphql_endpoint.clone(),
            spider_url: self.spider_url.clone(),
            spider_max_pages: self.spider_max_pages,
            github: GitHubConfig {
                branch: self.branch.clone(),
                token: self.github_token.clone(),
                ..Default::default()
            },
            namespace: self.namespace.clone(),
            updater: UpdaterConfig {
                registry: self.registry.clone(),
                failure_policy: self.failure_policy,
            },
            retry: RetryPolicy::default(),
            goodreads_user_id: self.goodreads_user_id.clone(),
            random_sample_size: self.random_sample_size,
            http_timeout: Duration::from_secs(self.http_timeout_secs),
            ..Default::default()
        }
    }
}

/// Arguments for `cron-runner serve`.
#[derive(Parser)]
pub struct ServeArgs {
    /// Port for the health and metrics endpoints.
    #[arg(short, long, env = "PORT", default_value = "8080")]
    pub port: u16,

    #[command(flatten)]
    pub broker: BrokerArgs,

    /// Consumer group shared by every replica.
    #[arg(long, env = "CRON_SUBSCRIPTION", default_value = "cron-client")]
    pub subscription: String,

    /// Name of this consumer within the group.
    #[arg(long, env = "HOSTNAME", default_value = "cron-runner")]
    pub consumer: String,

    /// Seconds a receive blocks waiting for messages.
    #[arg(long, env = "CRON_POLL_SECS", default_value = "5")]
    pub poll_secs: u64,

    /// Seconds before an unacknowledged message is redelivered.
    #[arg(long, env = "CRON_ACK_DEADLINE_SECS", default_value = "60")]
    pub ack_deadline_secs: u64,

    /// Consecutive broker failures tolerated before exiting.
    #[arg(long, env = "CRON_MAX_BROKER_FAILURES", default_value = "10")]
    pub max_broker_failures: u32,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[command(flatten)]
    pub integrations: IntegrationArgs,
}

/// Arguments for `cron-runner run`.
#[derive(Parser)]
pub struct RunArgs {
    /// Job name, e.g. `minute` or `update-deployments`.
    pub job: String,

    #[command(flatten)]
    pub credentials: CredentialArgs,

    #[command(flatten)]
    pub integrations: IntegrationArgs,
}

/// Arguments for `cron-runner publish`.
#[derive(Parser, Debug)]
pub struct PublishArgs {
    /// Job name to publish.
    pub job: String,

    #[command(flatten)]
    pub broker: BrokerArgs,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Serve(args) => run_serve_command(*args).await,
        Commands::Run(args) => run_job_command(*args).await,
        Commands::Publish(args) => run_publish_command(args).await,
    }
}

fn build_dispatcher(credentials: &CredentialArgs, integrations: &IntegrationArgs) -> Dispatcher {
    let runner = Integrations::new(integrations.config());
    Dispatcher::new(
        Arc::new(runner),
        credentials.credentials(),
        credentials.credential_policy,
    )
}

async fn run_serve_command(args: ServeArgs) -> anyhow::Result<()> {
    init_metrics().context("Failed to initialize metrics")?;

    let dispatcher = build_dispatcher(&args.credentials, &args.integrations);

    let subscription_config = SubscriptionConfig::default()
        .with_redis_url(&args.broker.redis_url)
        .with_topic(&args.broker.topic)
        .with_subscription(&args.subscription)
        .with_consumer(&args.consumer)
        .with_poll_interval(Duration::from_secs(args.poll_secs))
        .with_ack_deadline(Duration::from_secs(args.ack_deadline_secs));

    let subscription = StreamSubscription::connect(subscription_config)
        .await
        .context("Failed to connect to the broker")?;

    info!(
        topic = %args.broker.topic,
        subscription = %args.subscription,
        consumer = %args.consumer,
        policy = ?dispatcher.policy(),
        "Subscribed"
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let consumer = Consumer::new(
        Arc::new(subscription),
        Arc::new(dispatcher),
        ConsumerConfig::default().with_max_consecutive_failures(args.max_broker_failures),
        shutdown_tx.subscribe(),
    );

    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(());
    });

    serve_until_shutdown(args.port, consumer, shutdown_tx).await
}

/// Runs the HTTP server and the consumer until either stops.
///
/// A shutdown broadcast stops both; the server drains open requests before
/// this returns.
async fn serve_until_shutdown(
    port: u16,
    consumer: Consumer,
    shutdown_tx: broadcast::Sender<()>,
) -> anyhow::Result<()> {
    let server = server::serve(port, shutdown_tx.subscribe());
    tokio::pin!(server);
    let mut consumer_handle = tokio::spawn(consumer.run());

    tokio::select! {
        result = &mut server => {
            let _ = shutdown_tx.send(());
            result.context("HTTP server failed")?;
            consumer_handle.await.context("Consumer task panicked")??;
        }
        joined = &mut consumer_handle => {
            let _ = shutdown_tx.send(());
            let consumer_result = joined.context("Consumer task panicked")?;
            server.await.context("HTTP server failed")?;
            match consumer_result {
                Ok(()) => info!("Consumer stopped"),
                Err(e) => {
                    error!(error = %e, "Consumer failed");
                    return Err(e.into());
                }
            }
        }
    }

    Ok(())
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down"),
                    _ = terminate.recv() => info!("Received SIGTERM, shutting down"),
                }
                return;
            }
            Err(e) => warn!(error = %e, "Failed to install SIGTERM handler"),
        }
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down"),
        Err(e) => {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}

async fn run_job_command(args: RunArgs) -> anyhow::Result<()> {
    let dispatcher = build_dispatcher(&args.credentials, &args.integrations);
    dispatcher.dispatch(&args.job).await?;
    info!(job = %args.job, "Job finished");
    Ok(())
}

async fn run_publish_command(args: PublishArgs) -> anyhow::Result<()> {
    let publisher = StreamPublisher::connect(&args.broker.redis_url, &args.broker.topic)
        .await
        .context("Failed to connect to the broker")?;

    let id = publisher.publish(&JobMessage::new(&args.job)).await?;
    info!(job = %args.job, id = %id, topic = %args.broker.topic, "Published job");
    Ok(())
}
