//! Source revision lookups.
//!
//! Resolves a repository's tip commit on its deployment branch through the
//! GitHub REST API. Rate limiting is reported as its own error variant so the
//! workspace updater can stop the batch instead of hammering the API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::RevisionError;

/// GitHub REST API base URL.
const GITHUB_API_BASE: &str = "https://api.github.com";

/// Resolves the newest commit of a repository.
#[async_trait]
pub trait RevisionResolver: Send + Sync {
    /// Returns the commit id at the tip of the deployment branch.
    ///
    /// # Errors
    ///
    /// - `RevisionError::RateLimited` when the service refuses for quota reasons
    /// - `RevisionError::NotFound` when the repository or branch is missing
    /// - `RevisionError::Http` / `RevisionError::Parse` for transport problems
    async fn tip_commit(&self, owner: &str, repo: &str) -> Result<String, RevisionError>;
}

/// Configuration for the GitHub resolver.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// API base URL, overridable for GitHub Enterprise or tests.
    pub api_base: String,
    /// Branch whose tip gets deployed.
    pub branch: String,
    /// Optional token for higher rate limits.
    pub token: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            api_base: GITHUB_API_BASE.to_string(),
            branch: "master".to_string(),
            token: None,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Revision resolver backed by the GitHub branches endpoint.
pub struct GitHubResolver {
    http_client: Client,
    config: GitHubConfig,
}

impl GitHubResolver {
    /// Create a resolver.
    pub fn new(config: GitHubConfig) -> Self {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            http_client,
            config,
        }
    }

    /// Create a resolver sharing an existing HTTP client.
    pub fn with_client(http_client: Client, config: GitHubConfig) -> Self {
        Self {
            http_client,
            config,
        }
    }

    /// Check if an API token is configured.
    pub fn has_token(&self) -> bool {
        self.config.token.is_some()
    }

    fn branch_url(&self, owner: &str, repo: &str) -> String {
        format!(
            "{}/repos/{}/{}/branches/{}",
            self.config.api_base.trim_end_matches('/'),
            owner,
            repo,
            urlencoding::encode(&self.config.branch)
        )
    }
}

#[async_trait]
impl RevisionResolver for GitHubResolver {
    async fn tip_commit(&self, owner: &str, repo: &str) -> Result<String, RevisionError> {
        let url = self.branch_url(owner, repo);

        let mut request = self
            .http_client
            .get(&url)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "cron-runner/1.0")
            .header("X-GitHub-Api-Version", "2022-11-28");

        if let Some(ref token) = self.config.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| RevisionError::Http(e.to_string()))?;

        let status = response.status();
        if let Some(err) = classify_failure(status, response.headers(), owner, repo) {
            return Err(err);
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RevisionError::Parse(format!("Failed to parse branch: {}", e)))?;

        let sha = parse_branch_sha(&body).ok_or_else(|| RevisionError::NotFound {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })?;

        debug!(owner, repo, sha = %sha, "Resolved tip commit");
        Ok(sha)
    }
}

/// Maps a non-success response to an error; `None` for success.
///
/// GitHub signals an exhausted quota with 429, or with 403 and
/// `x-ratelimit-remaining: 0`. Other 403s are permission problems.
fn classify_failure(
    status: StatusCode,
    headers: &HeaderMap,
    owner: &str,
    repo: &str,
) -> Option<RevisionError> {
    if status.is_success() {
        return None;
    }

    let header_u64 = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
    };

    let quota_exhausted = header_u64("x-ratelimit-remaining") == Some(0);
    if status == StatusCode::TOO_MANY_REQUESTS || (status == StatusCode::FORBIDDEN && quota_exhausted)
    {
        return Some(RevisionError::RateLimited {
            reset: header_u64("x-ratelimit-reset"),
        });
    }

    if status == StatusCode::NOT_FOUND {
        return Some(RevisionError::NotFound {
            owner: owner.to_string(),
            repo: repo.to_string(),
        });
    }

    Some(RevisionError::Http(format!(
        "API returned status {} for {}/{}",
        status, owner, repo
    )))
}

/// Extracts `commit.sha` from a branch document, rejecting empty values.
fn parse_branch_sha(body: &Value) -> Option<String> {
    body.get("commit")
        .and_then(|c| c.get("sha"))
        .and_then(Value::as_str)
        .filter(|sha| !sha.is_empty())
        .map(str::to_string)
}
