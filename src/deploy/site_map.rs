//! Catalogue of deployed sites.
//!
//! Each entry ties a public host to the source repository it is built from
//! and the orchestrator deployment that serves it.

use serde::{Deserialize, Serialize};

/// Owner of every repository in the default catalogue.
pub const DEFAULT_OWNER: &str = "icco";

/// One deployed site.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteMap {
    /// Public host name, informational only.
    pub host: String,
    /// Source repository owner.
    pub owner: String,
    /// Source repository name.
    pub repo: String,
    /// Deployment name in the orchestrator.
    pub deployment: String,
}

impl SiteMap {
    /// Create a site entry.
    pub fn new(
        host: impl Into<String>,
        owner: impl Into<String>,
        repo: impl Into<String>,
        deployment: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            owner: owner.into(),
            repo: repo.into(),
            deployment: deployment.into(),
        }
    }

    /// Get the full repository path.
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

/// The sites kept up to date by the `update-deployments` job, in update order.
pub fn default_site_maps() -> Vec<SiteMap> {
    [
        ("cacophony.natwelch.com", "cacophony", "cacophony"),
        ("chartopia.app", "charts", "charts"),
        ("code.natwelch.com", "code.natwelch.com", "code"),
        ("cron.natwelch.com", "cron", "cron"),
        ("etu.natwelch.com", "etu", "etu"),
        ("gotak.app", "gotak", "gotak"),
        ("graphql.natwelch.com", "graphql", "graphql"),
        ("hello.natwelch.com", "hello", "hello"),
        ("inspiration.natwelch.com", "inspiration", "inspiration"),
        ("life.natwelch.com", "lifeline", "life"),
        ("melandnat.com", "melandnat.com", "melandnat"),
        ("natwelch.com", "natwelch.com", "natwelch"),
        ("quotes.natwelch.com", "crackquotes", "quotes"),
        ("resume.natwelch.com", "resume", "resume"),
        ("walls.natwelch.com", "wallpapers", "walls"),
        ("writing.natwelch.com", "writing", "writing"),
    ]
    .into_iter()
    .map(|(host, repo, deployment)| SiteMap::new(host, DEFAULT_OWNER, repo, deployment))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_default_site_maps() {
        let sites = default_site_maps();
        assert_eq!(sites.len(), 16);
        assert!(sites.iter().all(|s| s.owner == DEFAULT_OWNER));

        let deployments: HashSet<&str> = sites.iter().map(|s| s.deployment.as_str()).collect();
        assert_eq!(deployments.len(), sites.len());

        let life = sites
            .iter()
            .find(|s| s.deployment == "life")
            .expect("life is deployed");
        assert_eq!(life.full_name(), "icco/lifeline");
        assert_eq!(life.host, "life.natwelch.com");
    }

    #[test]
    fn test_default_site_maps_order() {
        let sites = default_site_maps();
        assert_eq!(sites[0].deployment, "cacophony");
        assert_eq!(sites[15].deployment, "writing");
    }
}
