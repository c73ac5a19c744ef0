//! Container image references.

use std::fmt;

/// Registry prefix deployments pull from.
pub const DEFAULT_REGISTRY: &str = "gcr.io/icco-cloud";

/// A fully qualified image reference: `{registry}/{repository}:{tag}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageReference {
    /// Builds the reference for a repository at a commit.
    pub fn for_commit(registry: &str, repository: &str, sha: &str) -> Self {
        Self {
            registry: registry.trim_end_matches('/').to_string(),
            repository: repository.to_string(),
            tag: sha.to_string(),
        }
    }
}

impl fmt::Display for ImageReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.registry, self.repository, self.tag)
    }
}
