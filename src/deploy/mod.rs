//! Keeping deployments on their repositories' newest commits.
//!
//! - **SiteMap**: Catalogue entry tying a repository to a deployment
//! - **RevisionResolver**: Looks up a repository's tip commit (GitHub)
//! - **Orchestrator**: Reads and replaces deployments (Kubernetes)
//! - **DeploymentReconciler**: Read-modify-write with conflict retries
//! - **WorkspaceUpdater**: Runs the catalogue through the two above, in order

pub mod image;
pub mod orchestrator;
pub mod reconciler;
pub mod revision;
pub mod site_map;
pub mod updater;

pub use image::{ImageReference, DEFAULT_REGISTRY};
pub use orchestrator::{KubeClient, KubeConfig, Orchestrator, WorkloadState};
pub use reconciler::{DeploymentReconciler, ReconcileOutcome, RetryPolicy};
pub use revision::{GitHubConfig, GitHubResolver, RevisionResolver};
pub use site_map::{default_site_maps, SiteMap};
pub use updater::{FailurePolicy, UpdateReport, UpdaterConfig, WorkspaceUpdater};
