//! cron-runner: scheduled job runner.
//!
//! Consumes job messages published by an external scheduler, dispatches each
//! one to a named action, and keeps a catalogue of Kubernetes deployments on
//! the newest commit of their source repositories.

pub mod cli;
pub mod deploy;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod scheduler;
pub mod server;

// Re-export commonly used error types
pub use error::{
    ConfigError, DispatchError, JobError, OrchestratorError, ReconcileError, RevisionError,
    UpdateError,
};
