//! Job definitions for the scheduler.
//!
//! This module defines the core job types used by the dispatcher:
//!
//! - `JobMessage`: The inbound envelope published by the external scheduler
//! - `JobKind`: The closed set of jobs the service knows how to run
//! - `Credential` / `Credentials`: Secrets each job needs before it may run
//! - `CredentialPolicy`: How strictly credentials are checked before dispatch

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DispatchError};

/// Message envelope published by the scheduler.
///
/// Only `job` is interpreted. Every other field is kept for logging and
/// otherwise ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    /// Name of the job to run. Missing in the payload means empty.
    #[serde(default)]
    pub job: String,
    /// Extra fields sent alongside the job name.
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl JobMessage {
    /// Creates a message for the given job name.
    pub fn new(job: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            extra: HashMap::new(),
        }
    }

    /// Decodes a raw payload.
    ///
    /// Fails when the payload is not a JSON object or when `job` is present
    /// but not a string.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Encodes the message as a JSON payload.
    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A secret consumed by one or more jobs, sourced from the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Credential {
    GraphqlToken,
    PinboardToken,
    GoodreadsToken,
    TwitterConsumerKey,
    TwitterConsumerSecret,
    TwitterAccessToken,
    TwitterAccessSecret,
}

impl Credential {
    /// Every known credential.
    pub const ALL: [Credential; 7] = [
        Credential::GraphqlToken,
        Credential::PinboardToken,
        Credential::GoodreadsToken,
        Credential::TwitterConsumerKey,
        Credential::TwitterConsumerSecret,
        Credential::TwitterAccessToken,
        Credential::TwitterAccessSecret,
    ];

    /// Name of the environment variable holding this credential.
    pub fn env_var(&self) -> &'static str {
        match self {
            Credential::GraphqlToken => "GQL_TOKEN",
            Credential::PinboardToken => "PINBOARD_TOKEN",
            Credential::GoodreadsToken => "GOODREADS_TOKEN",
            Credential::TwitterConsumerKey => "TWITTER_CONSUMER_KEY",
            Credential::TwitterConsumerSecret => "TWITTER_CONSUMER_SECRET",
            Credential::TwitterAccessToken => "TWITTER_ACCESS_TOKEN",
            Credential::TwitterAccessSecret => "TWITTER_ACCESS_SECRET",
        }
    }
}

const TWITTER_JOB_CREDENTIALS: &[Credential] = &[
    Credential::GraphqlToken,
    Credential::TwitterConsumerKey,
    Credential::TwitterConsumerSecret,
    Credential::TwitterAccessToken,
    Credential::TwitterAccessSecret,
];

/// The jobs this service can run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Heartbeat, does nothing but log.
    Minute,
    /// Roll every catalogued deployment forward to its source tip.
    UpdateDeployments,
    /// Crawl the writing site looking for broken pages.
    Spider,
    /// Save the authenticated user's recent posts.
    UserTweets,
    /// Save recent bookmarks.
    Pinboard,
    /// Cache a random sample of timeline posts.
    RandomTweets,
    /// Save the read shelf from the book tracker.
    Goodreads,
}

impl JobKind {
    /// Every known job, in routing-table order.
    pub const ALL: [JobKind; 7] = [
        JobKind::Minute,
        JobKind::UpdateDeployments,
        JobKind::Spider,
        JobKind::UserTweets,
        JobKind::Pinboard,
        JobKind::RandomTweets,
        JobKind::Goodreads,
    ];

    /// Wire name of the job.
    pub fn name(&self) -> &'static str {
        match self {
            JobKind::Minute => "minute",
            JobKind::UpdateDeployments => "update-deployments",
            JobKind::Spider => "spider",
            JobKind::UserTweets => "user-tweets",
            JobKind::Pinboard => "pinboard",
            JobKind::RandomTweets => "random-tweets",
            JobKind::Goodreads => "goodreads",
        }
    }

    /// Credentials this job cannot run without.
    pub fn required_credentials(&self) -> &'static [Credential] {
        match self {
            JobKind::Minute | JobKind::UpdateDeployments | JobKind::Spider => &[],
            JobKind::UserTweets | JobKind::RandomTweets => TWITTER_JOB_CREDENTIALS,
            JobKind::Pinboard => &[Credential::GraphqlToken, Credential::PinboardToken],
            JobKind::Goodreads => &[Credential::GraphqlToken, Credential::GoodreadsToken],
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for JobKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| DispatchError::UnknownJob(s.to_string()))
    }
}

/// How credentials are checked before a job is dispatched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CredentialPolicy {
    /// Only the dispatched job's own credentials must be present.
    #[default]
    Scoped,
    /// Every credential any job uses must be present, whatever the job.
    Strict,
}

impl CredentialPolicy {
    /// Credentials that must be present before `kind` runs.
    pub fn required_for(&self, kind: JobKind) -> &'static [Credential] {
        match self {
            CredentialPolicy::Scoped => kind.required_credentials(),
            CredentialPolicy::Strict => &Credential::ALL,
        }
    }
}

/// Job credentials, read once at startup.
///
/// Empty values are treated as unset.
#[derive(Clone, Default)]
pub struct Credentials {
    values: HashMap<Credential, String>,
}

impl Credentials {
    /// Creates an empty credential set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a credential. `None` and empty strings leave it unset.
    pub fn with(mut self, credential: Credential, value: Option<String>) -> Self {
        match value.filter(|v| !v.is_empty()) {
            Some(value) => {
                self.values.insert(credential, value);
            }
            None => {
                self.values.remove(&credential);
            }
        }
        self
    }

    /// Returns the credential value, if set.
    pub fn get(&self, credential: Credential) -> Option<&str> {
        self.values.get(&credential).map(String::as_str)
    }

    /// Returns the credential value or a configuration error naming it.
    pub fn require(&self, credential: Credential) -> Result<&str, ConfigError> {
        self.get(credential)
            .ok_or(ConfigError::MissingCredential(credential.env_var()))
    }

    /// Checks that every listed credential is present.
    ///
    /// Reports the first missing one in list order.
    pub fn check(&self, required: &[Credential]) -> Result<(), ConfigError> {
        required
            .iter()
            .try_for_each(|credential| self.require(*credential).map(|_| ()))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let present: Vec<&str> = Credential::ALL
            .iter()
            .filter(|c| self.values.contains_key(*c))
            .map(Credential::env_var)
            .collect();
        f.debug_struct("Credentials")
            .field("present", &present)
            .finish()
    }
}
