//! Orchestrator access.
//!
//! Deployments are read and replaced through the Kubernetes REST API using
//! the pod's service account. Replacing a deployment sends back the
//! `resourceVersion` that was read, so a concurrent writer makes the request
//! fail with 409 Conflict instead of silently losing an update.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Certificate, Client, StatusCode};
use serde_json::Value;
use tracing::debug;

use crate::error::{ConfigError, OrchestratorError};

/// Directory where Kubernetes mounts the service account credentials.
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Snapshot of a deployment as last read from the orchestrator.
///
/// Wraps the full manifest so a replace writes back every field that was
/// read, changing only the primary container image.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadState {
    manifest: Value,
}

impl WorkloadState {
    /// Wraps a deployment manifest.
    ///
    /// # Errors
    ///
    /// Returns `OrchestratorError::Malformed` if the manifest has no name.
    pub fn from_manifest(manifest: Value) -> Result<Self, OrchestratorError> {
        if manifest.pointer("/metadata/name").and_then(Value::as_str).is_none() {
            return Err(OrchestratorError::Malformed(
                "deployment has no metadata.name".to_string(),
            ));
        }
        Ok(Self { manifest })
    }

    /// Deployment name.
    pub fn name(&self) -> &str {
        self.manifest
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Opaque version token used for optimistic concurrency.
    pub fn resource_version(&self) -> Option<&str> {
        self.manifest
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
    }

    /// Image of the first container in the pod template.
    ///
    /// `None` when the template has no containers or the first one is not
    /// an object.
    pub fn primary_image(&self) -> Option<&str> {
        self.primary_container()
            .map(|c| c.get("image").and_then(Value::as_str).unwrap_or_default())
    }

    /// Sets the first container's image. Returns false when there are no containers.
    pub fn set_primary_image(&mut self, image: &str) -> bool {
        match self
            .manifest
            .pointer_mut("/spec/template/spec/containers/0")
            .and_then(Value::as_object_mut)
        {
            Some(container) => {
                container.insert("image".to_string(), Value::String(image.to_string()));
                true
            }
            None => false,
        }
    }

    /// The full manifest.
    pub fn manifest(&self) -> &Value {
        &self.manifest
    }

    fn primary_container(&self) -> Option<&Value> {
        self.manifest
            .pointer("/spec/template/spec/containers/0")
            .filter(|c| c.is_object())
    }
}

/// Read/replace access to deployments.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Reads the latest version of a deployment.
    async fn get_deployment(&self, name: &str) -> Result<WorkloadState, OrchestratorError>;

    /// Replaces a deployment, conditioned on its resource version.
    ///
    /// Returns `OrchestratorError::Conflict` when the stored version moved on.
    async fn replace_deployment(
        &self,
        state: &WorkloadState,
    ) -> Result<WorkloadState, OrchestratorError>;
}

/// Connection settings for the Kubernetes API.
#[derive(Clone)]
pub struct KubeConfig {
    /// API server base URL.
    pub api_server: String,
    /// Bearer token for the service account.
    pub token: String,
    /// PEM-encoded CA bundle for the API server certificate.
    pub ca_pem: Option<Vec<u8>>,
    /// Namespace holding the deployments.
    pub namespace: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl std::fmt::Debug for KubeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeConfig")
            .field("api_server", &self.api_server)
            .field("namespace", &self.namespace)
            .field("has_ca", &self.ca_pem.is_some())
            .finish()
    }
}

impl KubeConfig {
    /// Builds the configuration available to a pod running in the cluster.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InClusterUnavailable` outside a cluster.
    pub fn in_cluster(namespace: &str) -> Result<Self, ConfigError> {
        Self::from_service_account(Path::new(SERVICE_ACCOUNT_DIR), namespace)
    }

    /// Builds the configuration from a service account directory and the
    /// `KUBERNETES_SERVICE_HOST` / `KUBERNETES_SERVICE_PORT` variables.
    pub fn from_service_account(dir: &Path, namespace: &str) -> Result<Self, ConfigError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
            ConfigError::InClusterUnavailable("KUBERNETES_SERVICE_HOST is unset".to_string())
        })?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token_path: PathBuf = dir.join("token");
        let token = std::fs::read_to_string(&token_path).map_err(|e| {
            ConfigError::InClusterUnavailable(format!("{}: {}", token_path.display(), e))
        })?;

        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();

        Ok(Self {
            api_server: format!("https://{}", join_host_port(&host, &port)),
            token: token.trim().to_string(),
            ca_pem,
            namespace: namespace.to_string(),
            timeout: Duration::from_secs(30),
        })
    }
}

/// Formats `host:port`, bracketing IPv6 literals.
fn join_host_port(host: &str, port: &str) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Kubernetes REST client for `apps/v1` deployments.
pub struct KubeClient {
    http_client: Client,
    config: KubeConfig,
}

impl KubeClient {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the CA bundle cannot be parsed.
    pub fn new(config: KubeConfig) -> Result<Self, ConfigError> {
        let mut builder = Client::builder().timeout(config.timeout);

        if let Some(ref pem) = config.ca_pem {
            let cert = Certificate::from_pem(pem).map_err(|e| ConfigError::InvalidValue {
                setting: "ca.crt",
                value: e.to_string(),
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let http_client = builder.build().map_err(|e| ConfigError::InvalidValue {
            setting: "kubernetes client",
            value: e.to_string(),
        })?;

        Ok(Self {
            http_client,
            config,
        })
    }

    /// Namespace this client operates on.
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    fn deployment_url(&self, name: &str) -> String {
        format!(
            "{}/apis/apps/v1/namespaces/{}/deployments/{}",
            self.config.api_server.trim_end_matches('/'),
            self.config.namespace,
            name
        )
    }

    async fn read_response(
        &self,
        name: &str,
        response: reqwest::Response,
    ) -> Result<WorkloadState, OrchestratorError> {
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, name, &body));
        }

        let manifest: Value = response
            .json()
            .await
            .map_err(|e| OrchestratorError::Malformed(e.to_string()))?;

        WorkloadState::from_manifest(manifest)
    }
}

#[async_trait]
impl Orchestrator for KubeClient {
    async fn get_deployment(&self, name: &str) -> Result<WorkloadState, OrchestratorError> {
        let response = self
            .http_client
            .get(self.deployment_url(name))
            .bearer_auth(&self.config.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| OrchestratorError::Http(e.to_string()))?;

        self.read_response(name, response).await
    }

    async fn replace_deployment(
        &self,
        state: &WorkloadState,
    ) -> Result<WorkloadState, OrchestratorError> {
        let name = state.name();
        debug!(
            deployment = name,
            resource_version = state.resource_version().unwrap_or_default(),
            "Replacing deployment"
        );

        let response = self
            .http_client
            .put(self.deployment_url(name))
            .bearer_auth(&self.config.token)
            .header("Accept", "application/json")
            .json(state.manifest())
            .send()
            .await
            .map_err(|e| OrchestratorError::Http(e.to_string()))?;

        self.read_response(name, response).await
    }
}

/// Maps an API error response to an error, using the `Status` message when present.
fn classify_status(status: StatusCode, name: &str, body: &str) -> OrchestratorError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string());

    match status {
        StatusCode::NOT_FOUND => OrchestratorError::NotFound(name.to_string()),
        StatusCode::CONFLICT => OrchestratorError::Conflict {
            name: name.to_string(),
            message,
        },
        _ => OrchestratorError::Api {
            code: status.as_u16(),
            message,
        },
    }
}
