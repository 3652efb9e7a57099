//! Kubernetes API server client over plain REST.
//!
//! Speaks just enough of the API to serve [`ClusterClient`]: the run custom
//! resource (including its status sub-resource) and core/v1 pods. Inside a
//! cluster it authenticates with the mounted service-account token and trusts
//! the mounted CA bundle.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::objects::Pod;
use super::{ClusterClient, ClusterError, NamespacedName};
use crate::config::ClusterConfig;
use crate::crd::{self, CertSuiteRun};

const RUN_KIND: &str = "CnfCertificationSuiteRun";
const POD_KIND: &str = "Pod";

/// `metav1.Status` body returned by the API server on errors.
#[derive(Debug, Default, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct RunList {
    #[serde(default)]
    items: Vec<CertSuiteRun>,
}

#[derive(Debug, Deserialize)]
struct PodList {
    #[serde(default)]
    items: Vec<Pod>,
}

/// REST-backed [`ClusterClient`].
pub struct ApiServerClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl ApiServerClient {
    /// Build a client from configuration, falling back to the in-cluster
    /// environment for anything left unset.
    pub fn from_config(config: &ClusterConfig) -> Result<Self, ClusterError> {
        let base_url = match &config.api_server {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => in_cluster_url()?,
        };

        let mut builder = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_sec));

        if config.ca_cert_path.exists() {
            let pem = std::fs::read(&config.ca_cert_path).map_err(|e| {
                ClusterError::Config(format!(
                    "failed to read CA bundle {}: {e}",
                    config.ca_cert_path.display()
                ))
            })?;
            builder = builder.add_root_certificate(reqwest::Certificate::from_pem(&pem)?);
        }

        let token = read_token(&config.token_path)?;
        info!(api_server = %base_url, token = token.is_some(), "configured API server client");

        Ok(Self {
            http: builder.build()?,
            base_url,
            token,
        })
    }

    async fn request<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
        kind: &'static str,
        key: &NamespacedName,
    ) -> Result<T, ClusterError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{}", self.base_url, path);
        debug!(%method, %url, "API request");

        let mut req = self.http.request(method, &url);
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req.send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(map_error(status, &text, kind, key));
        }
        Ok(serde_json::from_str(&text)?)
    }
}

#[async_trait]
impl ClusterClient for ApiServerClient {
    async fn get_run(&self, key: &NamespacedName) -> Result<CertSuiteRun, ClusterError> {
        let path = run_path(&key.namespace, Some(&key.name));
        self.request::<(), _>(Method::GET, &path, None, RUN_KIND, key).await
    }

    async fn list_runs(&self, namespace: &str) -> Result<Vec<CertSuiteRun>, ClusterError> {
        let path = run_path(namespace, None);
        let key = NamespacedName::new(namespace, "");
        let list: RunList = self
            .request::<(), _>(Method::GET, &path, None, RUN_KIND, &key)
            .await?;
        Ok(list.items)
    }

    async fn update_run_status(&self, run: &CertSuiteRun) -> Result<CertSuiteRun, ClusterError> {
        let key = run.key();
        let path = format!("{}/status", run_path(&key.namespace, Some(&key.name)));
        self.request(Method::PUT, &path, Some(run), RUN_KIND, &key).await
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let key = NamespacedName::new(&pod.metadata.namespace, &pod.metadata.name);
        let path = pod_path(&key.namespace, None);
        self.request(Method::POST, &path, Some(pod), POD_KIND, &key).await
    }

    async fn get_pod(&self, key: &NamespacedName) -> Result<Pod, ClusterError> {
        let path = pod_path(&key.namespace, Some(&key.name));
        self.request::<(), _>(Method::GET, &path, None, POD_KIND, key).await
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        let path = pod_path(namespace, None);
        let key = NamespacedName::new(namespace, "");
        let list: PodList = self
            .request::<(), _>(Method::GET, &path, None, POD_KIND, &key)
            .await?;
        Ok(list.items)
    }

    async fn delete_pod(&self, key: &NamespacedName) -> Result<(), ClusterError> {
        let path = pod_path(&key.namespace, Some(&key.name));
        let _: serde_json::Value = self
            .request::<(), _>(Method::DELETE, &path, None, POD_KIND, key)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn in_cluster_url() -> Result<String, ClusterError> {
    let host = std::env::var("KUBERNETES_SERVICE_HOST").map_err(|_| {
        ClusterError::Config(
            "no api_server configured and KUBERNETES_SERVICE_HOST is not set".to_string(),
        )
    })?;
    let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
    // IPv6 service hosts need brackets.
    if host.contains(':') {
        Ok(format!("https://[{host}]:{port}"))
    } else {
        Ok(format!("https://{host}:{port}"))
    }
}

fn read_token(path: &Path) -> Result<Option<String>, ClusterError> {
    if !path.exists() {
        return Ok(None);
    }
    let token = std::fs::read_to_string(path).map_err(|e| {
        ClusterError::Config(format!("failed to read token {}: {e}", path.display()))
    })?;
    Ok(Some(token.trim().to_string()))
}

fn run_path(namespace: &str, name: Option<&str>) -> String {
    let base = format!(
        "/apis/{}/{}/namespaces/{}/{}",
        crd::GROUP,
        crd::VERSION,
        namespace,
        crd::PLURAL
    );
    match name {
        Some(name) => format!("{base}/{name}"),
        None => base,
    }
}

fn pod_path(namespace: &str, name: Option<&str>) -> String {
    let base = format!("/api/v1/namespaces/{namespace}/pods");
    match name {
        Some(name) => format!("{base}/{name}"),
        None => base,
    }
}

/// Translate a non-2xx response into the error taxonomy.
fn map_error(status: StatusCode, body: &str, kind: &'static str, key: &NamespacedName) -> ClusterError {
    let api_status: ApiStatus = serde_json::from_str(body).unwrap_or_default();
    match status {
        StatusCode::NOT_FOUND => ClusterError::NotFound {
            kind,
            key: key.clone(),
        },
        StatusCode::CONFLICT if api_status.reason == "AlreadyExists" => {
            ClusterError::AlreadyExists {
                kind,
                key: key.clone(),
            }
        }
        StatusCode::CONFLICT => ClusterError::Conflict {
            kind,
            key: key.clone(),
        },
        _ => {
            let message = if api_status.message.is_empty() {
                body.trim().to_string()
            } else {
                api_status.message
            };
            ClusterError::Api {
                status: status.as_u16(),
                message,
            }
        }
    }
}
