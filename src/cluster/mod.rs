//! Cluster access -- the object store the controller reads and mutates.
//!
//! [`ClusterClient`] is the seam between the controller and the API server.
//! [`rest::ApiServerClient`] talks to a real cluster; [`memory::InMemoryCluster`]
//! backs the tests.

pub mod memory;
pub mod objects;
pub mod rest;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crd::CertSuiteRun;
use self::objects::Pod;

// ---------------------------------------------------------------------------
// NamespacedName
// ---------------------------------------------------------------------------

/// Identity of a namespaced object.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures talking to the cluster.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: NamespacedName },

    /// The write was based on a stale resourceVersion.
    #[error("conflict writing {kind} {key}: the object has been modified")]
    Conflict { kind: &'static str, key: NamespacedName },

    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: &'static str, key: NamespacedName },

    #[error("API server returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("request to API server failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to decode API response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("cluster client misconfigured: {0}")]
    Config(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }
}

// ---------------------------------------------------------------------------
// ClusterClient
// ---------------------------------------------------------------------------

/// Operations the controller, the monitor and the harvester need.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Fetch the latest copy of a run.
    async fn get_run(&self, key: &NamespacedName) -> Result<CertSuiteRun, ClusterError>;

    /// List all runs in a namespace.
    async fn list_runs(&self, namespace: &str) -> Result<Vec<CertSuiteRun>, ClusterError>;

    /// Replace the status sub-resource of a run.
    ///
    /// The write carries the run's `resourceVersion`; a stale version yields
    /// [`ClusterError::Conflict`].
    async fn update_run_status(&self, run: &CertSuiteRun) -> Result<CertSuiteRun, ClusterError>;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError>;

    async fn get_pod(&self, key: &NamespacedName) -> Result<Pod, ClusterError>;

    /// List all pods in a namespace.
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError>;

    async fn delete_pod(&self, key: &NamespacedName) -> Result<(), ClusterError>;
}
