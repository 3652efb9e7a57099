//! In-memory cluster used by tests and local experiments.
//!
//! Objects are versioned the way the API server versions them: every write
//! bumps a global `resourceVersion`, and a status write based on a stale
//! version is rejected with a conflict. A handful of hooks let tests inject
//! faults and drive pods through their phases.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::objects::{ContainerStatus, Pod, PodPhase, PodStatus};
use super::{ClusterClient, ClusterError, NamespacedName};
use crate::crd::CertSuiteRun;

#[derive(Default)]
struct ClusterState {
    runs: HashMap<NamespacedName, CertSuiteRun>,
    pods: HashMap<NamespacedName, Pod>,
    next_version: u64,
    /// Number of upcoming status writes to reject with a conflict.
    forced_conflicts: u32,
    /// Message to reject the next pod creation with.
    reject_next_pod: Option<String>,
    pods_created: usize,
    status_writes: usize,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.next_version += 1;
        self.next_version.to_string()
    }
}

/// A `ClusterClient` that keeps everything in process memory.
#[derive(Default)]
pub struct InMemoryCluster {
    state: Mutex<ClusterState>,
}

impl InMemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a run as if a user had applied it. Returns the stored copy.
    pub async fn apply_run(&self, mut run: CertSuiteRun) -> CertSuiteRun {
        let mut state = self.state.lock().await;
        if run.metadata.uid.is_empty() {
            run.metadata.uid = Uuid::new_v4().to_string();
        }
        run.metadata.creation_timestamp.get_or_insert_with(Utc::now);
        run.metadata.resource_version = state.bump();
        state.runs.insert(run.key(), run.clone());
        run
    }

    /// Remove a run as if a user had deleted it.
    pub async fn remove_run(&self, key: &NamespacedName) -> Option<CertSuiteRun> {
        self.state.lock().await.runs.remove(key)
    }

    /// Current copy of a run, without going through the client trait.
    pub async fn run(&self, key: &NamespacedName) -> Option<CertSuiteRun> {
        self.state.lock().await.runs.get(key).cloned()
    }

    pub async fn pod(&self, key: &NamespacedName) -> Option<Pod> {
        self.state.lock().await.pods.get(key).cloned()
    }

    /// Names of all pods currently stored in `namespace`, sorted.
    pub async fn pod_names(&self, namespace: &str) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .pods
            .keys()
            .filter(|k| k.namespace == namespace)
            .map(|k| k.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Total number of successful pod creations since construction.
    pub async fn pods_created(&self) -> usize {
        self.state.lock().await.pods_created
    }

    /// Total number of accepted status writes since construction.
    pub async fn status_writes(&self) -> usize {
        self.state.lock().await.status_writes
    }

    /// Reject the next `count` status writes with a conflict, as if another
    /// writer kept updating the object in between.
    pub async fn force_status_conflicts(&self, count: u32) {
        self.state.lock().await.forced_conflicts = count;
    }

    /// Reject the next pod creation with an API error.
    pub async fn reject_next_pod(&self, message: &str) {
        self.state.lock().await.reject_next_pod = Some(message.to_string());
    }

    /// Move a pod to `phase` with the given container statuses.
    pub async fn set_pod_status(
        &self,
        key: &NamespacedName,
        phase: PodPhase,
        container_statuses: Vec<ContainerStatus>,
    ) -> Result<(), ClusterError> {
        let mut state = self.state.lock().await;
        let version = state.bump();
        let pod = state.pods.get_mut(key).ok_or_else(|| ClusterError::NotFound {
            kind: "Pod",
            key: key.clone(),
        })?;
        pod.status = Some(PodStatus {
            phase,
            container_statuses,
        });
        pod.metadata.resource_version = version;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for InMemoryCluster {
    async fn get_run(&self, key: &NamespacedName) -> Result<CertSuiteRun, ClusterError> {
        self.state
            .lock()
            .await
            .runs
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "CnfCertificationSuiteRun",
                key: key.clone(),
            })
    }

    async fn list_runs(&self, namespace: &str) -> Result<Vec<CertSuiteRun>, ClusterError> {
        let state = self.state.lock().await;
        let mut runs: Vec<CertSuiteRun> = state
            .runs
            .values()
            .filter(|r| r.metadata.namespace == namespace)
            .cloned()
            .collect();
        runs.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(runs)
    }

    async fn update_run_status(&self, run: &CertSuiteRun) -> Result<CertSuiteRun, ClusterError> {
        let key = run.key();
        let mut state = self.state.lock().await;

        let current_version = match state.runs.get(&key) {
            Some(stored) => stored.metadata.resource_version.clone(),
            None => {
                return Err(ClusterError::NotFound {
                    kind: "CnfCertificationSuiteRun",
                    key,
                })
            }
        };

        if state.forced_conflicts > 0 {
            state.forced_conflicts -= 1;
            // someone else wrote in between
            let version = state.bump();
            if let Some(stored) = state.runs.get_mut(&key) {
                stored.metadata.resource_version = version;
            }
            debug!(run = %key, "forced status conflict");
            return Err(ClusterError::Conflict {
                kind: "CnfCertificationSuiteRun",
                key,
            });
        }

        if current_version != run.metadata.resource_version {
            return Err(ClusterError::Conflict {
                kind: "CnfCertificationSuiteRun",
                key,
            });
        }

        let version = state.bump();
        state.status_writes += 1;
        let stored = state.runs.get_mut(&key).ok_or_else(|| ClusterError::NotFound {
            kind: "CnfCertificationSuiteRun",
            key: key.clone(),
        })?;
        // Only the status sub-resource is written.
        stored.status = run.status.clone();
        stored.metadata.resource_version = version;
        Ok(stored.clone())
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ClusterError> {
        let key = NamespacedName::new(&pod.metadata.namespace, &pod.metadata.name);
        let mut state = self.state.lock().await;

        if let Some(message) = state.reject_next_pod.take() {
            return Err(ClusterError::Api {
                status: 422,
                message,
            });
        }
        if key.name.is_empty() {
            return Err(ClusterError::Api {
                status: 422,
                message: "pod name is required".to_string(),
            });
        }
        if state.pods.contains_key(&key) {
            return Err(ClusterError::AlreadyExists { kind: "Pod", key });
        }

        let mut stored = pod.clone();
        stored.metadata.uid = Uuid::new_v4().to_string();
        stored.metadata.resource_version = state.bump();
        stored.metadata.creation_timestamp = Some(Utc::now());
        stored.status = Some(PodStatus::default());
        state.pods.insert(key, stored.clone());
        state.pods_created += 1;
        Ok(stored)
    }

    async fn get_pod(&self, key: &NamespacedName) -> Result<Pod, ClusterError> {
        self.state
            .lock()
            .await
            .pods
            .get(key)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                kind: "Pod",
                key: key.clone(),
            })
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, ClusterError> {
        let state = self.state.lock().await;
        let mut pods: Vec<Pod> = state
            .pods
            .iter()
            .filter(|(k, _)| k.namespace == namespace)
            .map(|(_, pod)| pod.clone())
            .collect();
        pods.sort_by(|a, b| a.metadata.name.cmp(&b.metadata.name));
        Ok(pods)
    }

    async fn delete_pod(&self, key: &NamespacedName) -> Result<(), ClusterError> {
        match self.state.lock().await.pods.remove(key) {
            Some(_) => Ok(()),
            None => Err(ClusterError::NotFound {
                kind: "Pod",
                key: key.clone(),
            }),
        }
    }
}
