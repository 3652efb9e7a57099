//! Waiting for an execution unit to finish.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::objects::{Pod, PodPhase};
use crate::cluster::{ClusterClient, ClusterError, NamespacedName};
use crate::job::definitions::CERTSUITE_CONTAINER_NAME;

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("timeout ({}) reached while waiting for cert suite pod {pod} to finish", humantime::format_duration(*.timeout))]
    Timeout { pod: NamespacedName, timeout: Duration },

    /// The pod failed but carries no status for the suite container.
    #[error("pod {pod} has no status for container cnf-certsuite")]
    MissingExitStatus { pod: NamespacedName },

    #[error("container cnf-certsuite in pod {pod} has not terminated")]
    NotTerminated { pod: NamespacedName },

    #[error("failed to read pod: {0}")]
    Cluster(#[from] ClusterError),

    #[error("monitoring of pod {pod} was cancelled")]
    Cancelled { pod: NamespacedName },
}

/// Timeout for a run, from its duration string. Empty or unparsable input
/// yields `default`.
pub fn run_timeout(timeout: &str, default: Duration) -> Duration {
    let timeout = timeout.trim();
    if timeout.is_empty() {
        return default;
    }
    match humantime::parse_duration(timeout) {
        Ok(d) if !d.is_zero() => d,
        Ok(_) => default,
        Err(e) => {
            warn!(timeout, error = %e, default = %humantime::format_duration(default), "invalid run timeout, using default");
            default
        }
    }
}

/// Exit code of the suite container in a terminated pod.
pub fn runner_exit_code(pod: &Pod) -> Result<i32, MonitorError> {
    let key = NamespacedName::new(&pod.metadata.namespace, &pod.metadata.name);
    let status = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.iter().find(|c| c.name == CERTSUITE_CONTAINER_NAME))
        .ok_or_else(|| MonitorError::MissingExitStatus { pod: key.clone() })?;

    status
        .state
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
        .ok_or(MonitorError::NotTerminated { pod: key })
}

/// Polls a pod until it reaches a terminal phase.
#[derive(Clone)]
pub struct CompletionMonitor {
    client: Arc<dyn ClusterClient>,
    interval: Duration,
}

impl CompletionMonitor {
    pub fn new(client: Arc<dyn ClusterClient>, interval: Duration) -> Self {
        Self { client, interval }
    }

    /// Wait for `pod` to finish within `timeout`.
    ///
    /// `Succeeded` yields 0 and `Failed` yields the suite container's exit
    /// code. A pod that disappears ends the wait with the not-found error;
    /// other read failures are logged and polling continues.
    pub async fn wait_for_completion(
        &self,
        pod: &NamespacedName,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<i32, MonitorError> {
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(MonitorError::Cancelled { pod: pod.clone() });
                }
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(MonitorError::Timeout { pod: pod.clone(), timeout });
                }
                _ = ticker.tick() => {}
            }

            match self.client.get_pod(pod).await {
                Ok(current) => match current.phase() {
                    PodPhase::Succeeded => return Ok(0),
                    PodPhase::Failed => return runner_exit_code(&current),
                    phase => debug!(pod = %pod, %phase, "pod not finished yet"),
                },
                Err(e) if e.is_not_found() => return Err(e.into()),
                Err(e) => warn!(pod = %pod, error = %e, "failed to read pod status"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::objects::ContainerStatus;

    const TICK: Duration = Duration::from_millis(5);

    async fn cluster_with_pod(name: &str) -> (Arc<InMemoryCluster>, NamespacedName) {
        let cluster = Arc::new(InMemoryCluster::new());
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod.metadata.namespace = "ops".to_string();
        cluster.create_pod(&pod).await.unwrap();
        (cluster, NamespacedName::new("ops", name))
    }

    #[test]
    fn test_run_timeout_parsing() {
        let default = Duration::from_secs(3600);
        assert_eq!(run_timeout("2h", default), Duration::from_secs(7200));
        assert_eq!(run_timeout("90m", default), Duration::from_secs(5400));
        assert_eq!(run_timeout("", default), default);
        assert_eq!(run_timeout("garbage", default), default);
        assert_eq!(run_timeout("0s", default), default);
    }

    #[test]
    fn test_exit_code_extraction() {
        let mut pod = Pod::default();
        pod.metadata.name = "cnf-job-run-1".to_string();
        pod.metadata.namespace = "ops".to_string();
        pod.status = Some(crate::cluster::objects::PodStatus {
            phase: PodPhase::Failed,
            container_statuses: vec![
                ContainerStatus::terminated("cnf-certsuite-sidecar", 0),
                ContainerStatus::terminated(CERTSUITE_CONTAINER_NAME, 3),
            ],
        });
        assert_eq!(runner_exit_code(&pod).unwrap(), 3);
    }

    #[test]
    fn test_missing_runner_status_names_pod() {
        let mut pod = Pod::default();
        pod.metadata.name = "cnf-job-run-1".to_string();
        pod.metadata.namespace = "ops".to_string();
        pod.status = Some(crate::cluster::objects::PodStatus {
            phase: PodPhase::Failed,
            container_statuses: vec![ContainerStatus::terminated("something-else", 1)],
        });

        let err = runner_exit_code(&pod).unwrap_err();
        assert!(matches!(err, MonitorError::MissingExitStatus { .. }));
        assert!(err.to_string().contains("ops/cnf-job-run-1"));
    }

    #[tokio::test]
    async fn test_succeeded_pod_returns_zero() {
        let (cluster, key) = cluster_with_pod("cnf-job-run-1").await;
        cluster.set_pod_status(&key, PodPhase::Succeeded, vec![]).await.unwrap();

        let monitor = CompletionMonitor::new(cluster, TICK);
        let code = monitor
            .wait_for_completion(&key, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(code, 0);
    }

    #[tokio::test]
    async fn test_failed_pod_returns_runner_exit_code() {
        let (cluster, key) = cluster_with_pod("cnf-job-run-2").await;
        let monitor = CompletionMonitor::new(cluster.clone(), TICK);

        let waiter = {
            let key = key.clone();
            tokio::spawn(async move {
                monitor
                    .wait_for_completion(&key, Duration::from_secs(5), &CancellationToken::new())
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        cluster
            .set_pod_status(
                &key,
                PodPhase::Failed,
                vec![ContainerStatus::terminated(CERTSUITE_CONTAINER_NAME, 2)],
            )
            .await
            .unwrap();

        assert_eq!(waiter.await.unwrap().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stuck_pod_times_out() {
        let (cluster, key) = cluster_with_pod("cnf-job-run-3").await;
        cluster.set_pod_status(&key, PodPhase::Running, vec![]).await.unwrap();

        let monitor = CompletionMonitor::new(cluster, TICK);
        let err = monitor
            .wait_for_completion(&key, Duration::from_millis(50), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, MonitorError::Timeout { .. }));
        let msg = err.to_string();
        assert!(msg.contains("ops/cnf-job-run-3"), "{msg}");
        assert!(msg.contains("50ms"), "{msg}");
    }

    #[tokio::test]
    async fn test_cancellation_stops_wait() {
        let (cluster, key) = cluster_with_pod("cnf-job-run-4").await;
        let monitor = CompletionMonitor::new(cluster, TICK);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = monitor
            .wait_for_completion(&key, Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_deleted_pod_ends_wait() {
        let (cluster, key) = cluster_with_pod("cnf-job-run-5").await;
        cluster.delete_pod(&key).await.unwrap();

        let monitor = CompletionMonitor::new(cluster, TICK);
        let err = monitor
            .wait_for_completion(&key, Duration::from_secs(5), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::Cluster(ref e) if e.is_not_found()));
    }
}
