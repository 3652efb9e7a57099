//! Run lifecycle controller.
//!
//! [`Reconciler::reconcile`] drives one run identity through
//! `Deploying -> {DeployError | Running} -> {Finished | Error}`. Building and
//! submitting the execution unit happens inline; the wait for it to finish
//! is handed to a background task tied to the controller's shutdown token.
//!
//! A run that already records a live execution unit (left behind by a
//! previous controller) is adopted: it is tracked and monitored again, never
//! redeployed.

pub mod monitor;
pub mod status;
pub mod tracker;
pub mod watch;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterClient, ClusterError, NamespacedName};
use crate::config::ControllerConfig;
use crate::crd::{CertSuiteRun, StatusPhase};
use crate::job::{definitions, JobPodBuilder};
use self::monitor::{run_timeout, CompletionMonitor, MonitorError};
use self::status::{RetryPolicy, StatusUpdater};
use self::tracker::{RunClaim, RunTracker};

/// Controller knobs that do not change at runtime.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub namespace: String,
    pub sidecar_image: String,
    pub runner_image: String,
    pub check_interval: Duration,
    pub default_timeout: Duration,
    pub resync_interval: Duration,
}

impl From<&ControllerConfig> for ControllerSettings {
    fn from(cfg: &ControllerConfig) -> Self {
        Self {
            namespace: cfg.namespace.clone(),
            sidecar_image: cfg.sidecar_image.clone(),
            runner_image: cfg.runner_image.clone(),
            check_interval: cfg.check_interval(),
            default_timeout: cfg.default_timeout(),
            resync_interval: cfg.resync_interval(),
        }
    }
}

/// What a single reconcile did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A new execution unit was created and is being monitored.
    Started { pod_name: String },
    /// An existing execution unit recorded in the run's status is monitored
    /// again.
    Adopted { pod_name: String },
    /// The run already has an execution unit.
    AlreadyTracked,
    /// The run is gone; its tracking entry (and pod, if any) was cleaned up.
    Cleaned { pod_name: Option<String> },
    /// The run is gone and was never tracked.
    Absent,
    /// Building or submitting the execution unit failed.
    DeployFailed { reason: String },
}

pub struct Reconciler {
    client: Arc<dyn ClusterClient>,
    tracker: Arc<RunTracker>,
    status: StatusUpdater,
    monitor: CompletionMonitor,
    settings: ControllerSettings,
    pod_counter: AtomicU64,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Reconciler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        tracker: Arc<RunTracker>,
        settings: ControllerSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            status: StatusUpdater::new(client.clone(), retry),
            monitor: CompletionMonitor::new(client.clone(), settings.check_interval),
            client,
            tracker,
            settings,
            pod_counter: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        }
    }

    pub fn tracker(&self) -> &Arc<RunTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Tasks [`Reconciler::shutdown`] waits for. Work spawned here finishes
    /// before the controller stops.
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// Move the pod name counter past every execution unit already in the
    /// controller's namespace, so new names never collide with pods left by
    /// an earlier controller. Returns the highest index found.
    pub async fn seed_pod_counter(&self) -> Result<u64, ClusterError> {
        let highest = self
            .client
            .list_pods(&self.settings.namespace)
            .await?
            .iter()
            .filter_map(|pod| definitions::pod_index(&pod.metadata.name))
            .max()
            .unwrap_or(0);
        self.pod_counter.fetch_max(highest, Ordering::Relaxed);
        debug!(namespace = %self.settings.namespace, highest, "seeded pod name counter");
        Ok(highest)
    }

    /// Handle one lifecycle event for `key`.
    pub async fn reconcile(&self, key: &NamespacedName) -> Result<ReconcileOutcome, ClusterError> {
        let run = match self.client.get_run(key).await {
            Ok(run) => run,
            Err(e) if e.is_not_found() => return Ok(self.cleanup(key).await),
            Err(e) => return Err(e),
        };

        let Some(claim) = self.tracker.claim(key) else {
            debug!(run = %key, "run already tracked, nothing to do");
            return Ok(ReconcileOutcome::AlreadyTracked);
        };

        if let Some(pod_name) = recorded_pod(&run) {
            let pod_key = NamespacedName::new(&key.namespace, pod_name);
            match self.client.get_pod(&pod_key).await {
                Ok(_) => return Ok(self.adopt(&run, claim, pod_key).await),
                Err(e) if e.is_not_found() => {
                    warn!(run = %key, pod = %pod_key, "recorded cert suite pod is gone, redeploying");
                }
                Err(e) => return Err(e),
            }
        }

        info!(run = %key, "new run, deploying cert suite");
        self.status.update_phase(key, StatusPhase::Deploying).await?;

        let pod_name = definitions::pod_name(self.pod_counter.fetch_add(1, Ordering::Relaxed) + 1);
        let pod = match JobPodBuilder::for_run(
            &run,
            &pod_name,
            &self.settings.sidecar_image,
            &self.settings.runner_image,
        )
        .build()
        {
            Ok(pod) => pod,
            Err(e) => return self.deploy_failed(key, e.to_string()).await,
        };

        if let Err(e) = self.client.create_pod(&pod).await {
            return self.deploy_failed(key, e.to_string()).await;
        }
        let pod_key = NamespacedName::new(&key.namespace, &pod_name);
        info!(run = %key, pod = %pod_key, "cert suite pod created");

        let cancel = self.shutdown.child_token();
        if !claim.commit(&pod_name, cancel.clone()) {
            // deleted while we were deploying
            warn!(run = %key, pod = %pod_key, "run removed during deployment, deleting pod");
            self.delete_pod(&pod_key).await;
            return Ok(ReconcileOutcome::Cleaned {
                pod_name: Some(pod_name),
            });
        }

        let running = self
            .status
            .update(key, |status| {
                status.phase = StatusPhase::Running;
                status.cnf_cert_suite_pod_name = Some(pod_name.clone());
            })
            .await;
        if let Err(e) = running {
            error!(run = %key, error = %e, "failed to record running phase");
        }

        self.spawn_monitor(&run, pod_key, cancel);
        Ok(ReconcileOutcome::Started { pod_name })
    }

    /// Track and monitor a pod created by an earlier controller.
    async fn adopt(&self, run: &CertSuiteRun, claim: RunClaim<'_>, pod: NamespacedName) -> ReconcileOutcome {
        let key = run.key();
        if let Some(index) = definitions::pod_index(&pod.name) {
            self.pod_counter.fetch_max(index, Ordering::Relaxed);
        }

        let cancel = self.shutdown.child_token();
        if !claim.commit(&pod.name, cancel.clone()) {
            warn!(run = %key, pod = %pod, "run removed during adoption, deleting pod");
            self.delete_pod(&pod).await;
            return ReconcileOutcome::Cleaned {
                pod_name: Some(pod.name),
            };
        }

        info!(run = %key, pod = %pod, phase = %run.status.phase, "adopting running cert suite pod");
        let pod_name = pod.name.clone();
        self.spawn_monitor(run, pod, cancel);
        ReconcileOutcome::Adopted { pod_name }
    }

    async fn deploy_failed(
        &self,
        key: &NamespacedName,
        reason: String,
    ) -> Result<ReconcileOutcome, ClusterError> {
        error!(run = %key, error = %reason, "failed to deploy cert suite pod");
        if let Err(e) = self.status.update_phase(key, StatusPhase::DeployError).await {
            error!(run = %key, error = %e, "failed to record deploy error");
        }
        Ok(ReconcileOutcome::DeployFailed { reason })
    }

    async fn cleanup(&self, key: &NamespacedName) -> ReconcileOutcome {
        let Some(released) = self.tracker.remove(key) else {
            debug!(run = %key, "run not found and not tracked");
            return ReconcileOutcome::Absent;
        };

        info!(run = %key, pod = ?released.pod_name, "run deleted, cleaning up");
        if let Some(cancel) = &released.cancel {
            cancel.cancel();
        }
        if let Some(pod_name) = &released.pod_name {
            self.delete_pod(&NamespacedName::new(&key.namespace, pod_name)).await;
        }
        ReconcileOutcome::Cleaned {
            pod_name: released.pod_name,
        }
    }

    async fn delete_pod(&self, pod: &NamespacedName) {
        match self.client.delete_pod(pod).await {
            Ok(()) => info!(pod = %pod, "cert suite pod deleted"),
            Err(e) if e.is_not_found() => debug!(pod = %pod, "cert suite pod already gone"),
            Err(e) => warn!(pod = %pod, error = %e, "failed to delete cert suite pod"),
        }
    }

    fn spawn_monitor(&self, run: &CertSuiteRun, pod: NamespacedName, cancel: CancellationToken) {
        let key = run.key();
        let timeout = run_timeout(&run.spec.timeout, self.settings.default_timeout);
        let monitor = self.monitor.clone();
        let status = self.status.clone();
        let tracker = self.tracker.clone();

        self.tasks.spawn(async move {
            info!(run = %key, pod = %pod, timeout = %humantime::format_duration(timeout), "waiting for cert suite pod");
            let phase = match monitor.wait_for_completion(&pod, timeout, &cancel).await {
                Ok(0) => {
                    info!(run = %key, pod = %pod, "cert suite finished");
                    StatusPhase::Finished
                }
                Ok(code) => {
                    warn!(run = %key, pod = %pod, exit_code = code, "cert suite exited with failure");
                    StatusPhase::Error
                }
                Err(MonitorError::Cancelled { .. }) => {
                    debug!(run = %key, pod = %pod, "monitoring cancelled");
                    return;
                }
                Err(e) => {
                    error!(run = %key, pod = %pod, error = %e, "cert suite did not complete");
                    StatusPhase::Error
                }
            };

            if let Err(e) = status.update_phase(&key, phase).await {
                error!(run = %key, error = %e, %phase, "failed to record final phase");
            }
            tracker.complete(&key);
        });
    }

    /// Cancel every monitor and wait for the tasks to wind down.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("controller stopped");
    }
}

/// Execution unit a run's status says is still in flight.
fn recorded_pod(run: &CertSuiteRun) -> Option<&str> {
    match run.status.phase {
        StatusPhase::Deploying | StatusPhase::Running => run
            .status
            .cnf_cert_suite_pod_name
            .as_deref()
            .filter(|name| !name.is_empty()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::cluster::objects::Pod;
    use crate::crd::CertSuiteRunSpec;

    async fn existing_pod(cluster: &InMemoryCluster, name: &str) {
        let mut pod = Pod::default();
        pod.metadata.name = name.to_string();
        pod.metadata.namespace = "ops".to_string();
        cluster.create_pod(&pod).await.unwrap();
    }

    fn in_flight(name: &str, pod_name: &str) -> CertSuiteRun {
        let mut run = CertSuiteRun::new("ops", name, CertSuiteRunSpec::default());
        run.status.phase = StatusPhase::Running;
        run.status.cnf_cert_suite_pod_name = Some(pod_name.to_string());
        run
    }

    fn settings() -> ControllerSettings {
        ControllerSettings {
            namespace: "ops".to_string(),
            sidecar_image: "sidecar:test".to_string(),
            runner_image: "certsuite:test".to_string(),
            check_interval: Duration::from_millis(5),
            default_timeout: Duration::from_secs(5),
            resync_interval: Duration::from_millis(10),
        }
    }

    fn reconciler(cluster: &Arc<InMemoryCluster>) -> Reconciler {
        Reconciler::new(
            cluster.clone(),
            Arc::new(RunTracker::new()),
            settings(),
            RetryPolicy {
                initial_delay: Duration::from_millis(1),
                jitter: 0.0,
                ..RetryPolicy::default()
            },
        )
    }

    #[tokio::test]
    async fn test_new_run_goes_to_running() {
        let cluster = Arc::new(InMemoryCluster::new());
        let run = cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&run.key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Started {
                pod_name: "cnf-job-run-1".to_string()
            }
        );

        let stored = cluster.run(&run.key()).await.unwrap();
        assert_eq!(stored.status.phase, StatusPhase::Running);
        assert_eq!(stored.status.cnf_cert_suite_pod_name.as_deref(), Some("cnf-job-run-1"));
        assert!(cluster.pod(&NamespacedName::new("ops", "cnf-job-run-1")).await.is_some());

        // redelivery is a no-op
        assert_eq!(
            reconciler.reconcile(&run.key()).await.unwrap(),
            ReconcileOutcome::AlreadyTracked
        );
        assert_eq!(cluster.pods_created().await, 1);
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejected_pod_is_deploy_error_and_retryable() {
        let cluster = Arc::new(InMemoryCluster::new());
        let run = cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;
        cluster.reject_next_pod("admission denied").await;
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&run.key()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::DeployFailed { ref reason } if reason.contains("admission denied")));
        assert_eq!(cluster.run(&run.key()).await.unwrap().status.phase, StatusPhase::DeployError);
        assert!(!reconciler.tracker().contains(&run.key()));

        let outcome = reconciler.reconcile(&run.key()).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Started { .. }));
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_deleted_untracked_run_is_absent() {
        let cluster = Arc::new(InMemoryCluster::new());
        let reconciler = reconciler(&cluster);
        let outcome = reconciler
            .reconcile(&NamespacedName::new("ops", "ghost"))
            .await
            .unwrap();
        assert_eq!(outcome, ReconcileOutcome::Absent);
    }

    #[tokio::test]
    async fn test_deploying_write_failure_releases_claim() {
        let cluster = Arc::new(InMemoryCluster::new());
        let run = cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;
        cluster.force_status_conflicts(100).await;
        let reconciler = reconciler(&cluster);

        let err = reconciler.reconcile(&run.key()).await.unwrap_err();
        assert!(err.is_conflict());
        assert!(!reconciler.tracker().contains(&run.key()));
        assert_eq!(cluster.pods_created().await, 0);
    }

    #[tokio::test]
    async fn test_recorded_pod_is_adopted_not_redeployed() {
        let cluster = Arc::new(InMemoryCluster::new());
        existing_pod(&cluster, "cnf-job-run-4").await;
        let run = cluster.apply_run(in_flight("run-1", "cnf-job-run-4")).await;
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&run.key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Adopted {
                pod_name: "cnf-job-run-4".to_string()
            }
        );
        assert_eq!(cluster.pods_created().await, 1);
        assert_eq!(reconciler.tracker().pod_name(&run.key()).as_deref(), Some("cnf-job-run-4"));
        assert_eq!(cluster.run(&run.key()).await.unwrap().status.phase, StatusPhase::Running);

        // names continue after the adopted pod
        let other = cluster
            .apply_run(CertSuiteRun::new("ops", "run-2", CertSuiteRunSpec::default()))
            .await;
        assert_eq!(
            reconciler.reconcile(&other.key()).await.unwrap(),
            ReconcileOutcome::Started {
                pod_name: "cnf-job-run-5".to_string()
            }
        );
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_recorded_pod_is_redeployed() {
        let cluster = Arc::new(InMemoryCluster::new());
        let run = cluster.apply_run(in_flight("run-1", "cnf-job-run-9")).await;
        let reconciler = reconciler(&cluster);

        let outcome = reconciler.reconcile(&run.key()).await.unwrap();
        assert_eq!(
            outcome,
            ReconcileOutcome::Started {
                pod_name: "cnf-job-run-1".to_string()
            }
        );
        let stored = cluster.run(&run.key()).await.unwrap();
        assert_eq!(stored.status.cnf_cert_suite_pod_name.as_deref(), Some("cnf-job-run-1"));
        reconciler.shutdown().await;
    }

    #[tokio::test]
    async fn test_seed_pod_counter_skips_existing_names() {
        let cluster = Arc::new(InMemoryCluster::new());
        for name in ["cnf-job-run-3", "cnf-job-run-11", "unrelated"] {
            existing_pod(&cluster, name).await;
        }
        let run = cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;
        let reconciler = reconciler(&cluster);

        assert_eq!(reconciler.seed_pod_counter().await.unwrap(), 11);
        assert_eq!(
            reconciler.reconcile(&run.key()).await.unwrap(),
            ReconcileOutcome::Started {
                pod_name: "cnf-job-run-12".to_string()
            }
        );
        reconciler.shutdown().await;
    }
}
