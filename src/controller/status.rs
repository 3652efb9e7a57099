//! Conflict-safe writes to a run's status sub-resource.
//!
//! Every write is a read-modify-write: the run is fetched, the mutation is
//! applied to the fresh copy, and the result is written back carrying the
//! fetched `resourceVersion`. A conflict means someone wrote in between, so
//! the whole cycle is repeated after a backoff delay. Mutations may therefore
//! run more than once and must only touch the status they are given.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

use crate::cluster::{ClusterClient, ClusterError, NamespacedName};
use crate::crd::{CertSuiteRun, CertSuiteRunStatus, StatusPhase};

// ---------------------------------------------------------------------------
// RetryPolicy
// ---------------------------------------------------------------------------

/// Bounded exponential backoff for conflicting writes.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub steps: u32,
    pub initial_delay: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    /// Random extra delay, as a fraction of the computed delay.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            steps: 5,
            initial_delay: Duration::from_millis(10),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs.max(0.0))
    }

    fn jittered(&self, attempt: u32) -> Duration {
        let base = self.delay_for_attempt(attempt);
        if self.jitter <= 0.0 {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        base.mul_f64(1.0 + extra)
    }
}

// ---------------------------------------------------------------------------
// StatusUpdater
// ---------------------------------------------------------------------------

/// Applies status mutations under optimistic concurrency.
#[derive(Clone)]
pub struct StatusUpdater {
    client: Arc<dyn ClusterClient>,
    policy: RetryPolicy,
}

impl StatusUpdater {
    pub fn new(client: Arc<dyn ClusterClient>, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// Re-read the run, apply `mutate` to its status and write it back,
    /// retrying on conflicts. Returns the stored run on success and the
    /// last error once the attempts are exhausted. Anything other than a
    /// conflict (including a missing run) is returned immediately.
    pub async fn update<F>(&self, key: &NamespacedName, mutate: F) -> Result<CertSuiteRun, ClusterError>
    where
        F: Fn(&mut CertSuiteRunStatus) + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            let mut run = self.client.get_run(key).await?;
            mutate(&mut run.status);

            match self.client.update_run_status(&run).await {
                Ok(stored) => return Ok(stored),
                Err(e) if e.is_conflict() && attempt < self.policy.steps => {
                    let delay = self.policy.jittered(attempt);
                    debug!(run = %key, attempt, delay_ms = delay.as_millis() as u64, "status write conflicted, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_conflict() {
                        warn!(run = %key, attempts = attempt, "giving up on status write after repeated conflicts");
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Set only the phase.
    pub async fn update_phase(&self, key: &NamespacedName, phase: StatusPhase) -> Result<CertSuiteRun, ClusterError> {
        self.update(key, move |status| status.phase = phase).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::crd::CertSuiteRunSpec;

    fn fast_policy(steps: u32) -> RetryPolicy {
        RetryPolicy {
            steps,
            initial_delay: Duration::from_millis(1),
            factor: 2.0,
            max_delay: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    async fn cluster_with_run() -> (Arc<InMemoryCluster>, NamespacedName) {
        let cluster = Arc::new(InMemoryCluster::new());
        let run = cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;
        (cluster, run.key())
    }

    #[test]
    fn test_backoff_shape() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(80));
        // capped
        assert_eq!(policy.delay_for_attempt(30), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let policy = RetryPolicy::default();
        for _ in 0..50 {
            let d = policy.jittered(3);
            assert!(d >= Duration::from_millis(40));
            assert!(d <= Duration::from_millis(45));
        }
    }

    #[tokio::test]
    async fn test_update_writes_phase() {
        let (cluster, key) = cluster_with_run().await;
        let updater = StatusUpdater::new(cluster.clone(), fast_policy(5));

        let stored = updater.update_phase(&key, StatusPhase::Deploying).await.unwrap();
        assert_eq!(stored.status.phase, StatusPhase::Deploying);
        assert_eq!(cluster.run(&key).await.unwrap().status.phase, StatusPhase::Deploying);
    }

    #[tokio::test]
    async fn test_missing_run_is_not_found_without_write() {
        let cluster = Arc::new(InMemoryCluster::new());
        let updater = StatusUpdater::new(cluster.clone(), fast_policy(5));

        let err = updater
            .update_phase(&NamespacedName::new("ops", "ghost"), StatusPhase::Running)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(cluster.status_writes().await, 0);
    }

    #[tokio::test]
    async fn test_conflicts_are_retried_against_fresh_reads() {
        let (cluster, key) = cluster_with_run().await;
        cluster.force_status_conflicts(3).await;
        let updater = StatusUpdater::new(cluster.clone(), fast_policy(5));

        let stored = updater
            .update(&key, |status| {
                status.phase = StatusPhase::Running;
                status.cnf_cert_suite_pod_name = Some("cnf-job-run-1".to_string());
            })
            .await
            .unwrap();

        assert_eq!(stored.status.cnf_cert_suite_pod_name.as_deref(), Some("cnf-job-run-1"));
        assert_eq!(cluster.status_writes().await, 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_conflict() {
        let (cluster, key) = cluster_with_run().await;
        cluster.force_status_conflicts(10).await;
        let updater = StatusUpdater::new(cluster.clone(), fast_policy(3));

        let err = updater.update_phase(&key, StatusPhase::Error).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(cluster.status_writes().await, 0);
        assert_eq!(cluster.run(&key).await.unwrap().status.phase, StatusPhase::Unset);
    }
}
