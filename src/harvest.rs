//! Harvester side-process.
//!
//! Runs next to the suite inside the execution unit. Waits for the claim
//! file to show up in the shared results folder, turns it into a report and
//! stores the report in the owning run's status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cluster::{ClusterClient, ClusterError, NamespacedName};
use crate::controller::status::{RetryPolicy, StatusUpdater};
use crate::crd::CertSuiteReport;
use crate::job::definitions as defs;
use crate::report::claim::ClaimFile;
use crate::report::{self, ReportError, ReportOptions};

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error("environment variable {0} is not set")]
    MissingEnv(&'static str),

    #[error(transparent)]
    Report(#[from] ReportError),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("harvest cancelled before the claim file appeared")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct HarvestSettings {
    pub results_dir: PathBuf,
    /// The run the report belongs to.
    pub run: NamespacedName,
    pub poll_interval: Duration,
    /// Extra wait after the claim file appears, so the suite can finish
    /// writing it.
    pub settle_delay: Duration,
}

impl HarvestSettings {
    pub fn from_env() -> Result<Self, HarvestError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build settings from an environment lookup function.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, HarvestError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let require = |name: &'static str| {
            lookup(name)
                .filter(|v| !v.is_empty())
                .ok_or(HarvestError::MissingEnv(name))
        };
        Ok(Self {
            results_dir: PathBuf::from(require(defs::RESULTS_FOLDER_ENV_VAR)?),
            run: NamespacedName::new(
                require(defs::POD_NAMESPACE_ENV_VAR)?,
                require(defs::RUN_NAME_ENV_VAR)?,
            ),
            poll_interval: Duration::from_secs(5),
            settle_delay: Duration::from_secs(5),
        })
    }

    pub fn claim_path(&self) -> PathBuf {
        self.results_dir.join(defs::CLAIM_FILE_NAME)
    }
}

pub struct Harvester {
    client: Arc<dyn ClusterClient>,
    status: StatusUpdater,
    settings: HarvestSettings,
}

impl Harvester {
    pub fn new(client: Arc<dyn ClusterClient>, retry: RetryPolicy, settings: HarvestSettings) -> Self {
        Self {
            status: StatusUpdater::new(client.clone(), retry),
            client,
            settings,
        }
    }

    /// Poll until the claim file exists.
    pub async fn wait_for_claim(&self, cancel: &CancellationToken) -> Result<PathBuf, HarvestError> {
        let path = self.settings.claim_path();
        info!(path = %path.display(), "waiting for claim file");
        loop {
            if tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return Ok(path);
            }
            warn!(
                path = %path.display(),
                retry_secs = self.settings.poll_interval.as_secs_f64(),
                "claim file not found yet"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(HarvestError::Cancelled),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
    }

    /// Wait for the claim, synthesize the report and store it on the run.
    pub async fn harvest(&self, cancel: &CancellationToken) -> Result<CertSuiteReport, HarvestError> {
        let path = self.wait_for_claim(cancel).await?;
        tokio::time::sleep(self.settings.settle_delay).await;

        info!(path = %path.display(), "claim file found");
        let claim = ClaimFile::from_path(&path).await?;

        let key = &self.settings.run;
        let run = self.client.get_run(key).await?;
        let report = report::synthesize(&claim, ReportOptions::from(&run.spec));
        info!(
            run = %key,
            verdict = %report.verdict,
            total = report.summary.total,
            failed = report.summary.failed,
            errored = report.summary.errored,
            "report synthesized"
        );

        self.status
            .update(key, |status| status.report = Some(report.clone()))
            .await?;
        info!(run = %key, "report stored in run status");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::memory::InMemoryCluster;
    use crate::crd::{CertSuiteRun, CertSuiteRunSpec, StatusPhase, Verdict};
    use std::collections::HashMap;

    const CLAIM: &str = r#"{
        "claim": {
            "versions": {"ocp": "4.14.1", "certSuite": "v5.0.2"},
            "results": {
                "a": {"state": "passed"},
                "b": {"state": "skipped", "skipReason": "no operators"}
            }
        }
    }"#;

    fn settings(dir: &std::path::Path) -> HarvestSettings {
        HarvestSettings {
            results_dir: dir.to_path_buf(),
            run: NamespacedName::new("ops", "run-1"),
            poll_interval: Duration::from_millis(5),
            settle_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_settings_from_lookup() {
        let env: HashMap<&str, &str> = [
            ("TNF_RESULTS_FOLDER", "/cnf-certsuite/results"),
            ("MY_POD_NAMESPACE", "ops"),
            ("RUN_CR_NAME", "run-1"),
        ]
        .into_iter()
        .collect();

        let settings = HarvestSettings::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.claim_path(), PathBuf::from("/cnf-certsuite/results/claim.json"));
        assert_eq!(settings.run, NamespacedName::new("ops", "run-1"));

        let err = HarvestSettings::from_lookup(|k| {
            (k != "RUN_CR_NAME").then(|| "x".to_string())
        })
        .unwrap_err();
        assert!(matches!(err, HarvestError::MissingEnv("RUN_CR_NAME")));
    }

    #[tokio::test]
    async fn test_harvest_stores_report() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let mut run = CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default());
        run.status.phase = StatusPhase::Running;
        cluster.apply_run(run).await;

        let harvester = Harvester::new(cluster.clone(), RetryPolicy::default(), settings(dir.path()));
        let claim_path = dir.path().join("claim.json");
        let partial_path = dir.path().join("claim.json.part");
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            tokio::fs::write(&partial_path, CLAIM).await.unwrap();
            tokio::fs::rename(&partial_path, &claim_path).await.unwrap();
        });

        let report = harvester.harvest(&CancellationToken::new()).await.unwrap();
        writer.await.unwrap();

        assert_eq!(report.summary.total, 2);
        assert_eq!(report.verdict, Verdict::Pass);

        let stored = cluster.run(&NamespacedName::new("ops", "run-1")).await.unwrap();
        assert_eq!(stored.status.phase, StatusPhase::Running);
        let stored_report = stored.status.report.unwrap();
        assert_eq!(stored_report.cnf_cert_suite_version, "v5.0.2");
        assert_eq!(stored_report.results[1].reason, "no operators");
    }

    #[tokio::test]
    async fn test_corrupt_claim_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("claim.json"), "{ truncated").unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        cluster
            .apply_run(CertSuiteRun::new("ops", "run-1", CertSuiteRunSpec::default()))
            .await;

        let harvester = Harvester::new(cluster.clone(), RetryPolicy::default(), settings(dir.path()));
        let err = harvester.harvest(&CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, HarvestError::Report(ReportError::Decode(_))));
        assert_eq!(cluster.status_writes().await, 0);
    }

    #[tokio::test]
    async fn test_wait_can_be_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(InMemoryCluster::new());
        let harvester = Harvester::new(cluster, RetryPolicy::default(), settings(dir.path()));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = harvester.wait_for_claim(&cancel).await.unwrap_err();
        assert!(matches!(err, HarvestError::Cancelled));
    }
}
