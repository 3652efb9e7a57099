//! The `CnfCertificationSuiteRun` custom resource.
//!
//! A run is created by a user or automation and describes one execution of
//! the certification suite. The controller owns its status sub-resource.

pub mod report;

use serde::{Deserialize, Serialize};

use crate::cluster::objects::{ObjectMeta, OwnerReference};
use crate::cluster::NamespacedName;

pub use self::report::{
    CertSuiteReport, CnfPod, CnfResource, CnfTargets, ReportSummary, ResultState,
    TargetResources, TestCaseResult, Verdict,
};

pub const GROUP: &str = "cnf-certifications.redhat.com";
pub const VERSION: &str = "v1alpha1";
pub const KIND: &str = "CnfCertificationSuiteRun";
pub const PLURAL: &str = "cnfcertificationsuiteruns";

/// Full `apiVersion` string of the run resource.
pub fn api_version() -> String {
    format!("{GROUP}/{VERSION}")
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSuiteRun {
    #[serde(default = "api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: CertSuiteRunSpec,
    #[serde(default)]
    pub status: CertSuiteRunStatus,
}

fn default_kind() -> String {
    KIND.to_string()
}

impl CertSuiteRun {
    pub fn new(namespace: &str, name: &str, spec: CertSuiteRunSpec) -> Self {
        Self {
            api_version: api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.to_string(),
                namespace: namespace.to_string(),
                ..ObjectMeta::default()
            },
            spec,
            status: CertSuiteRunStatus::default(),
        }
    }

    pub fn key(&self) -> NamespacedName {
        NamespacedName::new(&self.metadata.namespace, &self.metadata.name)
    }

    /// Back-reference used to tie the execution unit's lifetime to this run.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid.clone(),
        }
    }
}

/// What the requester asked for.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSuiteRunSpec {
    /// Label expression selecting the test cases to run.
    #[serde(default)]
    pub labels_filter: String,
    /// One of info, debug, warn, warning, error.
    #[serde(default)]
    pub log_level: String,
    /// Total run timeout as a duration string, e.g. `2h`.
    #[serde(default)]
    pub timeout: String,
    /// ConfigMap holding the suite's `tnf_config.yaml`.
    #[serde(default)]
    pub config_map_name: String,
    /// Secret holding preflight's dockerconfig, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preflight_secret_name: Option<String>,
    #[serde(default)]
    pub enable_data_collection: bool,
    /// Attach captured logs to every test case, not only failed ones.
    #[serde(default)]
    pub show_all_results_logs: bool,
    /// Attach target objects to passed test cases as well.
    #[serde(default)]
    pub show_compliant_resources_always: bool,
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

/// Coarse lifecycle state of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusPhase {
    /// Not yet touched by the controller.
    #[default]
    #[serde(rename = "")]
    Unset,
    #[serde(rename = "CertSuiteDeploying")]
    Deploying,
    #[serde(rename = "CertSuiteDeployError")]
    DeployError,
    #[serde(rename = "CertSuiteRunning")]
    Running,
    #[serde(rename = "CertSuiteFinished")]
    Finished,
    #[serde(rename = "CertSuiteError")]
    Error,
}

impl StatusPhase {
    /// `true` once the execution unit has run to an end.
    pub fn is_terminal(self) -> bool {
        matches!(self, StatusPhase::Finished | StatusPhase::Error)
    }
}

impl std::fmt::Display for StatusPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusPhase::Unset => "",
            StatusPhase::Deploying => "CertSuiteDeploying",
            StatusPhase::DeployError => "CertSuiteDeployError",
            StatusPhase::Running => "CertSuiteRunning",
            StatusPhase::Finished => "CertSuiteFinished",
            StatusPhase::Error => "CertSuiteError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSuiteRunStatus {
    #[serde(default)]
    pub phase: StatusPhase,
    /// Name of the pod running the suite, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cnf_cert_suite_pod_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<CertSuiteReport>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_decodes_from_manifest_json() {
        let json = r#"{
            "apiVersion": "cnf-certifications.redhat.com/v1alpha1",
            "kind": "CnfCertificationSuiteRun",
            "metadata": {"name": "run-1", "namespace": "cnf-certsuite-operator", "uid": "abc"},
            "spec": {
                "labelsFilter": "observability",
                "logLevel": "info",
                "timeout": "2h",
                "configMapName": "certsuite-config",
                "preflightSecretName": "preflight-dockerconfig",
                "showAllResultsLogs": true
            }
        }"#;

        let run: CertSuiteRun = serde_json::from_str(json).unwrap();
        assert_eq!(run.key(), NamespacedName::new("cnf-certsuite-operator", "run-1"));
        assert_eq!(run.spec.timeout, "2h");
        assert_eq!(run.spec.preflight_secret_name.as_deref(), Some("preflight-dockerconfig"));
        assert!(run.spec.show_all_results_logs);
        assert!(!run.spec.show_compliant_resources_always);
        assert_eq!(run.status.phase, StatusPhase::Unset);

        let owner = run.owner_reference();
        assert_eq!(owner.kind, KIND);
        assert_eq!(owner.uid, "abc");
    }

    #[test]
    fn test_phase_wire_names() {
        let status = CertSuiteRunStatus {
            phase: StatusPhase::DeployError,
            cnf_cert_suite_pod_name: Some("cnf-job-run-1".to_string()),
            report: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["phase"], "CertSuiteDeployError");
        assert_eq!(json["cnfCertSuitePodName"], "cnf-job-run-1");
        assert!(json.get("report").is_none());

        let back: CertSuiteRunStatus = serde_json::from_value(json).unwrap();
        assert_eq!(back, status);
    }

    #[test]
    fn test_terminal_phases() {
        assert!(StatusPhase::Finished.is_terminal());
        assert!(StatusPhase::Error.is_terminal());
        assert!(!StatusPhase::Running.is_terminal());
        assert!(!StatusPhase::DeployError.is_terminal());
    }
}
