//! Report embedded in a run's status once the suite's results are harvested.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Overall outcome of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    Pass,
    Skip,
    Fail,
    Error,
}

impl Verdict {
    /// Derive the verdict from a summary.
    ///
    /// Errors dominate failures, which dominate the all-skipped case.
    pub fn from_summary(summary: &ReportSummary) -> Self {
        if summary.errored >= 1 {
            Verdict::Error
        } else if summary.failed >= 1 {
            Verdict::Fail
        } else if summary.skipped == summary.total {
            Verdict::Skip
        } else {
            Verdict::Pass
        }
    }
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Pass => "pass",
            Verdict::Skip => "skip",
            Verdict::Fail => "fail",
            Verdict::Error => "error",
        };
        f.write_str(s)
    }
}

/// State of a single test case as reported by the suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultState {
    Passed,
    Skipped,
    Failed,
    Error,
}

impl ResultState {
    /// Parse the claim file's state string. Unrecognized states yield `None`.
    pub fn parse(state: &str) -> Option<Self> {
        match state {
            "passed" => Some(ResultState::Passed),
            "skipped" => Some(ResultState::Skipped),
            "failed" => Some(ResultState::Failed),
            "error" => Some(ResultState::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportSummary {
    pub total: usize,
    pub passed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub errored: usize,
}

/// One object examined by a test case, flattened to field/value pairs.
pub type TargetResource = BTreeMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetResources {
    #[serde(default)]
    pub compliant: Vec<TargetResource>,
    #[serde(default)]
    pub non_compliant: Vec<TargetResource>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestCaseResult {
    pub test_case_name: String,
    pub result: ResultState,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub logs: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_resources: Option<TargetResources>,
}

// ---------------------------------------------------------------------------
// Target inventory
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CnfPod {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub containers: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CnfResource {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Workload objects the suite was pointed at.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CnfTargets {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pods: Vec<CnfPod>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub deployments: Vec<CnfResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stateful_sets: Vec<CnfResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub csvs: Vec<CnfResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crds: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<CnfResource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub helm_chart_releases: Vec<CnfResource>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertSuiteReport {
    pub verdict: Verdict,
    #[serde(default)]
    pub ocp_version: String,
    #[serde(default)]
    pub cnf_cert_suite_version: String,
    #[serde(default)]
    pub cnf_targets: CnfTargets,
    pub summary: ReportSummary,
    #[serde(default)]
    pub results: Vec<TestCaseResult>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(passed: usize, skipped: usize, failed: usize, errored: usize) -> ReportSummary {
        ReportSummary {
            total: passed + skipped + failed + errored,
            passed,
            skipped,
            failed,
            errored,
        }
    }

    #[test]
    fn test_verdict_precedence() {
        assert_eq!(Verdict::from_summary(&summary(4, 0, 0, 1)), Verdict::Error);
        assert_eq!(Verdict::from_summary(&summary(4, 0, 1, 0)), Verdict::Fail);
        assert_eq!(Verdict::from_summary(&summary(0, 3, 0, 0)), Verdict::Skip);
        assert_eq!(Verdict::from_summary(&summary(5, 0, 0, 0)), Verdict::Pass);
        assert_eq!(Verdict::from_summary(&summary(3, 1, 1, 0)), Verdict::Fail);
        // errors win even when everything else failed
        assert_eq!(Verdict::from_summary(&summary(0, 0, 7, 1)), Verdict::Error);
    }

    #[test]
    fn test_partially_skipped_run_passes() {
        assert_eq!(Verdict::from_summary(&summary(2, 3, 0, 0)), Verdict::Pass);
    }

    #[test]
    fn test_empty_run_counts_as_skipped() {
        // zero tests: skipped == total
        assert_eq!(Verdict::from_summary(&ReportSummary::default()), Verdict::Skip);
    }

    #[test]
    fn test_result_state_parse() {
        assert_eq!(ResultState::parse("passed"), Some(ResultState::Passed));
        assert_eq!(ResultState::parse("error"), Some(ResultState::Error));
        assert_eq!(ResultState::parse("PASSED"), None);
        assert_eq!(ResultState::parse(""), None);
    }

    #[test]
    fn test_report_wire_shape() {
        let report = CertSuiteReport {
            verdict: Verdict::Fail,
            ocp_version: "4.14".to_string(),
            cnf_cert_suite_version: "v5.0.0".to_string(),
            cnf_targets: CnfTargets::default(),
            summary: summary(0, 0, 1, 0),
            results: vec![TestCaseResult {
                test_case_name: "access-control-sys-admin-capability-check".to_string(),
                result: ResultState::Failed,
                reason: "container has SYS_ADMIN".to_string(),
                logs: String::new(),
                target_resources: None,
            }],
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["verdict"], "fail");
        assert_eq!(json["cnfCertSuiteVersion"], "v5.0.0");
        assert_eq!(json["results"][0]["result"], "failed");
        assert_eq!(json["results"][0]["testCaseName"], "access-control-sys-admin-capability-check");
        assert!(json["results"][0].get("logs").is_none());
    }
}
