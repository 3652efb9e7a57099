//! Report synthesis: raw per-test results in, counts and a verdict out.

pub mod claim;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;
use tracing::{error, warn};

use crate::crd::{
    CertSuiteReport, CertSuiteRunSpec, CnfPod, CnfResource, CnfTargets, ReportSummary,
    ResultState, TargetResources, TestCaseResult, Verdict,
};
use crate::crd::report::TargetResource;
use self::claim::{Claim, ClaimFile, ClaimResource, RawTestResult};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read claim file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("object listing has {keys} field keys but {values} values")]
    FieldCountMismatch { keys: usize, values: usize },
}

/// Verbosity toggles taken from the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportOptions {
    /// Attach captured output to every case.
    pub show_all_results_logs: bool,
    /// Attach target objects to passed cases too, not only failed ones.
    pub show_compliant_resources_always: bool,
}

impl From<&CertSuiteRunSpec> for ReportOptions {
    fn from(spec: &CertSuiteRunSpec) -> Self {
        Self {
            show_all_results_logs: spec.show_all_results_logs,
            show_compliant_resources_always: spec.show_compliant_resources_always,
        }
    }
}

/// Build the full report for a decoded claim file.
pub fn synthesize(file: &ClaimFile, options: ReportOptions) -> CertSuiteReport {
    let claim = &file.claim;
    let (summary, results) = summarize(&claim.results, options);
    CertSuiteReport {
        verdict: Verdict::from_summary(&summary),
        ocp_version: claim.versions.ocp.clone(),
        cnf_cert_suite_version: claim.versions.cert_suite.clone(),
        cnf_targets: cnf_targets(claim),
        summary,
        results,
    }
}

/// Count results per state and build the per-case entries, sorted by name.
pub fn summarize(
    raw: &BTreeMap<String, RawTestResult>,
    options: ReportOptions,
) -> (ReportSummary, Vec<TestCaseResult>) {
    let mut summary = ReportSummary::default();
    let mut results = Vec::with_capacity(raw.len());

    for (name, tc) in raw {
        let state = match ResultState::parse(&tc.state) {
            Some(state) => state,
            None => {
                warn!(test_case = %name, state = %tc.state, "unrecognized test case state, counting as error");
                ResultState::Error
            }
        };

        let mut result = TestCaseResult {
            test_case_name: name.clone(),
            result: state,
            reason: String::new(),
            logs: String::new(),
            target_resources: None,
        };

        match state {
            ResultState::Passed => summary.passed += 1,
            ResultState::Skipped => {
                summary.skipped += 1;
                result.reason = tc.skip_reason.clone();
            }
            ResultState::Failed => {
                summary.failed += 1;
                result.reason = tc.failure_reason.clone();
                result.logs = tc.captured_test_output.clone();
            }
            ResultState::Error => summary.errored += 1,
        }

        let wants_targets = state == ResultState::Failed
            || (state == ResultState::Passed && options.show_compliant_resources_always);
        if wants_targets {
            result.target_resources = case_targets(name, state, &tc.check_details);
        }
        if options.show_all_results_logs {
            result.logs = tc.captured_test_output.clone();
        }

        summary.total += 1;
        results.push(result);
    }

    (summary, results)
}

fn case_targets(name: &str, state: ResultState, check_details: &str) -> Option<TargetResources> {
    if check_details.trim().is_empty() {
        warn!(test_case = %name, ?state, "test case has empty check details");
        return None;
    }
    match decode_check_details(check_details) {
        Ok(targets) => Some(targets),
        Err(e) => {
            error!(test_case = %name, error = %e, "failed to decode check details");
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Check details
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct CheckDetails {
    #[serde(rename = "CompliantObjectsOut", default)]
    compliant: Vec<ReportObject>,
    #[serde(rename = "NonCompliantObjectsOut", default)]
    non_compliant: Vec<ReportObject>,
}

#[derive(Debug, Default, Deserialize)]
struct ReportObject {
    #[serde(rename = "ObjectFieldsKeys", default)]
    keys: Vec<String>,
    #[serde(rename = "ObjectFieldsValues", default)]
    values: Vec<String>,
}

impl ReportObject {
    fn flatten(self) -> Result<TargetResource, ReportError> {
        if self.keys.len() != self.values.len() {
            return Err(ReportError::FieldCountMismatch {
                keys: self.keys.len(),
                values: self.values.len(),
            });
        }
        Ok(self.keys.into_iter().zip(self.values).collect())
    }
}

/// Decode a case's JSON object listing into flat field maps.
pub fn decode_check_details(check_details: &str) -> Result<TargetResources, ReportError> {
    let details: CheckDetails = serde_json::from_str(check_details)?;
    Ok(TargetResources {
        compliant: details
            .compliant
            .into_iter()
            .map(ReportObject::flatten)
            .collect::<Result<_, _>>()?,
        non_compliant: details
            .non_compliant
            .into_iter()
            .map(ReportObject::flatten)
            .collect::<Result<_, _>>()?,
    })
}

// ---------------------------------------------------------------------------
// Target inventory
// ---------------------------------------------------------------------------

fn resources(items: &[ClaimResource]) -> Vec<CnfResource> {
    items
        .iter()
        .map(|r| CnfResource {
            name: r.metadata.name.clone(),
            namespace: r.metadata.namespace.clone(),
        })
        .collect()
}

/// Inventory of what the suite examined.
pub fn cnf_targets(claim: &Claim) -> CnfTargets {
    let cfg = &claim.configurations;
    CnfTargets {
        namespaces: cfg.namespaces.clone(),
        nodes: claim.nodes.node_summary.keys().cloned().collect(),
        pods: cfg
            .pods
            .iter()
            .map(|p| CnfPod {
                name: p.metadata.name.clone(),
                namespace: p.metadata.namespace.clone(),
                containers: p.spec.containers.iter().map(|c| c.name.clone()).collect(),
            })
            .collect(),
        deployments: resources(&cfg.deployments),
        stateful_sets: resources(&cfg.stateful_sets),
        csvs: cfg
            .csvs
            .iter()
            .map(|m| CnfResource {
                name: m.name.clone(),
                namespace: m.namespace.clone(),
            })
            .collect(),
        crds: cfg.crds.iter().map(|c| c.metadata.name.clone()).collect(),
        services: resources(&cfg.services),
        helm_chart_releases: resources(&cfg.helm_chart_releases),
    }
}
