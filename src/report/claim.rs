//! The suite's claim file.
//!
//! Only the parts the report needs are modelled; everything else in the
//! document is ignored on decode.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;

use super::ReportError;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClaimFile {
    pub claim: Claim,
}

impl ClaimFile {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, ReportError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub async fn from_path(path: &Path) -> Result<Self, ReportError> {
        let bytes = tokio::fs::read(path).await.map_err(|source| ReportError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_slice(&bytes)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Claim {
    /// Test case id to its result.
    pub results: BTreeMap<String, RawTestResult>,
    pub versions: Versions,
    pub configurations: Configurations,
    pub nodes: Nodes,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawTestResult {
    pub state: String,
    pub captured_test_output: String,
    pub skip_reason: String,
    pub failure_reason: String,
    /// JSON-encoded compliant/non-compliant object listing.
    pub check_details: String,
    pub start_time: String,
    pub end_time: String,
    pub duration: i64,
    #[serde(rename = "testID")]
    pub test_id: TestId,
    pub category_classification: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TestId {
    pub id: String,
    pub suite: String,
    pub tags: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Versions {
    pub claim_format: String,
    pub ocp: String,
    pub k8s: String,
    #[serde(alias = "tnf")]
    pub cert_suite: String,
}

/// Snapshot of what the suite was pointed at.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configurations {
    #[serde(alias = "testNamespaces")]
    pub namespaces: Vec<String>,
    pub pods: Vec<ClaimPod>,
    pub deployments: Vec<ClaimResource>,
    pub stateful_sets: Vec<ClaimResource>,
    pub csvs: Vec<ClaimMetadata>,
    pub crds: Vec<ClaimResource>,
    pub services: Vec<ClaimResource>,
    pub helm_chart_releases: Vec<ClaimResource>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaimMetadata {
    pub name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaimResource {
    pub metadata: ClaimMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaimPod {
    pub metadata: ClaimMetadata,
    pub spec: ClaimPodSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaimPodSpec {
    pub containers: Vec<ClaimContainer>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ClaimContainer {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Nodes {
    /// Node name to an opaque summary.
    pub node_summary: BTreeMap<String, serde_json::Value>,
}
