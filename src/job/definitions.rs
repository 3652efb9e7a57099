//! Names and paths shared by the controller, the execution unit and the
//! harvester.

pub const POD_NAME_PREFIX: &str = "cnf-job-run";
pub const SIDECAR_CONTAINER_NAME: &str = "cnf-certsuite-sidecar";
pub const CERTSUITE_CONTAINER_NAME: &str = "cnf-certsuite";

/// Service account with the cluster access the suite needs.
pub const CLUSTER_ACCESS_SERVICE_ACCOUNT: &str = "cnf-certsuite-cluster-access";

pub const CONFIG_FOLDER: &str = "/cnf-certsuite/config/suite";
pub const PREFLIGHT_CONFIG_FOLDER: &str = "/cnf-certsuite/config/preflight";
pub const RESULTS_FOLDER: &str = "/cnf-certsuite/results";

pub const CONFIG_FILE_PATH: &str = "/cnf-certsuite/config/suite/tnf_config.yaml";
pub const PREFLIGHT_DOCKERCONFIG_PATH: &str =
    "/cnf-certsuite/config/preflight/preflight_dockerconfig.json";

pub const OUTPUT_VOLUME: &str = "cnf-certsuite-output";
pub const CONFIG_VOLUME: &str = "cnf-certsuite-config";
pub const PREFLIGHT_VOLUME: &str = "cnf-certsuite-preflight-dockerconfig";

/// Claim file the suite writes into the results folder.
pub const CLAIM_FILE_NAME: &str = "claim.json";

// Harvester environment.
pub const POD_NAME_ENV_VAR: &str = "MY_POD_NAME";
pub const POD_NAMESPACE_ENV_VAR: &str = "MY_POD_NAMESPACE";
pub const RESULTS_FOLDER_ENV_VAR: &str = "TNF_RESULTS_FOLDER";
pub const RUN_NAME_ENV_VAR: &str = "RUN_CR_NAME";

/// Name of the `n`-th execution unit created by a controller.
pub fn pod_name(n: u64) -> String {
    format!("{POD_NAME_PREFIX}-{n}")
}

/// Counter value encoded in an execution-unit name, if `name` is one.
pub fn pod_index(name: &str) -> Option<u64> {
    name.strip_prefix(POD_NAME_PREFIX)?
        .strip_prefix('-')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_index() {
        assert_eq!(pod_index(&pod_name(7)), Some(7));
        assert_eq!(pod_index("cnf-job-run-12"), Some(12));
        assert_eq!(pod_index("cnf-job-run-"), None);
        assert_eq!(pod_index("cnf-job-run-x"), None);
        assert_eq!(pod_index("cnf-job-runner-1"), None);
        assert_eq!(pod_index("some-other-pod"), None);
    }
}
