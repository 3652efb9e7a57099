//! Smoke tests -- verify the binary runs and its subcommands are wired.

use assert_cmd::Command;
use predicates::prelude::*;

fn operator() -> Command {
    let mut cmd = Command::cargo_bin("certsuite-operator").unwrap();
    cmd.env_remove("CERTSUITE_OPERATOR_CONFIG")
        .env_remove("SIDECAR_APP_IMG")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_cli_help() {
    operator()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("CNF certification suite"));
}

#[test]
fn test_cli_version() {
    operator()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("certsuite-operator"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["serve", "harvest", "render-pod"] {
        operator().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_render_pod_from_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = dir.path().join("run.json");
    std::fs::write(
        &manifest,
        r#"{
            "apiVersion": "cnf-certifications.redhat.com/v1alpha1",
            "kind": "CnfCertificationSuiteRun",
            "metadata": {"name": "run-1", "namespace": "cnf-certsuite-operator"},
            "spec": {"labelsFilter": "networking", "logLevel": "info", "timeout": "1h",
                     "configMapName": "certsuite-config"}
        }"#,
    )
    .unwrap();

    operator()
        .env("SIDECAR_APP_IMG", "quay.io/example/sidecar:v1")
        .args(["render-pod", "--run"])
        .arg(&manifest)
        .args(["--pod-name", "cnf-job-run-9"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"cnf-job-run-9\""))
        .stdout(predicate::str::contains("quay.io/example/sidecar:v1"))
        .stdout(predicate::str::contains("RUN_CR_NAME"))
        .stdout(predicate::str::contains("networking"));
}

#[test]
fn test_render_pod_missing_manifest_fails() {
    operator()
        .args(["render-pod", "--run", "/nonexistent/run.json"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read run manifest"));
}

#[test]
fn test_harvest_without_environment_fails() {
    operator()
        .env_remove("TNF_RESULTS_FOLDER")
        .env_remove("RUN_CR_NAME")
        .env_remove("MY_POD_NAMESPACE")
        .arg("harvest")
        .assert()
        .failure()
        .stderr(predicate::str::contains("harvester environment incomplete"));
}

#[test]
fn test_serve_requires_sidecar_image() {
    let dir = tempfile::tempdir().unwrap();
    let config = dir.path().join("operator.toml");
    std::fs::write(&config, "[http]\nlisten_address = \"127.0.0.1:0\"\n").unwrap();

    operator()
        .arg("--config")
        .arg(&config)
        .arg("serve")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no sidecar image configured"));
}
