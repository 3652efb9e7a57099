//! certsuite-operator -- runs the CNF certification suite on request.
//!
//! Watches `CnfCertificationSuiteRun` objects, launches one execution unit
//! per run, follows it to completion and publishes the suite's report in the
//! run's status.

pub mod api;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod harvest;
pub mod job;
pub mod report;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio_util::sync::CancellationToken;

use crate::cluster::objects::Pod;
use crate::cluster::rest::ApiServerClient;
use crate::cluster::ClusterClient;
use crate::config::OperatorConfig;
use crate::controller::tracker::RunTracker;
use crate::controller::watch::RunWatcher;
use crate::controller::{ControllerSettings, Reconciler};
use crate::crd::CertSuiteRun;
use crate::harvest::{HarvestSettings, Harvester};
use crate::job::JobPodBuilder;

/// Start the operator against the configured API server: controller, run
/// watcher and HTTP endpoints.
pub async fn serve(config: OperatorConfig) -> Result<()> {
    if config.controller.sidecar_image.is_empty() {
        bail!(
            "no sidecar image configured: set {} or controller.sidecar_image",
            config::SIDECAR_IMAGE_ENV_VAR
        );
    }
    let client = ApiServerClient::from_config(&config.cluster)
        .context("failed to set up API server client")?;
    serve_with_client(config, Arc::new(client)).await
}

/// Like [`serve`], with an explicit cluster client.
pub async fn serve_with_client(config: OperatorConfig, client: Arc<dyn ClusterClient>) -> Result<()> {
    let tracker = Arc::new(RunTracker::new());
    let reconciler = Arc::new(Reconciler::new(
        client.clone(),
        tracker.clone(),
        ControllerSettings::from(&config.controller),
        config.retry.policy(),
    ));

    let shutdown = CancellationToken::new();
    let watcher = RunWatcher::new(client, reconciler.clone());
    let watcher_handle = tokio::spawn(watcher.run(shutdown.child_token()));

    let state = api::state::AppState::new(tracker);
    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&config.http.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.http.listen_address))?;
    state.set_ready(true);
    tracing::info!(
        addr = %config.http.listen_address,
        namespace = %config.controller.namespace,
        "certsuite-operator listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Err(e) = watcher_handle.await {
        tracing::error!(error = %e, "run watcher task failed");
    }
    reconciler.shutdown().await;
    Ok(())
}

/// Run the harvester side-process inside an execution unit.
pub async fn harvest(config: OperatorConfig) -> Result<()> {
    let settings = HarvestSettings::from_env().context("harvester environment incomplete")?;
    let client = ApiServerClient::from_config(&config.cluster)
        .context("failed to set up API server client")?;
    let harvester = Harvester::new(Arc::new(client), config.retry.policy(), settings);

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));
    let report = harvester.harvest(&cancel).await.context("harvest failed")?;
    tracing::info!(verdict = %report.verdict, "harvest complete");
    Ok(())
}

/// The execution unit that would be created for `run`.
pub fn render_pod(run: &CertSuiteRun, pod_name: &str, config: &OperatorConfig) -> Result<Pod> {
    let pod = JobPodBuilder::for_run(
        run,
        pod_name,
        &config.controller.sidecar_image,
        &config.controller.runner_image,
    )
    .build()?;
    Ok(pod)
}

/// Resolves on Ctrl-C, SIGTERM or when `token` is cancelled elsewhere, and
/// cancels `token` on the way out.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl-C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
        _ = token.cancelled() => {}
    }
    token.cancel();
}
