//! Lifecycle event source.
//!
//! Lists the runs in the controller's namespace on a fixed interval and turns
//! the difference to the previous listing into reconcile calls: one for
//! every identity that appeared and one for every identity that vanished.
//! Changes to a run that stays listed are not events. Each reconcile runs on
//! its own task, tracked by the reconciler, so a slow run never holds up the
//! others and shutdown waits for all of them.
//!
//! Before the first listing the reconciler's pod name counter is seeded from
//! the pods already in the namespace.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ReconcileOutcome, Reconciler};
use crate::cluster::{ClusterClient, NamespacedName};
use crate::crd::CertSuiteRun;

/// Identities to reconcile after comparing a listing against `known`.
///
/// `known` is updated in place. On the initial listing runs that already
/// reached a terminal phase are only recorded, so a restarted controller
/// does not execute them again.
pub fn diff_listing(
    known: &mut HashSet<NamespacedName>,
    listed: &[CertSuiteRun],
    initial: bool,
) -> Vec<NamespacedName> {
    let mut events = Vec::new();
    let current: HashSet<NamespacedName> = listed.iter().map(CertSuiteRun::key).collect();

    for run in listed {
        let key = run.key();
        if known.contains(&key) {
            continue;
        }
        if initial && run.status.phase.is_terminal() {
            debug!(run = %key, phase = %run.status.phase, "skipping run finished before startup");
        } else {
            events.push(key.clone());
        }
        known.insert(key);
    }

    let mut removed: Vec<NamespacedName> = known.difference(&current).cloned().collect();
    removed.sort();
    for key in &removed {
        known.remove(key);
    }
    events.extend(removed);
    events
}

/// Polls the run list and feeds the reconciler.
pub struct RunWatcher {
    client: Arc<dyn ClusterClient>,
    reconciler: Arc<Reconciler>,
    namespace: String,
    interval: Duration,
}

impl RunWatcher {
    pub fn new(client: Arc<dyn ClusterClient>, reconciler: Arc<Reconciler>) -> Self {
        let settings = reconciler.settings();
        Self {
            namespace: settings.namespace.clone(),
            interval: settings.resync_interval,
            client,
            reconciler,
        }
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(namespace = %self.namespace, interval_ms = self.interval.as_millis() as u64, "run watcher started");

        let mut known = HashSet::new();
        let mut initial = true;
        let mut seeded = false;
        let (failed_tx, mut failed_rx) = mpsc::unbounded_channel::<NamespacedName>();
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if !seeded {
                match self.reconciler.seed_pod_counter().await {
                    Ok(_) => seeded = true,
                    Err(e) => {
                        warn!(namespace = %self.namespace, error = %e, "failed to list existing pods, will retry");
                        continue;
                    }
                }
            }

            // forget runs whose reconcile failed so the next listing retries them
            while let Ok(key) = failed_rx.try_recv() {
                known.remove(&key);
            }

            let listed = match self.client.list_runs(&self.namespace).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(namespace = %self.namespace, error = %e, "failed to list runs");
                    continue;
                }
            };

            for key in diff_listing(&mut known, &listed, initial) {
                let reconciler = self.reconciler.clone();
                let failed_tx = failed_tx.clone();
                self.reconciler.tasks().spawn(async move {
                    match reconciler.reconcile(&key).await {
                        Ok(ReconcileOutcome::AlreadyTracked) | Ok(ReconcileOutcome::Absent) => {}
                        Ok(outcome) => debug!(run = %key, ?outcome, "reconciled"),
                        Err(e) => {
                            warn!(run = %key, error = %e, "reconcile failed, will retry");
                            let _ = failed_tx.send(key);
                        }
                    }
                });
            }
            initial = false;
        }

        info!("run watcher stopped");
    }
}
