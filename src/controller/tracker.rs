//! In-flight run bookkeeping.
//!
//! The tracker is the single source of truth for "does this run already have
//! an execution unit". A run is claimed before anything is built or
//! submitted; the claim is only made permanent once the pod exists, and is
//! released automatically on every other path.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::cluster::NamespacedName;

/// Where a tracked run currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    /// Claimed; the execution unit is being built or submitted.
    Deploying,
    /// The execution unit exists and is being monitored.
    Running,
    /// Monitoring ended. The entry stays until the run is deleted.
    Completed,
}

#[derive(Debug)]
struct TrackedRun {
    reservation: u64,
    pod_name: Option<String>,
    cancel: Option<CancellationToken>,
    state: RunState,
}

/// Read-only view of one entry, as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackedRunView {
    pub namespace: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    pub state: RunState,
}

/// What is left of an entry once it is removed.
#[derive(Debug)]
pub struct ReleasedRun {
    pub pod_name: Option<String>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Default)]
struct Inner {
    runs: HashMap<NamespacedName, TrackedRun>,
    next_reservation: u64,
}

/// Run identity to execution-unit name, scoped to one controller.
#[derive(Default)]
pub struct RunTracker {
    inner: Mutex<Inner>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reserve `key`. Returns `None` if the run is already tracked.
    ///
    /// The reservation is dropped again unless [`RunClaim::commit`] is called.
    pub fn claim(&self, key: &NamespacedName) -> Option<RunClaim<'_>> {
        let mut inner = self.lock();
        if inner.runs.contains_key(key) {
            return None;
        }
        inner.next_reservation += 1;
        let reservation = inner.next_reservation;
        inner.runs.insert(
            key.clone(),
            TrackedRun {
                reservation,
                pod_name: None,
                cancel: None,
                state: RunState::Deploying,
            },
        );
        Some(RunClaim {
            tracker: self,
            key: key.clone(),
            reservation,
            committed: false,
        })
    }

    pub fn contains(&self, key: &NamespacedName) -> bool {
        self.lock().runs.contains_key(key)
    }

    pub fn pod_name(&self, key: &NamespacedName) -> Option<String> {
        self.lock().runs.get(key).and_then(|r| r.pod_name.clone())
    }

    pub fn state(&self, key: &NamespacedName) -> Option<RunState> {
        self.lock().runs.get(key).map(|r| r.state)
    }

    /// Mark monitoring of `key` as over. Unknown keys are ignored.
    pub fn complete(&self, key: &NamespacedName) {
        if let Some(run) = self.lock().runs.get_mut(key) {
            run.state = RunState::Completed;
        }
    }

    /// Drop the entry for `key`, handing back what the caller must clean up.
    pub fn remove(&self, key: &NamespacedName) -> Option<ReleasedRun> {
        self.lock().runs.remove(key).map(|r| ReleasedRun {
            pod_name: r.pod_name,
            cancel: r.cancel,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All entries, sorted by identity.
    pub fn snapshot(&self) -> Vec<TrackedRunView> {
        let inner = self.lock();
        let mut views: Vec<TrackedRunView> = inner
            .runs
            .iter()
            .map(|(key, run)| TrackedRunView {
                namespace: key.namespace.clone(),
                name: key.name.clone(),
                pod_name: run.pod_name.clone(),
                state: run.state,
            })
            .collect();
        views.sort_by(|a, b| (&a.namespace, &a.name).cmp(&(&b.namespace, &b.name)));
        views
    }
}

// ---------------------------------------------------------------------------
// RunClaim
// ---------------------------------------------------------------------------

/// A pending reservation. Dropping it without committing releases the run.
pub struct RunClaim<'a> {
    tracker: &'a RunTracker,
    key: NamespacedName,
    reservation: u64,
    committed: bool,
}

impl RunClaim<'_> {
    /// Make the reservation permanent: the run now has `pod_name`, monitored
    /// under `cancel`. Returns `false` if the run was removed while the claim
    /// was pending.
    pub fn commit(mut self, pod_name: &str, cancel: CancellationToken) -> bool {
        self.committed = true;
        let mut inner = self.tracker.lock();
        match inner.runs.get_mut(&self.key) {
            Some(run) if run.reservation == self.reservation => {
                run.pod_name = Some(pod_name.to_string());
                run.cancel = Some(cancel);
                run.state = RunState::Running;
                true
            }
            _ => false,
        }
    }
}

impl Drop for RunClaim<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut inner = self.tracker.lock();
        // only our own reservation; a deletion may have replaced it
        if inner
            .runs
            .get(&self.key)
            .is_some_and(|r| r.reservation == self.reservation)
        {
            inner.runs.remove(&self.key);
        }
    }
}
