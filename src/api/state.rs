use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::controller::tracker::RunTracker;

#[derive(Clone)]
pub struct AppState {
    pub tracker: Arc<RunTracker>,
    ready: Arc<AtomicBool>,
}

impl AppState {
    pub fn new(tracker: Arc<RunTracker>) -> Self {
        Self {
            tracker,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip readiness, e.g. once the watcher is running.
    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
