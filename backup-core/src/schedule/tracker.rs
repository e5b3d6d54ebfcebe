//! In-flight schedule runs.

use dashmap::DashSet;
use std::sync::Arc;

/// Tracks which schedules are currently running so a second fire of the
/// same id is rejected instead of racing the first one.
#[derive(Clone, Default)]
pub struct RunTracker {
    running: Arc<DashSet<String>>,
}

impl RunTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `id` as running. Returns `None` if it already is.
    pub fn try_start(&self, id: &str) -> Option<RunGuard> {
        if self.running.insert(id.to_string()) {
            Some(RunGuard {
                running: self.running.clone(),
                id: id.to_string(),
            })
        } else {
            None
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.running.contains(id)
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }
}

/// Clears the running mark when dropped, including on panic unwind.
pub struct RunGuard {
    running: Arc<DashSet<String>>,
    id: String,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}
