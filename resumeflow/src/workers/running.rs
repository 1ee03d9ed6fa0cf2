//! The cookie table of running worker-slot bodies.

use crate::context::{ExecutionOwner, StepId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use tracing::debug;

/// What a published cookie belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningTask {
    /// The execution.
    pub owner: ExecutionOwner,
    /// The worker-slot step.
    pub step: StepId,
    /// The worker the body runs on.
    pub worker: String,
}

/// Cookie → running task. One per process.
///
/// A worker thread stays blocked in [`RunningTasks::wait_until_removed`]
/// for as long as its cookie is published.
#[derive(Default)]
pub struct RunningTasks {
    entries: Mutex<HashMap<String, RunningTask>>,
    changed: Condvar,
}

impl RunningTasks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `cookie`.
    pub fn publish(&self, cookie: &str, task: RunningTask) {
        debug!(cookie, worker = %task.worker, "Publishing worker cookie");
        self.entries.lock().insert(cookie.to_string(), task);
        self.changed.notify_all();
    }

    /// Removes `cookie`, releasing the worker thread blocked on it.
    pub fn remove(&self, cookie: &str) -> Option<RunningTask> {
        let removed = self.entries.lock().remove(cookie);
        if removed.is_some() {
            debug!(cookie, "Removed worker cookie");
            self.changed.notify_all();
        }
        removed
    }

    /// Returns true while `cookie` is published.
    #[must_use]
    pub fn contains(&self, cookie: &str) -> bool {
        self.entries.lock().contains_key(cookie)
    }

    /// The task published under `cookie`.
    #[must_use]
    pub fn get(&self, cookie: &str) -> Option<RunningTask> {
        self.entries.lock().get(cookie).cloned()
    }

    /// Number of published cookies.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is published.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Blocks the calling thread until `cookie` is gone.
    pub fn wait_until_removed(&self, cookie: &str) {
        let mut entries = self.entries.lock();
        while entries.contains_key(cookie) {
            self.changed.wait(&mut entries);
        }
    }
}

impl fmt::Debug for RunningTasks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunningTasks").field("cookies", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn task() -> RunningTask {
        RunningTask {
            owner: ExecutionOwner::new("app", 1),
            step: StepId::new(),
            worker: "w1".into(),
        }
    }

    #[test]
    fn test_remove_releases_waiting_thread() {
        let running = Arc::new(RunningTasks::new());
        running.publish("abc", task());

        let waiter = {
            let running = running.clone();
            std::thread::spawn(move || running.wait_until_removed("abc"))
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        assert_eq!(running.remove("abc").map(|t| t.worker), Some("w1".to_string()));
        waiter.join().unwrap();
        assert!(running.is_empty());
    }

    #[test]
    fn test_removing_unknown_cookie_is_a_no_op() {
        let running = RunningTasks::new();
        assert!(running.remove("nope").is_none());
        running.wait_until_removed("nope");
        assert!(running.is_empty());
    }
}
