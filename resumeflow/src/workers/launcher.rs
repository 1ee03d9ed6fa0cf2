//! Processes tagged with a worker cookie, and the lease handed to bodies.

use crate::context::Contextual;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::sync::Arc;
use tracing::{debug, warn};

/// Something that can be killed when its cookie is reclaimed.
pub trait Killable: Send {
    /// Terminates it.
    fn kill(&mut self) -> io::Result<()>;
}

impl Killable for Child {
    fn kill(&mut self) -> io::Result<()> {
        Child::kill(self)?;
        let _ = self.wait();
        Ok(())
    }
}

/// Processes grouped by the cookie they were started under.
#[derive(Default)]
pub struct ProcessTable {
    tagged: Mutex<HashMap<String, Vec<Box<dyn Killable>>>>,
}

impl ProcessTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `process` under `cookie`.
    pub fn tag(&self, cookie: &str, process: Box<dyn Killable>) {
        self.tagged
            .lock()
            .entry(cookie.to_string())
            .or_default()
            .push(process);
    }

    /// Number of processes recorded under `cookie`.
    #[must_use]
    pub fn tagged_count(&self, cookie: &str) -> usize {
        self.tagged.lock().get(cookie).map_or(0, Vec::len)
    }

    /// Kills and forgets everything under `cookie`. Returns how many were killed.
    pub fn kill_tagged(&self, cookie: &str) -> usize {
        let processes = self.tagged.lock().remove(cookie).unwrap_or_default();
        let mut killed = 0;
        for mut process in processes {
            match process.kill() {
                Ok(()) => killed += 1,
                Err(err) => warn!(cookie, error = %err, "Could not kill tagged process"),
            }
        }
        if killed > 0 {
            debug!(cookie, killed, "Killed tagged processes");
        }
        killed
    }
}

impl fmt::Debug for ProcessTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTable")
            .field("cookies", &self.tagged.lock().len())
            .finish()
    }
}

/// Starts processes that carry the current cookie and are killed with it.
#[derive(Clone)]
pub struct ProcessLauncher {
    table: Arc<ProcessTable>,
    cookie: String,
    variable: String,
}

impl ProcessLauncher {
    /// Creates a launcher tagging with `cookie`, exported as `variable`.
    #[must_use]
    pub fn new(table: Arc<ProcessTable>, cookie: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            table,
            cookie: cookie.into(),
            variable: variable.into(),
        }
    }

    /// The cookie new processes are tagged with.
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Spawns `command` with the cookie in its environment. Returns the pid.
    pub fn spawn(&self, mut command: Command) -> io::Result<u32> {
        command.env(&self.variable, &self.cookie);
        let child = command.spawn()?;
        let pid = child.id();
        self.table.tag(&self.cookie, Box::new(child));
        Ok(pid)
    }

    /// Tags something started by other means.
    pub fn adopt(&self, process: Box<dyn Killable>) {
        self.table.tag(&self.cookie, process);
    }
}

impl Contextual for ProcessLauncher {
    fn merge(_original: &Self, subsequent: &Self) -> Self {
        subsequent.clone()
    }
}

impl fmt::Debug for ProcessLauncher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessLauncher")
            .field("cookie", &self.cookie)
            .field("variable", &self.variable)
            .finish_non_exhaustive()
    }
}

/// The worker a body was allocated, visible to everything inside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerLease {
    worker: String,
    cookie: String,
    workspace: PathBuf,
}

impl WorkerLease {
    /// Creates a lease.
    #[must_use]
    pub fn new(worker: impl Into<String>, cookie: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            worker: worker.into(),
            cookie: cookie.into(),
            workspace: workspace.into(),
        }
    }

    /// The worker name.
    #[must_use]
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// The cookie.
    #[must_use]
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// The workspace directory.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}

impl Contextual for WorkerLease {
    fn merge(_original: &Self, subsequent: &Self) -> Self {
        subsequent.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fake(Arc<AtomicUsize>);

    impl Killable for Fake {
        fn kill(&mut self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_kill_only_touches_matching_cookie() {
        let table = Arc::new(ProcessTable::new());
        let kills = Arc::new(AtomicUsize::new(0));
        let ours = ProcessLauncher::new(table.clone(), "aaa", "COOKIE");
        let theirs = ProcessLauncher::new(table.clone(), "bbb", "COOKIE");
        ours.adopt(Box::new(Fake(kills.clone())));
        ours.adopt(Box::new(Fake(kills.clone())));
        theirs.adopt(Box::new(Fake(kills.clone())));

        assert_eq!(table.kill_tagged("aaa"), 2);
        assert_eq!(kills.load(Ordering::SeqCst), 2);
        assert_eq!(table.tagged_count("aaa"), 0);
        assert_eq!(table.tagged_count("bbb"), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_spawned_process_is_killed_by_cookie() {
        let table = Arc::new(ProcessTable::new());
        let launcher = ProcessLauncher::new(table.clone(), "c0ffee", "RESUMEFLOW_SERVER_COOKIE");
        let mut command = Command::new("sleep");
        command.arg("30");
        launcher.spawn(command).unwrap();

        assert_eq!(table.tagged_count("c0ffee"), 1);
        assert_eq!(table.kill_tagged("c0ffee"), 1);
    }

    #[test]
    fn test_innermost_lease_wins() {
        let outer = WorkerLease::new("w1", "a", "/ws/1");
        let inner = WorkerLease::new("w2", "b", "/ws/2");
        assert_eq!(WorkerLease::merge(&outer, &inner), inner);
    }
}
