//! Workers, the priority queue that feeds them, and the pool seam.

use super::launcher::ProcessTable;
use crate::config::RuntimeConfig;
use crate::errors::FlowError;
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, BinaryHeap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Priority of an ordinary slot request.
pub const NORMAL_PRIORITY: i32 = 0;

/// Priority of a request reclaiming a worker after a restart.
pub const RECLAIM_PRIORITY: i32 = 100;

/// Identifies a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// Declares a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    name: String,
    labels: BTreeSet<String>,
    workspace: PathBuf,
}

impl WorkerSpec {
    /// A worker called `name` using `workspace` as its working area.
    #[must_use]
    pub fn new(name: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeSet::new(),
            workspace: workspace.into(),
        }
    }

    /// Adds a label.
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.labels.insert(label.into());
        self
    }
}

/// What a task learns about the worker running it.
#[derive(Debug, Clone)]
pub struct WorkerInfo {
    spec: WorkerSpec,
    processes: Arc<ProcessTable>,
}

impl WorkerInfo {
    /// The worker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.spec.name
    }

    /// The worker labels.
    #[must_use]
    pub fn labels(&self) -> &BTreeSet<String> {
        &self.spec.labels
    }

    /// The workspace directory.
    #[must_use]
    pub fn workspace(&self) -> &Path {
        &self.spec.workspace
    }

    /// Processes started on this worker.
    #[must_use]
    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    /// Returns true if a task asking for `label` may run here.
    ///
    /// A worker's own name counts as one of its labels.
    #[must_use]
    pub fn matches(&self, label: Option<&str>) -> bool {
        match label {
            None => true,
            Some(label) => self.spec.name == label || self.spec.labels.contains(label),
        }
    }
}

/// A queued request for a worker.
pub trait PlaceholderTask: Send + Sync {
    /// The label a worker must carry, if any.
    fn label(&self) -> Option<&str>;

    /// The cookie of the slot this task serves.
    fn cookie(&self) -> &str;

    /// Runs on the worker's thread. The worker stays busy until this returns.
    fn run(&self, worker: &WorkerInfo);
}

/// Allocates workers to placeholder tasks.
pub trait WorkerPool: Send + Sync {
    /// Queues `task`. Higher priorities run first, then older requests.
    fn submit(&self, task: Arc<dyn PlaceholderTask>, priority: i32) -> TaskId;

    /// Removes a task that has not been picked up yet. Returns true if it was still queued.
    fn cancel(&self, id: TaskId) -> bool;

    /// Kills every process tagged with `cookie`. Returns how many were killed.
    fn kill_by_tag(&self, cookie: &str) -> usize;
}

struct Queued {
    id: TaskId,
    priority: i32,
    seq: u64,
    task: Arc<dyn PlaceholderTask>,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher priority first, then the older request.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PoolShared {
    queue: Mutex<BinaryHeap<Queued>>,
    available: Condvar,
    shutdown: AtomicBool,
    next_seq: AtomicU64,
}

impl PoolShared {
    /// Takes the best queued task this worker can run.
    fn take_for(queue: &mut BinaryHeap<Queued>, worker: &WorkerInfo) -> Option<Queued> {
        let best = queue
            .iter()
            .filter(|queued| worker.matches(queued.task.label()))
            .max()
            .map(|queued| queued.id)?;
        let mut items = std::mem::take(queue).into_vec();
        let position = items.iter().position(|queued| queued.id == best)?;
        let taken = items.swap_remove(position);
        *queue = BinaryHeap::from(items);
        Some(taken)
    }
}

/// A pool of in-process workers, each with a dedicated OS thread.
pub struct LocalWorkerPool {
    shared: Arc<PoolShared>,
    processes: Arc<ProcessTable>,
    workers: Vec<WorkerInfo>,
}

impl LocalWorkerPool {
    /// Starts one thread per worker, named `{thread_prefix}-{worker}`.
    pub fn start(specs: Vec<WorkerSpec>, thread_prefix: &str) -> Result<Self, FlowError> {
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(BinaryHeap::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
            next_seq: AtomicU64::new(0),
        });
        let processes = Arc::new(ProcessTable::new());
        let workers: Vec<WorkerInfo> = specs
            .into_iter()
            .map(|spec| WorkerInfo {
                spec,
                processes: processes.clone(),
            })
            .collect();

        for worker in &workers {
            let shared = shared.clone();
            let info = worker.clone();
            thread::Builder::new()
                .name(format!("{thread_prefix}-{}", worker.name()))
                .spawn(move || worker_loop(&shared, &info))?;
        }
        info!(workers = workers.len(), "Started worker pool");

        Ok(Self {
            shared,
            processes,
            workers,
        })
    }

    /// Starts the pool with the configured thread name prefix.
    pub fn from_config(specs: Vec<WorkerSpec>, config: &RuntimeConfig) -> Result<Self, FlowError> {
        Self::start(specs, &config.worker_thread_prefix)
    }

    /// The workers of this pool.
    #[must_use]
    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }

    /// The process table shared by every worker.
    #[must_use]
    pub fn processes(&self) -> &Arc<ProcessTable> {
        &self.processes
    }

    /// Number of tasks waiting for a worker.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Stops idle workers. Workers busy with a task exit once it returns.
    pub fn shutdown(&self) {
        if !self.shared.shutdown.swap(true, AtomicOrdering::SeqCst) {
            debug!("Shutting down worker pool");
            let _queue = self.shared.queue.lock();
            self.shared.available.notify_all();
        }
    }
}

fn worker_loop(shared: &PoolShared, worker: &WorkerInfo) {
    loop {
        let queued = {
            let mut queue = shared.queue.lock();
            loop {
                if shared.shutdown.load(AtomicOrdering::SeqCst) {
                    debug!(worker = worker.name(), "Worker exiting");
                    return;
                }
                if let Some(queued) = PoolShared::take_for(&mut queue, worker) {
                    break queued;
                }
                shared.available.wait(&mut queue);
            }
        };

        debug!(
            worker = worker.name(),
            task = %queued.id,
            priority = queued.priority,
            cookie = queued.task.cookie(),
            "Running placeholder task"
        );
        let task = queued.task;
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| task.run(worker))) {
            warn!(worker = worker.name(), "Placeholder task panicked: {:?}", e);
        }
    }
}

impl WorkerPool for LocalWorkerPool {
    fn submit(&self, task: Arc<dyn PlaceholderTask>, priority: i32) -> TaskId {
        let seq = self.shared.next_seq.fetch_add(1, AtomicOrdering::SeqCst);
        let id = TaskId(seq);
        debug!(task = %id, priority, label = ?task.label(), "Queueing placeholder task");
        self.shared.queue.lock().push(Queued {
            id,
            priority,
            seq,
            task,
        });
        // Workers filter by label, so any of them may be the one to wake.
        self.shared.available.notify_all();
        id
    }

    fn cancel(&self, id: TaskId) -> bool {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|queued| queued.id != id);
        let removed = queue.len() != before;
        if removed {
            debug!(task = %id, "Cancelled queued placeholder task");
        }
        removed
    }

    fn kill_by_tag(&self, cookie: &str) -> usize {
        self.processes.kill_tagged(cookie)
    }
}

impl Drop for LocalWorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for LocalWorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalWorkerPool")
            .field("workers", &self.workers.len())
            .field("queued", &self.queued())
            .finish_non_exhaustive()
    }
}
