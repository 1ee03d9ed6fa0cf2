//! Worker allocation.
//!
//! A [`WorkerSlotStep`] queues a [`PlaceholderTask`] on a [`WorkerPool`].
//! When a worker picks it up, the task publishes the slot's cookie in
//! [`RunningTasks`], launches the body with the worker's context, and keeps
//! the worker busy until the cookie is removed by the body's finisher.
//! After a restart, a resumed slot whose body is still running submits a
//! reclaim task at elevated priority so the same worker is held again.

mod launcher;
mod pool;
mod running;
mod step;

pub use launcher::{Killable, ProcessLauncher, ProcessTable, WorkerLease};
pub use pool::{
    LocalWorkerPool, PlaceholderTask, TaskId, WorkerInfo, WorkerPool, WorkerSpec, NORMAL_PRIORITY,
    RECLAIM_PRIORITY,
};
pub use running::{RunningTask, RunningTasks};
pub use step::{worker_slot, WorkerSlotStep, WorkerSlots};
