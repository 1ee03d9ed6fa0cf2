//! # Resumeflow
//!
//! A durable continuation substrate for long-running, tree-structured build
//! pipelines.
//!
//! Steps run in continuation-passing style and can suspend at any point
//! (waiting on a timer, a worker slot, human input or another build) and
//! resume after the hosting process restarts:
//!
//! - **Execution contexts**: typed contextual values with per-type merge rules and exactly-once completion
//! - **Bodies**: nested block invocation with cancellation and completion callbacks
//! - **Execution registry**: the durable list of in-flight executions used for recovery
//! - **Segment gates**: cross-build admission where newer builds supersede older waiters
//! - **Suspend/resume steps**: retry, timeout, condition polling, sleep, input and worker slots
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use resumeflow::prelude::*;
//!
//! let flow = LocalFlow::builder(ExecutionOwner::new("app", 42)).build();
//! let body = body_fn(|ctx| async move { ctx.run_step(sleep(Duration::from_secs(5))).await });
//!
//! // Run the body with up to three attempts.
//! let outcome = flow.launch(Some(body), retry(3)).outcome().await;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod body;
pub mod cancellation;
pub mod config;
pub mod console;
pub mod context;
pub mod errors;
pub mod execution;
pub mod gates;
pub mod host;
pub mod observability;
pub mod registry;
pub mod steps;
pub mod store;
pub mod testing;
pub mod utils;
pub mod workers;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::body::{body_fn, Body, BodyCallback, BodyExecution, BodyInvoker, ForwardOutcome, TailCall};
    pub use crate::config::{PollingConfig, RuntimeConfig};
    pub use crate::console::{ConsoleLog, ConsoleSink};
    pub use crate::context::{
        ContextVariables, Contextual, EnvironmentOverlay, ExecutionOwner, LogFilter, StepContext,
        WorkingDirectory,
    };
    pub use crate::errors::{
        ContextError, FlowError, InterruptCause, LoadError, RunResult, StepError, StepResult,
    };
    pub use crate::execution::{
        ExecutionLoader, FlowExecution, PersistedStep, Rehydrator, StepExecution, UnitOfWork,
    };
    pub use crate::gates::{gate, GateController};
    pub use crate::host::{LocalFlow, LocalFlowLoader, RunListener};
    pub use crate::registry::{resume_all, ExecutionRegistry};
    pub use crate::steps::{catch_error, catch_error_default, input, retry, sleep, timeout, wait_until, PendingInputs};
    pub use crate::store::{DurableStore, FileStore, MemoryStore};
    pub use crate::workers::{worker_slot, LocalWorkerPool, WorkerSlots, WorkerSpec};
    pub use std::time::Duration;
}
