//! Top-level executions and the units of work running inside them.
//!
//! A [`FlowExecution`] is owned by the host that interprets the pipeline.
//! This crate only needs three things from it: its owner, whether it has
//! finished, and its [`FlowState`], the live table of contexts, units of
//! work and bodies that rehydrated contexts bind back to.

mod snapshot;
mod state;
mod unit;

pub use snapshot::{PersistedStep, Rehydrator, StepSnapshot, STEP_SNAPSHOT_VERSION};
pub use state::{BlockMarker, ContextBinding, FlowState};
pub use unit::{LifecycleState, StepExecution, UnitOfWork};

use crate::context::ExecutionOwner;
use crate::errors::LoadError;
use std::sync::Arc;

/// One end-to-end run of a pipeline.
pub trait FlowExecution: Send + Sync {
    /// The stable identifier of this execution.
    fn owner(&self) -> &ExecutionOwner;

    /// Returns true once the whole flow has finished.
    fn is_complete(&self) -> bool;

    /// The live state shared by every context of this execution.
    fn state(&self) -> &FlowState;
}

/// Resolves execution owners to live executions.
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionLoader: Send + Sync {
    /// Loads (or looks up) the execution for `owner`.
    fn load(&self, owner: &ExecutionOwner) -> Result<Arc<dyn FlowExecution>, LoadError>;
}
