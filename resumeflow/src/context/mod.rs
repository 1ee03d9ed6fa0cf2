//! Execution contexts.
//!
//! This module provides:
//! - Identifiers for executions, steps and bodies
//! - Typed contextual values with per-type merge rules
//! - The [`StepContext`] every unit of work completes exactly once

#[cfg(test)]
mod context_tests;
mod identity;
mod services;
mod step_context;
mod variables;

pub use identity::{BodyId, ExecutionOwner, StepId};
pub use services::{EnvironmentOverlay, LogFilter, WorkingDirectory};
pub use step_context::{
    Completion, CompletionSink, StepContext, StepContextSnapshot, CONTEXT_SNAPSHOT_VERSION,
};
pub use variables::{ContextOverrides, ContextVariables, Contextual};
