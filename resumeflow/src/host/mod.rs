//! An in-process execution host.
//!
//! [`LocalFlow`] is the smallest host that satisfies [`FlowExecution`](crate::execution::FlowExecution):
//! it hands out root contexts, launches top-level steps and notifies
//! [`RunListener`]s when the flow finishes. Pipeline interpreters embed the
//! same pieces; tests use it directly.

mod flow;
#[cfg(test)]
mod integration_tests;
mod listeners;

pub use flow::{LaunchedStep, LocalFlow, LocalFlowBuilder, LocalFlowLoader};
pub use listeners::{ContextProvider, RunListener, Stash, StashCleanup, StaticContextProvider};

