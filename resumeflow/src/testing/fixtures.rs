//! Flow fixtures.

use crate::console::{CollectingConsoleSink, ConsoleLog};
use crate::context::ExecutionOwner;
use crate::execution::FlowExecution;
use crate::host::{LocalFlow, LocalFlowLoader, RunListener};
use std::sync::Arc;

/// A flow whose console output is collected, registered in its own loader.
#[derive(Debug)]
pub struct FlowFixture {
    /// The flow.
    pub flow: Arc<LocalFlow>,
    /// Everything the flow's steps printed.
    pub console: Arc<CollectingConsoleSink>,
    /// A loader that resolves the flow's owner.
    pub loader: Arc<LocalFlowLoader>,
}

impl FlowFixture {
    /// Creates a fixture for `job#build`.
    #[must_use]
    pub fn new(job: &str, build: u64) -> Self {
        Self::with_listeners(job, build, Vec::new())
    }

    /// Creates a fixture whose flow notifies `listeners` when it finishes.
    #[must_use]
    pub fn with_listeners(job: &str, build: u64, listeners: Vec<Arc<dyn RunListener>>) -> Self {
        let console = Arc::new(CollectingConsoleSink::new());
        let mut builder = LocalFlow::builder(ExecutionOwner::new(job, build))
            .with_context(ConsoleLog::new(console.clone()));
        for listener in listeners {
            builder = builder.with_listener(listener);
        }
        let flow = builder.build();
        let loader = Arc::new(LocalFlowLoader::new());
        loader.insert(flow.clone());
        Self {
            flow,
            console,
            loader,
        }
    }
}

impl FlowFixture {
    /// A fresh flow for the same owner that knows this flow's context
    /// bindings but none of its bodies, as after a process restart.
    #[must_use]
    pub fn restarted(&self) -> Self {
        let flow = LocalFlow::builder(self.flow.owner().clone())
            .with_context(ConsoleLog::new(self.console.clone()))
            .build();
        for (step, binding) in self.flow.state().bindings() {
            flow.state().record_binding(step, binding);
        }
        let loader = Arc::new(LocalFlowLoader::new());
        loader.insert(flow.clone());
        Self {
            flow,
            console: self.console.clone(),
            loader,
        }
    }
}

/// A fixture for `test#1`.
#[must_use]
pub fn flow_fixture() -> FlowFixture {
    FlowFixture::new("test", 1)
}
