//! The local flow host.

use super::{ContextProvider, RunListener};
use crate::body::Body;
use crate::context::{
    Completion, CompletionSink, ContextOverrides, ContextVariables, Contextual, ExecutionOwner,
    StepContext, StepId,
};
use crate::errors::{LoadError, RunResult, StepError, StepResult};
use crate::execution::{ContextBinding, ExecutionLoader, FlowExecution, FlowState, StepExecution, UnitOfWork};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info};

/// A flow hosted in this process.
pub struct LocalFlow {
    owner: ExecutionOwner,
    state: FlowState,
    root: ContextVariables,
    complete: AtomicBool,
    listeners: Vec<Arc<dyn RunListener>>,
}

/// Builder for [`LocalFlow`].
pub struct LocalFlowBuilder {
    owner: ExecutionOwner,
    overrides: ContextOverrides,
    provider: Option<Arc<dyn ContextProvider>>,
    listeners: Vec<Arc<dyn RunListener>>,
}

impl LocalFlowBuilder {
    /// Adds a root contextual value.
    #[must_use]
    pub fn with_context<T: Contextual>(mut self, value: T) -> Self {
        self.overrides.add(value);
        self
    }

    /// Takes root values from a provider. Values added with
    /// [`LocalFlowBuilder::with_context`] are layered on top.
    #[must_use]
    pub fn with_provider(mut self, provider: Arc<dyn ContextProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Adds a completion listener.
    #[must_use]
    pub fn with_listener(mut self, listener: Arc<dyn RunListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    /// Builds the flow.
    #[must_use]
    pub fn build(self) -> Arc<LocalFlow> {
        let base = match &self.provider {
            Some(provider) => provider.provide(&self.owner),
            None => ContextVariables::new(),
        };
        let root = base.overlay(&self.overrides);
        Arc::new(LocalFlow {
            owner: self.owner,
            state: FlowState::new(),
            root,
            complete: AtomicBool::new(false),
            listeners: self.listeners,
        })
    }
}

struct HostSink {
    flow: Weak<LocalFlow>,
    sender: Mutex<Option<oneshot::Sender<StepResult>>>,
}

impl CompletionSink for HostSink {
    fn deliver(&self, step: StepId, result: StepResult) {
        if let (Err(cause), Some(flow)) = (&result, self.flow.upgrade()) {
            flow.state.set_result(cause.result());
        }
        match self.sender.lock().take() {
            Some(sender) => {
                let _ = sender.send(result);
            }
            None => debug!(step = %step, "Top-level outcome already taken"),
        }
    }
}

impl LocalFlow {
    /// Starts building a flow.
    #[must_use]
    pub fn builder(owner: ExecutionOwner) -> LocalFlowBuilder {
        LocalFlowBuilder {
            owner,
            overrides: ContextOverrides::new(),
            provider: None,
            listeners: Vec::new(),
        }
    }

    /// The root variables every top-level step sees.
    #[must_use]
    pub fn root(&self) -> &ContextVariables {
        &self.root
    }

    /// Launches a top-level step.
    pub fn launch<F>(self: &Arc<Self>, body: Option<Arc<dyn Body>>, factory: F) -> LaunchedStep
    where
        F: FnOnce(StepContext) -> Arc<dyn StepExecution>,
    {
        let (sender, outcome) = oneshot::channel();
        let step = StepId::new();
        let sink = Arc::new(HostSink {
            flow: Arc::downgrade(self),
            sender: Mutex::new(Some(sender)),
        });
        let mut binding = ContextBinding::new(self.root.clone(), Completion::new(step, sink));
        if let Some(body) = body {
            binding = binding.with_body(body);
        }
        let execution: Arc<dyn FlowExecution> = self.clone();
        let ctx = StepContext::new(execution, step, binding);
        let unit = UnitOfWork::new(factory(ctx));
        self.state.adopt(unit.clone());
        unit.start();
        LaunchedStep { unit, outcome }
    }

    /// Marks the flow finished and notifies listeners. Idempotent.
    pub fn finish(&self) -> RunResult {
        let result = self.state.result();
        if self.complete.swap(true, Ordering::SeqCst) {
            return result;
        }
        info!(owner = %self.owner, result = %result, "Flow finished");
        for listener in &self.listeners {
            listener.on_completed(&self.owner, result);
        }
        self.state.clear();
        result
    }

    /// The current result.
    #[must_use]
    pub fn result(&self) -> RunResult {
        self.state.result()
    }
}

impl FlowExecution for LocalFlow {
    fn owner(&self) -> &ExecutionOwner {
        &self.owner
    }

    fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    fn state(&self) -> &FlowState {
        &self.state
    }
}

impl fmt::Debug for LocalFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFlow")
            .field("owner", &self.owner)
            .field("complete", &self.is_complete())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

/// A top-level step launched by [`LocalFlow::launch`].
pub struct LaunchedStep {
    unit: Arc<UnitOfWork>,
    outcome: oneshot::Receiver<StepResult>,
}

impl LaunchedStep {
    /// The unit of work.
    #[must_use]
    pub fn unit(&self) -> &Arc<UnitOfWork> {
        &self.unit
    }

    /// The step's context.
    #[must_use]
    pub fn context(&self) -> &StepContext {
        self.unit.context()
    }

    /// Returns the outcome if it already arrived.
    pub fn try_outcome(&mut self) -> Option<StepResult> {
        self.outcome.try_recv().ok()
    }

    /// Waits for the outcome.
    pub async fn outcome(self) -> StepResult {
        self.outcome
            .await
            .unwrap_or_else(|_| Err(StepError::failed("step was dropped before completing")))
    }
}

impl fmt::Debug for LaunchedStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchedStep").field("unit", &self.unit).finish()
    }
}

/// Resolves owners to flows hosted in this process.
#[derive(Default)]
pub struct LocalFlowLoader {
    flows: RwLock<HashMap<ExecutionOwner, Arc<LocalFlow>>>,
}

impl LocalFlowLoader {
    /// Creates an empty loader.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes a flow resolvable.
    pub fn insert(&self, flow: Arc<LocalFlow>) {
        self.flows.write().insert(flow.owner.clone(), flow);
    }

    /// Forgets a flow.
    pub fn remove(&self, owner: &ExecutionOwner) -> Option<Arc<LocalFlow>> {
        self.flows.write().remove(owner)
    }

    /// Looks up a hosted flow.
    #[must_use]
    pub fn flow(&self, owner: &ExecutionOwner) -> Option<Arc<LocalFlow>> {
        self.flows.read().get(owner).cloned()
    }
}

impl ExecutionLoader for LocalFlowLoader {
    fn load(&self, owner: &ExecutionOwner) -> Result<Arc<dyn FlowExecution>, LoadError> {
        self.flow(owner)
            .map(|flow| flow as Arc<dyn FlowExecution>)
            .ok_or_else(|| LoadError::not_found(owner))
    }
}

impl fmt::Debug for LocalFlowLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalFlowLoader")
            .field("flows", &self.flows.read().len())
            .finish()
    }
}
