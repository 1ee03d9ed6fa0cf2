//! The execution context handed to every unit of work.

use super::{ContextVariables, ExecutionOwner, LogFilter, StepId};
use crate::body::{Body, BodyInvoker};
use crate::console::ConsoleLog;
use crate::errors::{ContextError, LoadError, RunResult, StepError, StepResult};
use crate::execution::{ContextBinding, ExecutionLoader, FlowExecution, StepExecution, UnitOfWork};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::oneshot;
use tracing::{debug, error};

/// Format version of [`StepContextSnapshot`].
pub const CONTEXT_SNAPSHOT_VERSION: u32 = 1;

/// Receives the terminal value of a step.
pub trait CompletionSink: Send + Sync {
    /// Delivers the outcome of `step`. Called at most once per step.
    fn deliver(&self, step: StepId, result: StepResult);
}

/// The exactly-once completion cell shared by a context and its sub-contexts.
pub struct Completion {
    step: StepId,
    done: AtomicBool,
    sink: Arc<dyn CompletionSink>,
}

impl Completion {
    /// Creates a completion cell delivering into `sink`.
    #[must_use]
    pub fn new(step: StepId, sink: Arc<dyn CompletionSink>) -> Arc<Self> {
        Arc::new(Self {
            step,
            done: AtomicBool::new(false),
            sink,
        })
    }

    /// Returns true once an outcome was accepted.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn complete(&self, result: StepResult) -> Result<(), ContextError> {
        if self
            .done
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            error!(
                step = %self.step,
                rejected = ?result,
                "Step completed twice; rejecting the second completion"
            );
            return Err(ContextError::AlreadyCompleted {
                step: self.step.to_string(),
            });
        }
        self.sink.deliver(self.step, result);
        Ok(())
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("step", &self.step)
            .field("done", &self.is_done())
            .finish_non_exhaustive()
    }
}

struct OneshotSink {
    sender: Mutex<Option<oneshot::Sender<StepResult>>>,
}

impl CompletionSink for OneshotSink {
    fn deliver(&self, step: StepId, result: StepResult) {
        if let Some(sender) = self.sender.lock().take() {
            if sender.send(result).is_err() {
                debug!(step = %step, "Nobody is waiting for this step any more");
            }
        }
    }
}

/// The persisted identity of a context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepContextSnapshot {
    /// Format version.
    pub version: u32,
    /// The execution the step belongs to.
    pub owner: ExecutionOwner,
    /// The step.
    pub step: StepId,
}

#[derive(Clone)]
struct Bound {
    execution: Arc<dyn FlowExecution>,
    binding: ContextBinding,
}

struct ContextInner {
    owner: ExecutionOwner,
    step: StepId,
    bound: OnceLock<Bound>,
    loader: Option<Arc<dyn ExecutionLoader>>,
    binding_lock: Mutex<()>,
}

/// The rest of the computation for one unit of work.
///
/// Contexts are cheap handles. Clones refer to the same step and share one
/// completion cell. A context rehydrated from a [`StepContextSnapshot`]
/// binds back to its execution lazily, on first use.
#[derive(Clone)]
pub struct StepContext {
    inner: Arc<ContextInner>,
}

impl StepContext {
    /// Creates a bound context and records its binding in the execution.
    #[must_use]
    pub fn new(execution: Arc<dyn FlowExecution>, step: StepId, binding: ContextBinding) -> Self {
        execution.state().record_binding(step, binding.clone());
        Self::bound_to(execution, step, binding)
    }

    fn bound_to(execution: Arc<dyn FlowExecution>, step: StepId, binding: ContextBinding) -> Self {
        let owner = execution.owner().clone();
        let bound = OnceLock::new();
        let _ = bound.set(Bound { execution, binding });
        Self {
            inner: Arc::new(ContextInner {
                owner,
                step,
                bound,
                loader: None,
                binding_lock: Mutex::new(()),
            }),
        }
    }

    /// Recreates a context from its snapshot. It is not ready until first used.
    pub fn rehydrate(
        snapshot: StepContextSnapshot,
        loader: Arc<dyn ExecutionLoader>,
    ) -> Result<Self, LoadError> {
        if snapshot.version != CONTEXT_SNAPSHOT_VERSION {
            return Err(LoadError::UnsupportedVersion {
                key: format!("context {}", snapshot.step),
                found: snapshot.version,
                expected: CONTEXT_SNAPSHOT_VERSION,
            });
        }
        Ok(Self {
            inner: Arc::new(ContextInner {
                owner: snapshot.owner,
                step: snapshot.step,
                bound: OnceLock::new(),
                loader: Some(loader),
                binding_lock: Mutex::new(()),
            }),
        })
    }

    fn resolve(&self) -> Result<&Bound, ContextError> {
        if let Some(bound) = self.inner.bound.get() {
            return Ok(bound);
        }
        let _guard = self.inner.binding_lock.lock();
        if let Some(bound) = self.inner.bound.get() {
            return Ok(bound);
        }
        let loader = self.inner.loader.as_ref().ok_or_else(|| {
            LoadError::missing(format!("execution loader for {}", self.inner.owner))
        })?;
        let execution = self.inner.owner.get(loader.as_ref())?;
        let binding = execution.state().binding(self.inner.step).ok_or_else(|| {
            LoadError::missing(format!("context {} in {}", self.inner.step, self.inner.owner))
        })?;
        debug!(owner = %self.inner.owner, step = %self.inner.step, "Rebound rehydrated context");
        Ok(self.inner.bound.get_or_init(|| Bound { execution, binding }))
    }

    /// Returns false while a rehydrated context has not yet bound to its execution.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.inner.bound.get().is_some()
    }

    /// The execution this step belongs to.
    #[must_use]
    pub fn owner(&self) -> &ExecutionOwner {
        &self.inner.owner
    }

    /// The step identifier.
    #[must_use]
    pub fn step_id(&self) -> StepId {
        self.inner.step
    }

    /// The live execution, loading it if necessary.
    pub fn execution(&self) -> Result<Arc<dyn FlowExecution>, ContextError> {
        Ok(self.resolve()?.execution.clone())
    }

    /// Looks up the contextual value of type `T`.
    pub fn get<T: Any + Send + Sync>(&self) -> Result<Option<Arc<T>>, ContextError> {
        Ok(self.resolve()?.binding.variables.get::<T>())
    }

    /// All contextual values visible to this step.
    pub fn variables(&self) -> Result<ContextVariables, ContextError> {
        Ok(self.resolve()?.binding.variables.clone())
    }

    /// Completes the step successfully.
    pub fn succeed(&self, value: serde_json::Value) -> Result<(), ContextError> {
        self.complete(Ok(value))
    }

    /// Completes the step with a failure.
    pub fn fail(&self, cause: StepError) -> Result<(), ContextError> {
        self.complete(Err(cause))
    }

    /// Completes the step. A second completion is rejected and logged.
    pub fn complete(&self, result: StepResult) -> Result<(), ContextError> {
        self.resolve()?.binding.completion.complete(result)
    }

    /// Returns true once the step was completed. Unbound contexts report false.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner
            .bound
            .get()
            .is_some_and(|bound| bound.binding.completion.is_done())
    }

    /// Returns true if this step was given a body.
    #[must_use]
    pub fn has_body(&self) -> bool {
        self.resolve()
            .map(|bound| bound.binding.body.is_some())
            .unwrap_or(false)
    }

    /// Starts building an invocation of this step's body.
    #[must_use]
    pub fn new_body_invoker(&self) -> BodyInvoker {
        BodyInvoker::new(self.clone())
    }

    /// Writes a line to the step's console, through any log filter.
    pub fn println(&self, line: impl AsRef<str>) {
        let Ok(bound) = self.resolve() else {
            debug!(step = %self.inner.step, "Console unavailable for unbound context");
            return;
        };
        let variables = &bound.binding.variables;
        let Some(console) = variables.get::<ConsoleLog>() else {
            return;
        };
        let line = line.as_ref();
        match variables.get::<LogFilter>() {
            Some(filter) => {
                if let Some(filtered) = filter.apply(line) {
                    console.println(&filtered);
                }
            }
            None => console.println(line),
        }
    }

    /// Worsens the result of the owning execution.
    pub fn set_result(&self, result: RunResult) -> Result<(), ContextError> {
        self.resolve()?.execution.state().set_result(result);
        Ok(())
    }

    /// The persistable identity of this context.
    #[must_use]
    pub fn snapshot(&self) -> StepContextSnapshot {
        StepContextSnapshot {
            version: CONTEXT_SNAPSHOT_VERSION,
            owner: self.inner.owner.clone(),
            step: self.inner.step,
        }
    }

    pub(crate) fn binding(&self) -> Result<(Arc<dyn FlowExecution>, ContextBinding), ContextError> {
        let bound = self.resolve()?;
        Ok((bound.execution.clone(), bound.binding.clone()))
    }

    /// A view of this step with different variables that completes the same step.
    pub(crate) fn sub_context(&self, variables: ContextVariables) -> Result<Self, ContextError> {
        let (execution, mut binding) = self.binding()?;
        binding.variables = variables;
        Ok(Self::bound_to(execution, self.inner.step, binding))
    }

    /// Runs an inner step inside the current body and waits for its outcome.
    pub async fn run_step<F>(&self, factory: F) -> StepResult
    where
        F: FnOnce(Self) -> Arc<dyn StepExecution> + Send,
    {
        self.run_inner(None, factory).await
    }

    /// Runs an inner step that has a body of its own.
    pub async fn run_block_step<F>(&self, body: Arc<dyn Body>, factory: F) -> StepResult
    where
        F: FnOnce(Self) -> Arc<dyn StepExecution> + Send,
    {
        self.run_inner(Some(body), factory).await
    }

    async fn run_inner<F>(&self, body: Option<Arc<dyn Body>>, factory: F) -> StepResult
    where
        F: FnOnce(Self) -> Arc<dyn StepExecution> + Send,
    {
        let (execution, binding) = self.binding()?;
        let (sender, receiver) = oneshot::channel();
        let step = StepId::new();
        let sink = Arc::new(OneshotSink {
            sender: Mutex::new(Some(sender)),
        });
        let child = Self::new(
            execution.clone(),
            step,
            ContextBinding {
                variables: binding.variables.clone(),
                completion: Completion::new(step, sink),
                body,
                scope: binding.scope.clone(),
            },
        );
        let unit = UnitOfWork::new(factory(child));
        execution.state().adopt(unit.clone());

        let scope = binding.scope.as_ref().and_then(|scope| scope.upgrade());
        match &scope {
            Some(scope) => scope.run_unit(&unit),
            None => {
                unit.start();
            }
        }

        let result = receiver
            .await
            .unwrap_or_else(|_| Err(StepError::failed(format!("step {step} dropped its completion"))));
        if let Some(scope) = &scope {
            scope.leave(step);
        }
        result
    }
}

impl PartialEq for StepContext {
    fn eq(&self, other: &Self) -> bool {
        self.inner.owner == other.inner.owner && self.inner.step == other.inner.step
    }
}

impl Eq for StepContext {}

impl Hash for StepContext {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.owner.hash(state);
        self.inner.step.hash(state);
    }
}

impl fmt::Debug for StepContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepContext")
            .field("owner", &self.inner.owner)
            .field("step", &self.inner.step)
            .field("ready", &self.is_ready())
            .field("done", &self.is_done())
            .finish()
    }
}
