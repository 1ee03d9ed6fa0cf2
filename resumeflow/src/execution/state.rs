//! Per-execution live state.

use super::UnitOfWork;
use crate::body::{Body, BodyExecution, WeakBody};
use crate::context::{BodyId, Completion, ContextVariables, StepId};
use crate::errors::RunResult;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Everything a context needs besides its identity.
#[derive(Clone)]
pub struct ContextBinding {
    pub(crate) variables: ContextVariables,
    pub(crate) completion: Arc<Completion>,
    pub(crate) body: Option<Arc<dyn Body>>,
    pub(crate) scope: Option<WeakBody>,
}

impl ContextBinding {
    /// Creates a binding for a top-level step.
    #[must_use]
    pub fn new(variables: ContextVariables, completion: Arc<Completion>) -> Self {
        Self {
            variables,
            completion,
            body: None,
            scope: None,
        }
    }

    /// Gives the step a body it can invoke.
    #[must_use]
    pub fn with_body(mut self, body: Arc<dyn Body>) -> Self {
        self.body = Some(body);
        self
    }
}

impl fmt::Debug for ContextBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextBinding")
            .field("variables", &self.variables)
            .field("done", &self.completion.is_done())
            .field("has_body", &self.body.is_some())
            .finish_non_exhaustive()
    }
}

/// Structural markers recorded for labelled bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockMarker {
    /// A labelled body started.
    Start {
        /// The body.
        body: BodyId,
        /// Its display label.
        label: String,
    },
    /// A labelled body finished.
    End {
        /// The body.
        body: BodyId,
        /// Its display label.
        label: String,
        /// Whether it ended in failure.
        failed: bool,
    },
}

/// Live state of one execution.
pub struct FlowState {
    bindings: RwLock<HashMap<StepId, ContextBinding>>,
    units: RwLock<HashMap<StepId, Arc<UnitOfWork>>>,
    bodies: RwLock<HashMap<BodyId, BodyExecution>>,
    markers: Mutex<Vec<BlockMarker>>,
    result: Mutex<RunResult>,
}

impl Default for FlowState {
    fn default() -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            units: RwLock::new(HashMap::new()),
            bodies: RwLock::new(HashMap::new()),
            markers: Mutex::new(Vec::new()),
            result: Mutex::new(RunResult::Success),
        }
    }
}

impl FlowState {
    /// Creates empty state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the binding of a context so it can be rehydrated later.
    pub fn record_binding(&self, step: StepId, binding: ContextBinding) {
        self.bindings.write().insert(step, binding);
    }

    /// Returns the binding recorded for `step`.
    #[must_use]
    pub fn binding(&self, step: StepId) -> Option<ContextBinding> {
        self.bindings.read().get(&step).cloned()
    }

    /// Every recorded binding.
    #[must_use]
    pub fn bindings(&self) -> Vec<(StepId, ContextBinding)> {
        self.bindings
            .read()
            .iter()
            .map(|(step, binding)| (*step, binding.clone()))
            .collect()
    }

    /// Tracks a unit of work, replacing any earlier unit for the same step.
    pub fn adopt(&self, unit: Arc<UnitOfWork>) {
        self.units.write().insert(unit.step_id(), unit);
    }

    /// Returns the live unit of work for `step`.
    #[must_use]
    pub fn unit(&self, step: StepId) -> Option<Arc<UnitOfWork>> {
        self.units.read().get(&step).cloned()
    }

    /// Returns every unit of work that has not completed, pruning the rest.
    #[must_use]
    pub fn current_executions(&self) -> Vec<Arc<UnitOfWork>> {
        let mut units = self.units.write();
        units.retain(|_, unit| !unit.is_completed());
        units.values().cloned().collect()
    }

    /// Tracks a body handle.
    pub fn record_body(&self, body: BodyExecution) {
        let mut bodies = self.bodies.write();
        bodies.retain(|_, existing| !existing.is_done());
        bodies.insert(body.id(), body);
    }

    /// Returns the body handle for `id`, if it is still tracked.
    #[must_use]
    pub fn body(&self, id: BodyId) -> Option<BodyExecution> {
        self.bodies.read().get(&id).cloned()
    }

    /// Appends a structural marker.
    pub fn mark(&self, marker: BlockMarker) {
        self.markers.lock().push(marker);
    }

    /// Returns all structural markers in order.
    #[must_use]
    pub fn markers(&self) -> Vec<BlockMarker> {
        self.markers.lock().clone()
    }

    /// Worsens the execution result. Better results are ignored.
    pub fn set_result(&self, result: RunResult) {
        let mut current = self.result.lock();
        *current = current.combine(result);
    }

    /// Returns the current execution result.
    #[must_use]
    pub fn result(&self) -> RunResult {
        *self.result.lock()
    }

    /// Drops all live entries once the execution has finished.
    pub fn clear(&self) {
        self.units.write().clear();
        self.bodies.write().clear();
        self.bindings.write().clear();
    }
}

impl fmt::Debug for FlowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowState")
            .field("bindings", &self.bindings.read().len())
            .field("units", &self.units.read().len())
            .field("bodies", &self.bodies.read().len())
            .field("result", &self.result())
            .finish()
    }
}
