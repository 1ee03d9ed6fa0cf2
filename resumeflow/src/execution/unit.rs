//! The unit-of-work state machine.

use super::{PersistedStep, StepSnapshot, STEP_SNAPSHOT_VERSION};
use crate::context::{StepContext, StepId};
use crate::errors::StepError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Behavior of one kind of step.
///
/// Implementations complete their context exactly once, either inside
/// [`StepExecution::start`] (returning `Ok(true)`) or later from a timer,
/// body callback or external signal.
pub trait StepExecution: Send + Sync {
    /// The context this step completes.
    fn context(&self) -> &StepContext;

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Begins the work. `Ok(true)` means the context was already completed.
    /// An `Err` fails the context.
    fn start(self: Arc<Self>) -> Result<bool, StepError>;

    /// Requests cancellation. The step must still complete its context.
    fn stop(&self, cause: StepError);

    /// Releases transient resources (timers, listeners) before the process goes away.
    fn on_suspend(&self) {}

    /// Reattaches transient resources after a restart.
    fn on_resume(self: Arc<Self>) {}

    /// The persistable state of this step.
    fn snapshot(&self) -> StepSnapshot;

    /// Upcasts for lookups of a concrete step type.
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Lifecycle position of a unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    /// Constructed, not started.
    Created,
    /// `start()` was called.
    Started,
    /// Persisted ahead of a restart.
    Suspended,
    /// Rehydrated and resumed after a restart.
    Resumed,
    /// The context has been completed.
    Completed,
}

/// A step bound 1:1 to its context, with its lifecycle enforced.
pub struct UnitOfWork {
    execution: Arc<dyn StepExecution>,
    state: Mutex<LifecycleState>,
    pending_stop: Mutex<Option<StepError>>,
}

impl UnitOfWork {
    /// Wraps a freshly constructed step.
    #[must_use]
    pub fn new(execution: Arc<dyn StepExecution>) -> Arc<Self> {
        Self::with_state(execution, LifecycleState::Created)
    }

    pub(crate) fn rehydrated(execution: Arc<dyn StepExecution>) -> Arc<Self> {
        Self::with_state(execution, LifecycleState::Suspended)
    }

    fn with_state(execution: Arc<dyn StepExecution>, state: LifecycleState) -> Arc<Self> {
        Arc::new(Self {
            execution,
            state: Mutex::new(state),
            pending_stop: Mutex::new(None),
        })
    }

    /// The step identifier.
    #[must_use]
    pub fn step_id(&self) -> StepId {
        self.execution.context().step_id()
    }

    /// The context this unit completes.
    #[must_use]
    pub fn context(&self) -> &StepContext {
        self.execution.context()
    }

    /// The wrapped step.
    #[must_use]
    pub fn execution(&self) -> &Arc<dyn StepExecution> {
        &self.execution
    }

    /// Returns the wrapped step as a concrete type.
    #[must_use]
    pub fn downcast<T: StepExecution + 'static>(&self) -> Option<Arc<T>> {
        self.execution.clone().into_any().downcast::<T>().ok()
    }

    /// Current lifecycle position.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        if self.is_completed() {
            LifecycleState::Completed
        } else {
            *self.state.lock()
        }
    }

    /// Returns true once the context has been completed.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.context().is_done()
    }

    /// Starts the step. Returns true if it completed synchronously.
    ///
    /// A stop requested before the start fails the context instead of starting.
    pub fn start(&self) -> bool {
        let pending = {
            let mut state = self.state.lock();
            if *state != LifecycleState::Created {
                warn!(step = %self.step_id(), state = ?*state, "Ignoring second start");
                return false;
            }
            *state = LifecycleState::Started;
            self.pending_stop.lock().take()
        };
        if let Some(cause) = pending {
            self.fail_context(cause);
            return true;
        }

        debug!(step = %self.step_id(), kind = self.execution.name(), "Starting step");
        match self.execution.clone().start() {
            Ok(true) => {
                if !self.is_completed() {
                    error!(
                        step = %self.step_id(),
                        kind = self.execution.name(),
                        "Step reported synchronous completion without completing its context"
                    );
                }
                true
            }
            Ok(false) => false,
            Err(cause) => {
                self.fail_context(cause);
                true
            }
        }
    }

    /// Requests cancellation. A no-op once completed.
    pub fn stop(&self, cause: StepError) {
        {
            let state = self.state.lock();
            if self.is_completed() {
                debug!(step = %self.step_id(), "Ignoring stop of a completed step");
                return;
            }
            if *state == LifecycleState::Created {
                let mut pending = self.pending_stop.lock();
                if pending.is_none() {
                    *pending = Some(cause);
                }
                return;
            }
        }
        self.execution.stop(cause);
    }

    /// Persists the step ahead of a restart and releases its transient resources.
    ///
    /// Returns `None` for units that already completed.
    pub fn suspend(&self) -> Option<PersistedStep> {
        if self.is_completed() {
            return None;
        }
        let persisted = self.persist();
        self.execution.on_suspend();
        *self.state.lock() = LifecycleState::Suspended;
        Some(persisted)
    }

    /// Reattaches transient resources after a restart.
    ///
    /// Only a suspended unit resumes; returns whether it did.
    pub fn resume(&self) -> bool {
        {
            let mut state = self.state.lock();
            if *state != LifecycleState::Suspended || self.is_completed() {
                return false;
            }
            *state = LifecycleState::Resumed;
        }
        debug!(step = %self.step_id(), kind = self.execution.name(), "Resuming step");
        self.execution.clone().on_resume();
        true
    }

    /// The persistable record of this unit.
    #[must_use]
    pub fn persist(&self) -> PersistedStep {
        PersistedStep {
            version: STEP_SNAPSHOT_VERSION,
            context: self.context().snapshot(),
            state: self.execution.snapshot(),
        }
    }

    fn fail_context(&self, cause: StepError) {
        if let Err(err) = self.context().fail(cause) {
            warn!(step = %self.step_id(), error = %err, "Could not fail step context");
        }
    }
}

impl fmt::Debug for UnitOfWork {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitOfWork")
            .field("step", &self.step_id())
            .field("kind", &self.execution.name())
            .field("state", &self.state())
            .finish()
    }
}
