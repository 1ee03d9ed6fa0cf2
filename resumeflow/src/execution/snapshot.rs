//! Persisted step records and their reconstruction.

use super::{ExecutionLoader, StepExecution, UnitOfWork};
use crate::config::RuntimeConfig;
use crate::context::{BodyId, StepContext, StepContextSnapshot};
use crate::errors::{ContextError, LoadError, RunResult};
use crate::gates::{GateController, GateStep};
use crate::steps::{CatchErrorStep, InputStep, PendingInputs, RetryStep, SleepStep, TimeoutStep, WaitUntilStep};
use crate::workers::{WorkerSlotStep, WorkerSlots};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Format version of [`PersistedStep`].
pub const STEP_SNAPSHOT_VERSION: u32 = 1;

/// The state a step needs to pick up where it left off.
///
/// Bodies are referenced by id and relocated in the execution's live state.
/// Deadlines are absolute epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepSnapshot {
    /// A retry loop.
    Retry {
        /// Total attempts allowed.
        attempts: u32,
        /// Attempts left after the current one.
        remaining: u32,
        /// The attempt in flight.
        body: Option<BodyId>,
    },
    /// A time-limited body.
    Timeout {
        /// The configured limit.
        limit_ms: u64,
        /// When the body is cut off.
        deadline_ms: i64,
        /// Whether the limit was already hit.
        fired: bool,
        /// The body.
        body: Option<BodyId>,
    },
    /// A polled condition.
    WaitUntil {
        /// Delay before the next poll.
        delay_ms: u64,
        /// The poll in flight.
        body: Option<BodyId>,
    },
    /// A pause.
    Sleep {
        /// When the pause ends.
        end_ms: i64,
    },
    /// A body whose failure is swallowed.
    CatchError {
        /// The result recorded on failure.
        result: RunResult,
        /// The body.
        body: Option<BodyId>,
    },
    /// A pending answer.
    Input {
        /// The input id.
        id: String,
        /// The prompt.
        message: String,
    },
    /// A gate admission.
    Gate {
        /// The job.
        job: String,
        /// The gate.
        gate: String,
        /// The build entering.
        build: u64,
        /// The capacity requested.
        capacity: Option<u32>,
    },
    /// A body running on an allocated worker.
    WorkerSlot {
        /// Label the worker must carry.
        label: Option<String>,
        /// The slot cookie.
        cookie: String,
        /// The worker, once allocated.
        worker: Option<String>,
        /// The body, once launched.
        body: Option<BodyId>,
    },
}

impl StepSnapshot {
    /// The step name this record belongs to.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Retry { .. } => "retry",
            Self::Timeout { .. } => "timeout",
            Self::WaitUntil { .. } => "waitUntil",
            Self::Sleep { .. } => "sleep",
            Self::CatchError { .. } => "catchError",
            Self::Input { .. } => "input",
            Self::Gate { .. } => "stage",
            Self::WorkerSlot { .. } => "node",
        }
    }
}

/// A unit of work as written before a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStep {
    /// Format version.
    pub version: u32,
    /// The context identity.
    pub context: StepContextSnapshot,
    /// The step state.
    pub state: StepSnapshot,
}

impl PersistedStep {
    /// Rebuilds the unit of work with the services in `rehydrator`.
    pub fn rehydrate(self, rehydrator: &Rehydrator) -> Result<Arc<UnitOfWork>, LoadError> {
        rehydrator.rehydrate(self)
    }
}

/// Rebuilds units of work from [`PersistedStep`]s.
///
/// Steps that depend on process-wide services (gates, inputs, workers)
/// can only be rebuilt if the service was supplied.
pub struct Rehydrator {
    loader: Arc<dyn ExecutionLoader>,
    config: RuntimeConfig,
    gates: Option<Arc<GateController>>,
    inputs: Option<Arc<PendingInputs>>,
    workers: Option<Arc<WorkerSlots>>,
}

impl Rehydrator {
    /// Creates a rehydrator resolving owners through `loader`.
    #[must_use]
    pub fn new(loader: Arc<dyn ExecutionLoader>, config: RuntimeConfig) -> Self {
        Self {
            loader,
            config,
            gates: None,
            inputs: None,
            workers: None,
        }
    }

    /// Supplies the gate controller.
    #[must_use]
    pub fn with_gates(mut self, gates: Arc<GateController>) -> Self {
        self.gates = Some(gates);
        self
    }

    /// Supplies the pending-input table.
    #[must_use]
    pub fn with_inputs(mut self, inputs: Arc<PendingInputs>) -> Self {
        self.inputs = Some(inputs);
        self
    }

    /// Supplies the worker slots.
    #[must_use]
    pub fn with_workers(mut self, workers: Arc<WorkerSlots>) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Rebuilds the unit, adopts it into its execution and leaves it suspended.
    ///
    /// Call [`UnitOfWork::resume`] (or [`crate::registry::resume_all`]) to restart it.
    pub fn rehydrate(&self, persisted: PersistedStep) -> Result<Arc<UnitOfWork>, LoadError> {
        if persisted.version != STEP_SNAPSHOT_VERSION {
            return Err(LoadError::UnsupportedVersion {
                key: format!("step {}", persisted.context.step),
                found: persisted.version,
                expected: STEP_SNAPSHOT_VERSION,
            });
        }
        let ctx = StepContext::rehydrate(persisted.context, self.loader.clone())?;
        let execution = ctx.execution().map_err(|err| match err {
            ContextError::Load(load) => load,
            other => LoadError::missing(other.to_string()),
        })?;
        let kind = persisted.state.kind();
        let step = self.build(ctx, persisted.state)?;

        let unit = UnitOfWork::rehydrated(step);
        execution.state().adopt(unit.clone());
        debug!(owner = %execution.owner(), step = %unit.step_id(), kind, "Rehydrated step");
        Ok(unit)
    }

    fn build(&self, ctx: StepContext, state: StepSnapshot) -> Result<Arc<dyn StepExecution>, LoadError> {
        let step: Arc<dyn StepExecution> = match state {
            StepSnapshot::Retry {
                attempts,
                remaining,
                body,
            } => RetryStep::rehydrate(ctx, attempts, remaining, body),
            StepSnapshot::Timeout {
                limit_ms,
                deadline_ms,
                fired,
                body,
            } => TimeoutStep::rehydrate(ctx, Duration::from_millis(limit_ms), deadline_ms, fired, body),
            StepSnapshot::WaitUntil { delay_ms, body } => WaitUntilStep::rehydrate(
                ctx,
                self.config.polling.clone(),
                Duration::from_millis(delay_ms),
                body,
            ),
            StepSnapshot::Sleep { end_ms } => SleepStep::rehydrate(ctx, end_ms),
            StepSnapshot::CatchError { result, body } => CatchErrorStep::rehydrate(ctx, result, body),
            StepSnapshot::Input { id, message } => {
                let inputs = self.inputs.clone().ok_or_else(|| LoadError::missing("pending input table"))?;
                InputStep::new(ctx, inputs, id, message)
            }
            StepSnapshot::Gate {
                job,
                gate,
                build,
                capacity,
            } => {
                let gates = self.gates.clone().ok_or_else(|| LoadError::missing("gate controller"))?;
                GateStep::rehydrate(ctx, gates, job, gate, build, capacity)
            }
            StepSnapshot::WorkerSlot {
                label,
                cookie,
                worker,
                body,
            } => {
                let workers = self.workers.clone().ok_or_else(|| LoadError::missing("worker pool"))?;
                WorkerSlotStep::rehydrate(ctx, workers, label, cookie, worker, body)
            }
        };
        Ok(step)
    }
}

impl fmt::Debug for Rehydrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rehydrator")
            .field("gates", &self.gates.is_some())
            .field("inputs", &self.inputs.is_some())
            .field("workers", &self.workers.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ExecutionOwner, StepId, CONTEXT_SNAPSHOT_VERSION};
    use crate::host::LocalFlowLoader;
    use pretty_assertions::assert_eq;

    fn context(owner: ExecutionOwner) -> StepContextSnapshot {
        StepContextSnapshot {
            version: CONTEXT_SNAPSHOT_VERSION,
            owner,
            step: StepId::new(),
        }
    }

    #[test]
    fn test_record_format_is_tagged() {
        let state = StepSnapshot::Gate {
            job: "app".into(),
            gate: "deploy".into(),
            build: 7,
            capacity: Some(1),
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["kind"], "gate");
        assert_eq!(json["build"], 7);
        assert_eq!(serde_json::from_value::<StepSnapshot>(json).unwrap(), state);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let rehydrator = Rehydrator::new(Arc::new(LocalFlowLoader::new()), RuntimeConfig::default());
        let persisted = PersistedStep {
            version: 99,
            context: context(ExecutionOwner::new("app", 1)),
            state: StepSnapshot::Sleep { end_ms: 0 },
        };
        assert!(matches!(
            rehydrator.rehydrate(persisted),
            Err(LoadError::UnsupportedVersion { found: 99, .. })
        ));
    }

    #[test]
    fn test_unknown_owner_fails_to_load() {
        let rehydrator = Rehydrator::new(Arc::new(LocalFlowLoader::new()), RuntimeConfig::default());
        let persisted = PersistedStep {
            version: STEP_SNAPSHOT_VERSION,
            context: context(ExecutionOwner::new("gone", 3)),
            state: StepSnapshot::Sleep { end_ms: 0 },
        };
        assert!(matches!(
            persisted.rehydrate(&rehydrator),
            Err(LoadError::NotFound { .. })
        ));
    }
}
