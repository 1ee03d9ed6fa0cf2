//! The step that enters a gate.

use super::GateController;
use crate::body::deliver;
use crate::context::StepContext;
use crate::errors::StepError;
use crate::execution::{StepExecution, StepSnapshot};
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

/// Creates a gate step for the build that owns the step.
pub fn gate(
    controller: Arc<GateController>,
    name: impl Into<String>,
    capacity: Option<u32>,
) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    let name = name.into();
    move |ctx| {
        let step: Arc<dyn StepExecution> = GateStep::new(ctx, controller, name, capacity);
        step
    }
}

/// Waits until its build is admitted into a gate.
pub struct GateStep {
    ctx: StepContext,
    controller: Arc<GateController>,
    job: String,
    gate: String,
    build: u64,
    capacity: Option<u32>,
}

impl GateStep {
    /// Creates the step. The job and build come from the context's owner.
    #[must_use]
    pub fn new(
        ctx: StepContext,
        controller: Arc<GateController>,
        gate: impl Into<String>,
        capacity: Option<u32>,
    ) -> Arc<Self> {
        let owner = ctx.owner().clone();
        Arc::new(Self {
            ctx,
            controller,
            job: owner.job,
            gate: gate.into(),
            build: owner.build,
            capacity,
        })
    }

    pub(crate) fn rehydrate(
        ctx: StepContext,
        controller: Arc<GateController>,
        job: String,
        gate: String,
        build: u64,
        capacity: Option<u32>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            controller,
            job,
            gate,
            build,
            capacity,
        })
    }

    /// The gate name.
    #[must_use]
    pub fn gate(&self) -> &str {
        &self.gate
    }
}

impl StepExecution for GateStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "stage"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        self.controller
            .enter(&self.ctx, &self.job, &self.gate, self.build, self.capacity)?;
        Ok(self.ctx.is_done())
    }

    fn stop(&self, cause: StepError) {
        if self.controller.withdraw(&self.job, &self.gate, self.build) {
            deliver(&self.ctx, Err(cause));
        } else {
            warn!(step = %self.ctx.step_id(), gate = %self.gate, "Stop requested for a build that is not waiting");
        }
    }

    fn on_suspend(&self) {
        self.controller.detach(&self.job, &self.gate, self.build);
    }

    fn on_resume(self: Arc<Self>) {
        if let Err(err) =
            self.controller
                .reattach(&self.ctx, &self.job, &self.gate, self.build, self.capacity)
        {
            deliver(&self.ctx, Err(err.into()));
        }
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::Gate {
            job: self.job.clone(),
            gate: self.gate.clone(),
            build: self.build,
            capacity: self.capacity,
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
