//! Pause until someone answers.

use crate::body::deliver;
use crate::context::StepContext;
use crate::errors::{FlowInterrupted, InterruptCause, RunResult, StepError};
use crate::execution::{StepExecution, StepSnapshot};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates an input step registered in `inputs`.
pub fn input(
    inputs: Arc<PendingInputs>,
    id: impl Into<String>,
    message: impl Into<String>,
) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    let (id, message) = (id.into(), message.into());
    move |ctx| {
        let step: Arc<dyn StepExecution> = InputStep::new(ctx, inputs, id, message);
        step
    }
}

struct Pending {
    message: String,
    ctx: StepContext,
}

/// The inputs currently waiting for an answer, by id.
#[derive(Default)]
pub struct PendingInputs {
    entries: DashMap<String, Pending>,
}

impl PendingInputs {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails if another step is already waiting under `id`.
    fn register(&self, id: &str, message: &str, ctx: &StepContext) -> Result<(), StepError> {
        match self.entries.entry(id.to_string()) {
            Entry::Occupied(entry) if entry.get().ctx != *ctx => {
                Err(StepError::failed(format!("Input id '{id}' is already pending")))
            }
            Entry::Occupied(_) => Ok(()),
            Entry::Vacant(entry) => {
                entry.insert(Pending {
                    message: message.to_string(),
                    ctx: ctx.clone(),
                });
                Ok(())
            }
        }
    }

    fn withdraw(&self, id: &str, ctx: &StepContext) -> bool {
        self.entries
            .remove_if(id, |_, pending| pending.ctx == *ctx)
            .is_some()
    }

    /// Ids of the inputs waiting, sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// The prompt of a waiting input.
    #[must_use]
    pub fn message(&self, id: &str) -> Option<String> {
        self.entries.get(id).map(|pending| pending.message.clone())
    }

    /// Answers an input, succeeding its step with `value`.
    pub fn proceed(&self, id: &str, value: serde_json::Value) -> bool {
        let Some((_, pending)) = self.entries.remove(id) else {
            debug!(input = %id, "No such pending input");
            return false;
        };
        info!(input = %id, "Input approved");
        deliver(&pending.ctx, Ok(value));
        true
    }

    /// Rejects an input, interrupting its step.
    pub fn abort(&self, id: &str, user: Option<String>) -> bool {
        let Some((_, pending)) = self.entries.remove(id) else {
            debug!(input = %id, "No such pending input");
            return false;
        };
        info!(input = %id, user = ?user, "Input rejected");
        let mut interruption = FlowInterrupted::new(
            RunResult::Aborted,
            InterruptCause::Rejected {
                input_id: id.to_string(),
            },
        );
        if user.is_some() {
            interruption = interruption.with_cause(InterruptCause::UserStop { user });
        }
        deliver(&pending.ctx, Err(StepError::Interrupted(interruption)));
        true
    }
}

impl fmt::Debug for PendingInputs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingInputs").field("ids", &self.ids()).finish()
    }
}

/// Prints a prompt and waits in [`PendingInputs`] until answered.
pub struct InputStep {
    ctx: StepContext,
    inputs: Arc<PendingInputs>,
    id: String,
    message: String,
}

impl InputStep {
    /// Creates the step.
    #[must_use]
    pub fn new(
        ctx: StepContext,
        inputs: Arc<PendingInputs>,
        id: impl Into<String>,
        message: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            inputs,
            id: id.into(),
            message: message.into(),
        })
    }

    /// The input id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl StepExecution for InputStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "input"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        self.ctx.println(&self.message);
        self.ctx.println("Proceed or Abort");
        self.inputs.register(&self.id, &self.message, &self.ctx)?;
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        if self.inputs.withdraw(&self.id, &self.ctx) {
            deliver(&self.ctx, Err(cause));
        }
    }

    fn on_suspend(&self) {
        self.inputs.withdraw(&self.id, &self.ctx);
    }

    fn on_resume(self: Arc<Self>) {
        if let Err(cause) = self.inputs.register(&self.id, &self.message, &self.ctx) {
            warn!(input = %self.id, "Input id was taken while suspended");
            deliver(&self.ctx, Err(cause));
        }
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::Input {
            id: self.id.clone(),
            message: self.message.clone(),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
