//! Body completion callbacks.

use crate::context::StepContext;
use crate::errors::{StepError, StepResult};
use std::fmt;
use tracing::warn;

/// Receives the outcome of a body.
///
/// Every method is handed the context scoped to the invocation boundary.
/// Completing that context completes the step that launched the body.
/// `on_start` runs first, then exactly one of `on_success` or `on_failure`.
pub trait BodyCallback: Send + Sync {
    /// The body was launched.
    fn on_start(&self, _ctx: &StepContext) {}

    /// The body finished with a value.
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value);

    /// The body failed or was interrupted.
    fn on_failure(&self, ctx: &StepContext, cause: StepError);
}

/// Completes `ctx` with `result`, logging if that is rejected.
pub fn deliver(ctx: &StepContext, result: StepResult) {
    if let Err(err) = ctx.complete(result) {
        warn!(step = %ctx.step_id(), error = %err, "Could not deliver body outcome");
    }
}

/// Hands the body outcome straight to the invoking step.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOutcome;

impl BodyCallback for ForwardOutcome {
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        deliver(ctx, Ok(value));
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        deliver(ctx, Err(cause));
    }
}

/// Runs a finisher once the body is over, then forwards the outcome.
///
/// If the finisher fails after a successful body, the step fails with the
/// finisher's error. After a failed body the original failure wins and the
/// finisher's error is only logged.
pub struct TailCall<F> {
    finish: F,
}

impl<F> TailCall<F>
where
    F: Fn(&StepContext) -> Result<(), StepError> + Send + Sync,
{
    /// Creates a tail call around `finish`.
    #[must_use]
    pub fn new(finish: F) -> Self {
        Self { finish }
    }
}

impl<F> BodyCallback for TailCall<F>
where
    F: Fn(&StepContext) -> Result<(), StepError> + Send + Sync,
{
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        match (self.finish)(ctx) {
            Ok(()) => deliver(ctx, Ok(value)),
            Err(err) => deliver(ctx, Err(err)),
        }
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        if let Err(err) = (self.finish)(ctx) {
            warn!(step = %ctx.step_id(), error = %err, "Finisher failed after body failure");
        }
        deliver(ctx, Err(cause));
    }
}

impl<F> fmt::Debug for TailCall<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TailCall").finish_non_exhaustive()
    }
}
