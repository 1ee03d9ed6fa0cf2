//! Swallow a body failure, marking the flow instead.

use super::{find_body, lost_body};
use crate::body::{deliver, BodyCallback, BodyExecution};
use crate::config::RuntimeConfig;
use crate::context::{BodyId, StepContext};
use crate::errors::{RunResult, StepError};
use crate::execution::{StepExecution, StepSnapshot};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use tracing::warn;

/// Creates a catch-error step that marks the flow with `result` on failure.
pub fn catch_error(result: RunResult) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = CatchErrorStep::new(ctx, result);
        step
    }
}

/// Creates a catch-error step that marks the flow with the configured result.
pub fn catch_error_default(config: &RuntimeConfig) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    catch_error(config.catch_error_result)
}

/// Runs its body; an ordinary failure is printed, the flow result is
/// worsened and the step succeeds with `null`. Interruptions pass through.
pub struct CatchErrorStep {
    ctx: StepContext,
    result: RunResult,
    body: Mutex<Option<BodyExecution>>,
    lost: Option<BodyId>,
}

impl CatchErrorStep {
    /// Creates the step.
    #[must_use]
    pub fn new(ctx: StepContext, result: RunResult) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            result,
            body: Mutex::new(None),
            lost: None,
        })
    }

    pub(crate) fn rehydrate(ctx: StepContext, result: RunResult, body: Option<BodyId>) -> Arc<Self> {
        let restored = find_body(&ctx, body);
        Arc::new(Self {
            ctx,
            result,
            body: Mutex::new(restored.live()),
            lost: restored.lost(),
        })
    }
}

impl StepExecution for CatchErrorStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "catchError"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        let body = self
            .ctx
            .new_body_invoker()
            .with_callback(Arc::new(CatchErrorCallback { result: self.result }))
            .start()?;
        *self.body.lock() = Some(body);
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        let body = self.body.lock().clone();
        match body {
            Some(body) => {
                body.cancel(cause);
            }
            None if self.lost.is_some() => deliver(&self.ctx, Err(cause)),
            None => {}
        }
    }

    fn on_resume(self: Arc<Self>) {
        if let Some(id) = self.lost {
            deliver(&self.ctx, Err(lost_body(id)));
        }
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::CatchError {
            result: self.result,
            body: self.body.lock().as_ref().map(BodyExecution::id).or(self.lost),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct CatchErrorCallback {
    result: RunResult,
}

impl BodyCallback for CatchErrorCallback {
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        deliver(ctx, Ok(value));
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        if cause.is_interruption() {
            deliver(ctx, Err(cause));
            return;
        }
        ctx.println(format!("ERROR: {cause}"));
        if let Err(err) = ctx.set_result(self.result) {
            warn!(step = %ctx.step_id(), error = %err, "Could not mark flow result");
        }
        deliver(ctx, Ok(serde_json::Value::Null));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::InterruptCause;
    use crate::testing::{flow_fixture, ScriptedBody};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_failure_is_swallowed_and_marked() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Err(StepError::failed("compile error"))]);
        let launched = fixture.flow.launch(Some(body), catch_error(RunResult::Unstable));

        assert_eq!(launched.outcome().await, Ok(serde_json::Value::Null));
        assert_eq!(fixture.flow.result(), RunResult::Unstable);
        assert!(fixture.console.contains("ERROR: compile error"));
    }

    #[tokio::test]
    async fn test_interruption_propagates() {
        let fixture = flow_fixture();
        let cause = StepError::aborted(InterruptCause::UserStop { user: Some("ops".into()) });
        let body = ScriptedBody::sequence(vec![Err(cause.clone())]);
        let launched = fixture.flow.launch(Some(body), catch_error(RunResult::Failure));

        assert_eq!(launched.outcome().await, Err(cause));
        assert_eq!(fixture.flow.result(), RunResult::Aborted);
    }

    #[tokio::test]
    async fn test_default_result_comes_from_config() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Err(StepError::failed("flaky test"))]);
        let config = RuntimeConfig::default().with_catch_error_result(RunResult::Unstable);
        let launched = fixture.flow.launch(Some(body), catch_error_default(&config));

        assert_eq!(launched.outcome().await, Ok(serde_json::Value::Null));
        assert_eq!(fixture.flow.result(), RunResult::Unstable);
    }

    #[tokio::test]
    async fn test_default_config_marks_failure() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Err(StepError::failed("flaky test"))]);
        let launched = fixture.flow.launch(Some(body), catch_error_default(&RuntimeConfig::default()));

        assert_eq!(launched.outcome().await, Ok(serde_json::Value::Null));
        assert_eq!(fixture.flow.result(), RunResult::Failure);
    }
}
