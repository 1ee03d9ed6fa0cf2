//! Poll a boolean body with growing delays.

use super::{find_body, live_step, lost_body, spawn_timer};
use crate::body::{deliver, BodyCallback, BodyExecution};
use crate::config::PollingConfig;
use crate::context::{BodyId, StepContext};
use crate::errors::StepError;
use crate::execution::{StepExecution, StepSnapshot};
use crate::utils::format_duration;
use parking_lot::Mutex;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Creates a polling step.
pub fn wait_until(polling: PollingConfig) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = WaitUntilStep::new(ctx, polling);
        step
    }
}

/// Reruns its body until it yields `true`.
///
/// Between runs the step sleeps, starting at the configured minimum and
/// growing by the configured factor with no upper bound. A restart during
/// the sleep resets the delay and reruns the body at once; a restart while
/// the body runs lets it finish.
pub struct WaitUntilStep {
    ctx: StepContext,
    polling: PollingConfig,
    delay: Mutex<Duration>,
    body: Mutex<Option<BodyExecution>>,
    lost: Option<BodyId>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl WaitUntilStep {
    /// Creates the step.
    #[must_use]
    pub fn new(ctx: StepContext, polling: PollingConfig) -> Arc<Self> {
        let delay = polling.min_recurrence();
        Arc::new(Self {
            ctx,
            polling,
            delay: Mutex::new(delay),
            body: Mutex::new(None),
            lost: None,
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn rehydrate(
        ctx: StepContext,
        polling: PollingConfig,
        delay: Duration,
        body: Option<BodyId>,
    ) -> Arc<Self> {
        let restored = find_body(&ctx, body);
        Arc::new(Self {
            ctx,
            polling,
            delay: Mutex::new(delay),
            body: Mutex::new(restored.live().filter(|body| !body.is_done())),
            lost: restored.lost(),
            timer: Mutex::new(None),
        })
    }

    /// The delay before the next rerun.
    #[must_use]
    pub fn delay(&self) -> Duration {
        *self.delay.lock()
    }

    fn launch(&self) -> Result<(), StepError> {
        let body = self
            .ctx
            .new_body_invoker()
            .with_callback(Arc::new(WaitUntilCallback))
            .start()?;
        *self.body.lock() = Some(body);
        Ok(())
    }

    fn relaunch_or_fail(&self) {
        if let Err(err) = self.launch() {
            deliver(&self.ctx, Err(err));
        }
    }

    fn schedule(self: &Arc<Self>, per_body: &StepContext) {
        *self.body.lock() = None;
        let delay = {
            let mut delay = self.delay.lock();
            let current = *delay;
            *delay = self.polling.next_recurrence(current);
            current
        };
        per_body.println(format!("Will try again after {}", format_duration(delay)));
        debug!(step = %self.ctx.step_id(), delay_ms = delay.as_millis(), "Condition not met");

        let step = Arc::downgrade(self);
        let timer = spawn_timer(&self.ctx, async move {
            tokio::time::sleep(delay).await;
            if let Some(step) = step.upgrade() {
                step.timer.lock().take();
                step.relaunch_or_fail();
            }
        });
        *self.timer.lock() = timer;
    }
}

impl StepExecution for WaitUntilStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "waitUntil"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        self.launch()?;
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        let body = self.body.lock().clone();
        if let Some(body) = body {
            body.cancel(cause.clone());
        } else if self.lost.is_some() {
            deliver(&self.ctx, Err(cause.clone()));
        }
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
            deliver(&self.ctx, Err(cause));
        }
    }

    fn on_suspend(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn on_resume(self: Arc<Self>) {
        if let Some(id) = self.lost {
            deliver(&self.ctx, Err(lost_body(id)));
            return;
        }
        *self.delay.lock() = self.polling.min_recurrence();
        let running = self.body.lock().is_some();
        if !running {
            debug!(step = %self.ctx.step_id(), "Resumed between polls; polling now");
            self.relaunch_or_fail();
        }
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::WaitUntil {
            delay_ms: u64::try_from(self.delay().as_millis()).unwrap_or(u64::MAX),
            body: self.body.lock().as_ref().map(BodyExecution::id).or(self.lost),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct WaitUntilCallback;

impl BodyCallback for WaitUntilCallback {
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        match value {
            serde_json::Value::Bool(true) => deliver(ctx, Ok(serde_json::Value::Null)),
            serde_json::Value::Bool(false) => match live_step::<WaitUntilStep>(ctx) {
                Some(step) => step.schedule(ctx),
                None => deliver(ctx, Err(StepError::failed("polling step is no longer running"))),
            },
            other => deliver(
                ctx,
                Err(StepError::Condition {
                    message: format!("body return value {other} is not boolean"),
                }),
            ),
        }
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        deliver(ctx, Err(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{flow_fixture, ScriptedBody};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[tokio::test(start_paused = true)]
    async fn test_polls_until_true() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Ok(json!(false)), Ok(json!(false)), Ok(json!(true))]);
        let launched = fixture.flow.launch(Some(body.clone()), wait_until(PollingConfig::default()));

        assert_eq!(launched.outcome().await, Ok(serde_json::Value::Null));
        assert_eq!(body.calls(), 3);
        assert_eq!(
            fixture.console.lines(),
            vec!["Will try again after 0.25 sec", "Will try again after 0.3 sec"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_delays_grow_monotonically() {
        let fixture = flow_fixture();
        let mut script = vec![Ok(json!(false)); 6];
        script.push(Ok(json!(true)));
        let body = ScriptedBody::sequence(script);
        let launched = fixture.flow.launch(Some(body), wait_until(PollingConfig::default()));
        launched.outcome().await.unwrap();

        let delays: Vec<String> = fixture.console.lines();
        assert_eq!(delays.len(), 6);
        assert_eq!(delays[0], "Will try again after 0.25 sec");
        assert_eq!(delays[1], "Will try again after 0.3 sec");
        assert_eq!(delays[2], "Will try again after 0.36 sec");
    }

    #[tokio::test]
    async fn test_non_boolean_is_a_condition_failure() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Ok(json!("yes"))]);
        let launched = fixture.flow.launch(Some(body), wait_until(PollingConfig::default()));

        let err = launched.outcome().await.unwrap_err();
        assert!(matches!(err, StepError::Condition { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_mid_delay_resets_and_polls() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![
            Ok(json!(false)),
            Ok(json!(false)),
            Ok(json!(false)),
            Ok(json!(true)),
        ]);
        let launched = fixture.flow.launch(Some(body.clone()), wait_until(PollingConfig::default()));
        body.wait_for_calls(2).await;
        tokio::task::yield_now().await;

        let step = launched.unit().downcast::<WaitUntilStep>().unwrap();
        assert!(step.delay() > Duration::from_millis(250));
        launched.unit().suspend().unwrap();
        assert!(launched.unit().resume());
        assert_eq!(step.delay(), Duration::from_millis(250));
        body.wait_for_calls(3).await;

        launched.outcome().await.unwrap();
        assert!(fixture
            .console
            .lines()
            .last()
            .is_some_and(|line| line == "Will try again after 0.25 sec"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_delay_fails() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sequence(vec![Ok(json!(false))]);
        let launched = fixture.flow.launch(Some(body.clone()), wait_until(PollingConfig::default()));
        body.wait_for_calls(1).await;
        tokio::task::yield_now().await;

        launched.unit().stop(StepError::failed("stopped"));
        assert_eq!(launched.outcome().await, Err(StepError::failed("stopped")));
    }
}
