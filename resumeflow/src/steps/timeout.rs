//! Race a body against a deadline.

use super::{find_body, live_step, lost_body, spawn_timer};
use crate::body::{deliver, BodyCallback, BodyExecution};
use crate::context::{BodyId, StepContext};
use crate::errors::{InterruptCause, StepError, StepResult};
use crate::execution::{StepExecution, StepSnapshot};
use crate::utils::{deadline_after, remaining_until};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Creates a timeout step with the given limit.
pub fn timeout(limit: Duration) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = TimeoutStep::new(ctx, limit);
        step
    }
}

/// Runs its body and cancels it once the deadline passes.
///
/// The deadline is absolute and persisted, so a resumed step only waits for
/// whatever time was left. Once the deadline fired, the step reports a
/// [`InterruptCause::TimedOut`] interruption even if the body still
/// manages to succeed.
pub struct TimeoutStep {
    ctx: StepContext,
    limit: Duration,
    deadline_ms: AtomicI64,
    fired: AtomicBool,
    body: Mutex<Option<BodyExecution>>,
    lost: Option<BodyId>,
    killer: Mutex<Option<JoinHandle<()>>>,
}

impl TimeoutStep {
    /// Creates the step.
    #[must_use]
    pub fn new(ctx: StepContext, limit: Duration) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            limit,
            deadline_ms: AtomicI64::new(0),
            fired: AtomicBool::new(false),
            body: Mutex::new(None),
            lost: None,
            killer: Mutex::new(None),
        })
    }

    pub(crate) fn rehydrate(
        ctx: StepContext,
        limit: Duration,
        deadline_ms: i64,
        fired: bool,
        body: Option<BodyId>,
    ) -> Arc<Self> {
        let restored = find_body(&ctx, body);
        Arc::new(Self {
            ctx,
            limit,
            deadline_ms: AtomicI64::new(deadline_ms),
            fired: AtomicBool::new(fired),
            body: Mutex::new(restored.live()),
            lost: restored.lost(),
            killer: Mutex::new(None),
        })
    }

    /// The absolute deadline in epoch milliseconds.
    #[must_use]
    pub fn deadline_ms(&self) -> i64 {
        self.deadline_ms.load(Ordering::SeqCst)
    }

    /// Returns true once the deadline passed while the body was running.
    #[must_use]
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn arm(self: &Arc<Self>) {
        let left = remaining_until(self.deadline_ms());
        let step = Arc::downgrade(self);
        debug!(step = %self.ctx.step_id(), left_ms = left.as_millis(), "Arming timeout");
        let killer = spawn_timer(&self.ctx, async move {
            tokio::time::sleep(left).await;
            if let Some(step) = step.upgrade() {
                step.fire();
            }
        });
        if let Some(old) = std::mem::replace(&mut *self.killer.lock(), killer) {
            old.abort();
        }
    }

    fn disarm(&self) {
        if let Some(killer) = self.killer.lock().take() {
            killer.abort();
        }
    }

    fn fire(&self) {
        let Some(body) = self.body.lock().clone() else {
            return;
        };
        if body.is_done() {
            return;
        }
        self.fired.store(true, Ordering::SeqCst);
        info!(step = %self.ctx.step_id(), limit_ms = self.limit.as_millis(), "Timeout exceeded");
        self.ctx.println("Timeout has been exceeded");
        body.cancel(StepError::aborted(InterruptCause::timed_out(self.limit)));
    }

    fn finish(&self, ctx: &StepContext, result: StepResult) {
        self.disarm();
        let result = match result {
            Ok(_) if self.has_fired() => Err(StepError::aborted(InterruptCause::timed_out(self.limit))),
            other => other,
        };
        deliver(ctx, result);
    }
}

impl StepExecution for TimeoutStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "timeout"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        self.deadline_ms.store(deadline_after(self.limit), Ordering::SeqCst);
        let body = self.ctx.new_body_invoker().start()?;
        *self.body.lock() = Some(body.clone());
        self.arm();
        body.add_callback(Arc::new(TimeoutCallback));
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

    fn on_suspend(&self) {
        self.disarm();
    }

    fn on_resume(self: Arc<Self>) {
        if let Some(id) = self.lost {
            deliver(&self.ctx, Err(lost_body(id)));
            return;
        }
        self.arm();
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::Timeout {
            limit_ms: u64::try_from(self.limit.as_millis()).unwrap_or(u64::MAX),
            deadline_ms: self.deadline_ms(),
            fired: self.has_fired(),
            body: self.body.lock().as_ref().map(BodyExecution::id).or(self.lost),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct TimeoutCallback;

impl TimeoutCallback {
    fn finish(ctx: &StepContext, result: StepResult) {
        match live_step::<TimeoutStep>(ctx) {
            Some(step) => step.finish(ctx, result),
            None => deliver(ctx, result),
        }
    }
}

impl BodyCallback for TimeoutCallback {
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        Self::finish(ctx, Ok(value));
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        Self::finish(ctx, Err(cause));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use crate::errors::RunResult;
    use crate::execution::Rehydrator;
    use crate::testing::{assert_failed_with, flow_fixture, ScriptedBody};
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_slow_body_is_interrupted() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sleeping(Duration::from_secs(10), serde_json::json!("late"));
        let launched = fixture.flow.launch(Some(body), timeout(Duration::from_secs(5)));

        let err = launched.outcome().await.unwrap_err();
        let interrupted = err.interruption().cloned().unwrap();
        assert_eq!(interrupted.result, RunResult::Aborted);
        assert_eq!(
            interrupted.causes,
            vec![InterruptCause::timed_out(Duration::from_secs(5))]
        );
        assert!(fixture.console.contains("Timeout has been exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_body_passes_through() {
        let fixture = flow_fixture();
        let body = ScriptedBody::sleeping(Duration::from_secs(1), serde_json::json!(7));
        let launched = fixture.flow.launch(Some(body), timeout(Duration::from_secs(5)));

        assert_eq!(launched.outcome().await, Ok(serde_json::json!(7)));
        assert!(!fixture.console.contains("Timeout has been exceeded"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_firing_is_still_an_interruption() {
        let fixture = flow_fixture();
        let body = ScriptedBody::pending();
        let launched = fixture.flow.launch(Some(body.clone()), timeout(Duration::from_secs(5)));
        body.wait_for_calls(1).await;

        let step = launched.unit().downcast::<TimeoutStep>().unwrap();
        step.fired.store(true, Ordering::SeqCst);
        step.finish(launched.context(), Ok(serde_json::json!("ok")));

        let err = launched.outcome().await.unwrap_err();
        assert!(err.is_interruption());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_rearms_for_the_remaining_time() {
        let fixture = flow_fixture();
        let body = ScriptedBody::pending();
        let launched = fixture.flow.launch(Some(body.clone()), timeout(Duration::from_secs(5)));
        body.wait_for_calls(1).await;

        let persisted = launched.unit().suspend().unwrap();
        let step = launched.unit().downcast::<TimeoutStep>().unwrap();
        assert!(step.killer.lock().is_none());
        assert!(matches!(persisted.state, StepSnapshot::Timeout { fired: false, .. }));

        assert!(launched.unit().resume());
        assert!(step.killer.lock().is_some());
        assert!(launched.outcome().await.unwrap_err().is_interruption());
    }

    #[tokio::test(start_paused = true)]
    async fn test_body_lost_in_restart_fails_instead_of_waiting() {
        let fixture = flow_fixture();
        let body = ScriptedBody::pending();
        let launched = fixture.flow.launch(Some(body.clone()), timeout(Duration::from_secs(5)));
        body.wait_for_calls(1).await;
        let persisted = launched.unit().suspend().unwrap();

        let restarted = fixture.restarted();
        let rehydrator = Rehydrator::new(restarted.loader.clone(), RuntimeConfig::default());
        let unit = persisted.rehydrate(&rehydrator).unwrap();
        assert!(unit.resume());

        let step = unit.downcast::<TimeoutStep>().unwrap();
        assert!(step.killer.lock().is_none());
        assert_failed_with(&launched.outcome().await, "did not survive the restart");
    }
}
