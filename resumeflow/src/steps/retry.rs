//! Run a body up to N times.

use super::{find_body, live_step, lost_body};
use crate::body::{deliver, BodyCallback, BodyExecution};
use crate::context::{BodyId, StepContext};
use crate::errors::StepError;
use crate::execution::{StepExecution, StepSnapshot};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Creates a retry step allowing `attempts` runs of its body.
pub fn retry(attempts: u32) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = RetryStep::new(ctx, attempts);
        step
    }
}

/// Reruns its body after each failure until the attempts are used up.
///
/// The body callback keeps no counters of its own. It reads them through
/// the live step, so a rehydrated step takes over the running body.
pub struct RetryStep {
    ctx: StepContext,
    attempts: u32,
    remaining: AtomicU32,
    stopped: AtomicBool,
    body: Mutex<Option<BodyExecution>>,
    lost: Option<BodyId>,
}

impl RetryStep {
    /// Creates the step. Zero attempts is treated as one.
    #[must_use]
    pub fn new(ctx: StepContext, attempts: u32) -> Arc<Self> {
        let attempts = attempts.max(1);
        Arc::new(Self {
            ctx,
            attempts,
            remaining: AtomicU32::new(attempts),
            stopped: AtomicBool::new(false),
            body: Mutex::new(None),
            lost: None,
        })
    }

    pub(crate) fn rehydrate(
        ctx: StepContext,
        attempts: u32,
        remaining: u32,
        body: Option<BodyId>,
    ) -> Arc<Self> {
        let restored = find_body(&ctx, body);
        Arc::new(Self {
            ctx,
            attempts: attempts.max(1),
            remaining: AtomicU32::new(remaining),
            stopped: AtomicBool::new(false),
            body: Mutex::new(restored.live()),
            lost: restored.lost(),
        })
    }

    /// Attempts left, including the one in flight.
    #[must_use]
    pub fn remaining(&self) -> u32 {
        self.remaining.load(Ordering::SeqCst)
    }

    fn track(&self, body: BodyExecution) {
        *self.body.lock() = Some(body);
    }

    fn launch(&self) -> Result<(), StepError> {
        let body = self
            .ctx
            .new_body_invoker()
            .with_callback(Arc::new(RetryCallback))
            .start()?;
        self.track(body);
        Ok(())
    }

    fn failed(&self, ctx: &StepContext, cause: StepError) {
        if cause.is_interruption() || self.stopped.load(Ordering::SeqCst) {
            debug!(step = %ctx.step_id(), "Not retrying a stopped body");
            deliver(ctx, Err(cause));
            return;
        }
        let left = self.remaining.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if left == 0 {
            deliver(ctx, Err(cause));
            return;
        }
        ctx.println(format!("ERROR: {cause}"));
        ctx.println("Retrying");
        info!(step = %ctx.step_id(), left, "Retrying body");
        if let Err(err) = self.launch() {
            deliver(ctx, Err(err));
        }
    }
}

impl StepExecution for RetryStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "retry"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        self.launch()?;
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        self.stopped.store(true, Ordering::SeqCst);
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
        StepSnapshot::Retry {
            attempts: self.attempts,
            remaining: self.remaining(),
            body: self.body.lock().as_ref().map(BodyExecution::id).or(self.lost),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

struct RetryCallback;

impl BodyCallback for RetryCallback {
    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        deliver(ctx, Ok(value));
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        match live_step::<RetryStep>(ctx) {
            Some(step) => step.failed(ctx, cause),
            None => {
                warn!(step = %ctx.step_id(), "Retry step vanished while its body ran");
                deliver(ctx, Err(cause));
            }
        }
    }
}
