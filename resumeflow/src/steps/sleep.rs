//! Wait for a fixed span of time.

use super::spawn_timer;
use crate::body::deliver;
use crate::context::StepContext;
use crate::errors::StepError;
use crate::execution::{StepExecution, StepSnapshot};
use crate::utils::{deadline_after, format_duration, remaining_until};
use parking_lot::Mutex;
use std::any::Any;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Creates a sleep step.
pub fn sleep(span: Duration) -> impl FnOnce(StepContext) -> Arc<dyn StepExecution> + Send {
    move |ctx| {
        let step: Arc<dyn StepExecution> = SleepStep::new(ctx, span);
        step
    }
}

/// Succeeds once its end time is reached. The end time is absolute, so a
/// restart only waits for what is left.
pub struct SleepStep {
    ctx: StepContext,
    span: Duration,
    end_ms: AtomicI64,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl SleepStep {
    /// Creates the step.
    #[must_use]
    pub fn new(ctx: StepContext, span: Duration) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            span,
            end_ms: AtomicI64::new(0),
            timer: Mutex::new(None),
        })
    }

    pub(crate) fn rehydrate(ctx: StepContext, end_ms: i64) -> Arc<Self> {
        let step = Self::new(ctx, Duration::ZERO);
        step.end_ms.store(end_ms, Ordering::SeqCst);
        step
    }

    /// The absolute end time in epoch milliseconds.
    #[must_use]
    pub fn end_ms(&self) -> i64 {
        self.end_ms.load(Ordering::SeqCst)
    }

    fn arm(&self) {
        let left = remaining_until(self.end_ms());
        let ctx = self.ctx.clone();
        let timer = spawn_timer(&self.ctx, async move {
            tokio::time::sleep(left).await;
            deliver(&ctx, Ok(serde_json::Value::Null));
        });
        *self.timer.lock() = timer;
    }
}

impl StepExecution for SleepStep {
    fn context(&self) -> &StepContext {
        &self.ctx
    }

    fn name(&self) -> &'static str {
        "sleep"
    }

    fn start(self: Arc<Self>) -> Result<bool, StepError> {
        if self.span.is_zero() {
            self.ctx.succeed(serde_json::Value::Null)?;
            return Ok(true);
        }
        self.end_ms.store(deadline_after(self.span), Ordering::SeqCst);
        self.ctx
            .println(format!("Sleeping for {}", format_duration(self.span)));
        self.arm();
        Ok(false)
    }

    fn stop(&self, cause: StepError) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
        deliver(&self.ctx, Err(cause));
    }

    fn on_suspend(&self) {
        if let Some(timer) = self.timer.lock().take() {
            timer.abort();
        }
    }

    fn on_resume(self: Arc<Self>) {
        self.arm();
    }

    fn snapshot(&self) -> StepSnapshot {
        StepSnapshot::Sleep {
            end_ms: self.end_ms(),
        }
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
