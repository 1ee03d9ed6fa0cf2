//! Scripted bodies and recording callbacks.

use crate::body::{deliver, Body, BodyCallback};
use crate::context::{StepContext, StepId};
use crate::errors::{StepError, StepResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

enum Script {
    Sequence(Vec<StepResult>),
    Gated(Vec<StepResult>),
    Pending,
    Sleeping(Duration, serde_json::Value),
}

/// A body that plays back a script, one entry per invocation.
///
/// Once the script is exhausted the last entry repeats.
pub struct ScriptedBody {
    script: Script,
    calls: AtomicUsize,
    called: Notify,
    gate: Arc<Semaphore>,
    contexts: Mutex<Vec<StepId>>,
}

impl ScriptedBody {
    fn with_script(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: AtomicUsize::new(0),
            called: Notify::new(),
            gate: Arc::new(Semaphore::new(0)),
            contexts: Mutex::new(Vec::new()),
        })
    }

    /// Returns the given outcomes in order.
    #[must_use]
    pub fn sequence(outcomes: Vec<StepResult>) -> Arc<Self> {
        Self::with_script(Script::Sequence(outcomes))
    }

    /// Fails `failures` times with `attempt N failed`, then succeeds with `value`.
    #[must_use]
    pub fn failing_then(failures: usize, value: serde_json::Value) -> Arc<Self> {
        let mut outcomes: Vec<StepResult> = (1..=failures)
            .map(|attempt| Err(StepError::failed(format!("attempt {attempt} failed"))))
            .collect();
        outcomes.push(Ok(value));
        Self::sequence(outcomes)
    }

    /// Like [`ScriptedBody::sequence`], but each run waits for a [`ScriptedBody::release`].
    #[must_use]
    pub fn gated(outcomes: Vec<StepResult>) -> Arc<Self> {
        Self::with_script(Script::Gated(outcomes))
    }

    /// Lets one waiting (or future) gated run finish.
    pub fn release(&self) {
        self.gate.add_permits(1);
    }

    /// Never finishes on its own.
    #[must_use]
    pub fn pending() -> Arc<Self> {
        Self::with_script(Script::Pending)
    }

    /// Sleeps for `span`, then succeeds with `value`.
    #[must_use]
    pub fn sleeping(span: Duration, value: serde_json::Value) -> Arc<Self> {
        Self::with_script(Script::Sleeping(span, value))
    }

    /// How many times the body was evaluated.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The body contexts it was evaluated with, in order.
    #[must_use]
    pub fn contexts(&self) -> Vec<StepId> {
        self.contexts.lock().clone()
    }

    /// Waits until the body was evaluated at least `count` times.
    pub async fn wait_for_calls(&self, count: usize) {
        loop {
            let called = self.called.notified();
            if self.calls() >= count {
                return;
            }
            called.await;
        }
    }
}

impl Body for ScriptedBody {
    fn evaluate(&self, ctx: StepContext) -> BoxFuture<'static, StepResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.contexts.lock().push(ctx.step_id());
        self.called.notify_waiters();
        match &self.script {
            Script::Sequence(outcomes) => {
                let outcome = pick(outcomes, call);
                async move { outcome }.boxed()
            }
            Script::Gated(outcomes) => {
                let outcome = pick(outcomes, call);
                let gate = self.gate.clone();
                async move {
                    if let Ok(permit) = gate.acquire().await {
                        permit.forget();
                    }
                    outcome
                }
                .boxed()
            }
            Script::Pending => futures::future::pending().boxed(),
            Script::Sleeping(span, value) => {
                let (span, value) = (*span, value.clone());
                async move {
                    tokio::time::sleep(span).await;
                    Ok(value)
                }
                .boxed()
            }
        }
    }
}

fn pick(outcomes: &[StepResult], call: usize) -> StepResult {
    outcomes
        .get(call)
        .or_else(|| outcomes.last())
        .cloned()
        .unwrap_or(Ok(serde_json::Value::Null))
}

/// Wraps another body and counts its evaluations.
pub struct CountingBody {
    inner: Arc<dyn Body>,
    calls: AtomicUsize,
}

impl CountingBody {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Arc<dyn Body>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicUsize::new(0),
        })
    }

    /// How many times the body was evaluated.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Body for CountingBody {
    fn evaluate(&self, ctx: StepContext) -> BoxFuture<'static, StepResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.evaluate(ctx)
    }
}

/// One callback invocation seen by a [`RecordingCallback`].
#[derive(Debug, Clone, PartialEq)]
pub enum RecordedEvent {
    /// `on_start`.
    Started(StepId),
    /// `on_success` with the value.
    Succeeded(StepId, serde_json::Value),
    /// `on_failure` with the cause.
    Failed(StepId, StepError),
}

/// A callback that records what it saw and optionally forwards the outcome.
#[derive(Default)]
pub struct RecordingCallback {
    events: Mutex<Vec<RecordedEvent>>,
    forward: bool,
}

impl RecordingCallback {
    /// Records only.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Records, then completes the invoking step with the body outcome.
    #[must_use]
    pub fn forwarding() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            forward: true,
        })
    }

    /// Everything recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }
}

impl BodyCallback for RecordingCallback {
    fn on_start(&self, ctx: &StepContext) {
        self.events.lock().push(RecordedEvent::Started(ctx.step_id()));
    }

    fn on_success(&self, ctx: &StepContext, value: serde_json::Value) {
        self.events
            .lock()
            .push(RecordedEvent::Succeeded(ctx.step_id(), value.clone()));
        if self.forward {
            deliver(ctx, Ok(value));
        }
    }

    fn on_failure(&self, ctx: &StepContext, cause: StepError) {
        self.events
            .lock()
            .push(RecordedEvent::Failed(ctx.step_id(), cause.clone()));
        if self.forward {
            deliver(ctx, Err(cause));
        }
    }
}
