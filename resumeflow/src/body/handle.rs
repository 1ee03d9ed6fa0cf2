//! The handle of one running body.

use super::BodyCallback;
use crate::cancellation::CancellationToken;
use crate::context::{BodyId, CompletionSink, StepContext, StepId};
use crate::errors::{FlowInterrupted, InterruptCause, RunResult, StepError, StepResult};
use crate::execution::{BlockMarker, UnitOfWork};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, warn};

pub(crate) struct BodyShared {
    id: BodyId,
    label: Option<String>,
    invoker: StepContext,
    body_ctx: OnceLock<StepContext>,
    outcome: Mutex<Option<StepResult>>,
    callbacks: Mutex<Vec<Arc<dyn BodyCallback>>>,
    token: CancellationToken,
    current: Mutex<HashMap<StepId, Arc<UnitOfWork>>>,
}

/// A running (or finished) body invocation.
#[derive(Clone)]
pub struct BodyExecution {
    shared: Arc<BodyShared>,
}

/// A non-owning reference to a body, held by the steps running inside it.
#[derive(Clone)]
pub struct WeakBody(Weak<BodyShared>);

impl WeakBody {
    /// Returns the body if it is still alive.
    #[must_use]
    pub fn upgrade(&self) -> Option<BodyExecution> {
        self.0.upgrade().map(|shared| BodyExecution { shared })
    }
}

impl fmt::Debug for WeakBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WeakBody").finish()
    }
}

impl BodyExecution {
    pub(crate) fn new(invoker: StepContext, label: Option<String>) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<BodyShared>| {
            let token = CancellationToken::new();
            let weak = WeakBody(weak.clone());
            token.on_cancel(move |cause| {
                if let Some(body) = weak.upgrade() {
                    body.stop_current(cause);
                }
            });
            BodyShared {
                id: BodyId::new(),
                label,
                invoker,
                body_ctx: OnceLock::new(),
                outcome: Mutex::new(None),
                callbacks: Mutex::new(Vec::new()),
                token,
                current: Mutex::new(HashMap::new()),
            }
        });
        Self { shared }
    }

    /// The body identifier.
    #[must_use]
    pub fn id(&self) -> BodyId {
        self.shared.id
    }

    /// The display label, if the body is not anonymous.
    #[must_use]
    pub fn label(&self) -> Option<&str> {
        self.shared.label.as_deref()
    }

    /// The step that launched this body.
    #[must_use]
    pub fn invoker(&self) -> &StepContext {
        &self.shared.invoker
    }

    /// Requests cancellation of the body.
    ///
    /// Inner steps are stopped with `cause`. A body with no inner step in
    /// flight is cut off at its next await point. Returns false if the body
    /// already finished or was already cancelled.
    pub fn cancel(&self, cause: StepError) -> bool {
        if self.is_done() {
            debug!(body = %self.id(), "Ignoring cancel of a finished body");
            return false;
        }
        self.shared.token.cancel(cause)
    }

    fn stop_current(&self, cause: &StepError) {
        let current = self.current_executions();
        debug!(body = %self.id(), running = current.len(), cause = %cause, "Cancelling body");
        for unit in current {
            unit.stop(cause.clone());
        }
    }

    /// Cancels with an interruption built from `result` and `causes`.
    pub fn cancel_with(&self, result: RunResult, causes: Vec<InterruptCause>) -> bool {
        self.cancel(StepError::Interrupted(FlowInterrupted { result, causes }))
    }

    /// Adds a completion listener. Fires immediately if the body already finished.
    pub fn add_callback(&self, callback: Arc<dyn BodyCallback>) {
        let outcome = {
            let mut callbacks = self.shared.callbacks.lock();
            let outcome = self.shared.outcome.lock().clone();
            if outcome.is_none() {
                callbacks.push(callback.clone());
            }
            outcome
        };
        if let Some(result) = outcome {
            self.fire(&callback, result);
        }
    }

    /// The inner steps currently running inside this body.
    #[must_use]
    pub fn current_executions(&self) -> Vec<Arc<UnitOfWork>> {
        self.shared.current.lock().values().cloned().collect()
    }

    /// Returns true once the body finished.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.outcome.lock().is_some()
    }

    /// The outcome, once finished.
    #[must_use]
    pub fn outcome(&self) -> Option<StepResult> {
        self.shared.outcome.lock().clone()
    }

    /// Returns true if cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.shared.token.is_cancelled()
    }

    /// Returns a weak reference.
    #[must_use]
    pub fn downgrade(&self) -> WeakBody {
        WeakBody(Arc::downgrade(&self.shared))
    }

    pub(crate) fn attach(&self, body_ctx: StepContext) {
        let _ = self.shared.body_ctx.set(body_ctx);
    }

    pub(crate) fn push_callback(&self, callback: Arc<dyn BodyCallback>) {
        self.shared.callbacks.lock().push(callback);
    }

    pub(crate) async fn cancelled(&self) -> StepError {
        self.shared.token.cancelled().await
    }

    pub(crate) fn run_unit(&self, unit: &Arc<UnitOfWork>) {
        self.shared.current.lock().insert(unit.step_id(), unit.clone());
        if let Some(cause) = self.shared.token.cause() {
            unit.stop(cause);
        }
        unit.start();
    }

    pub(crate) fn leave(&self, step: StepId) {
        self.shared.current.lock().remove(&step);
    }

    pub(crate) fn fire_on_start(&self) {
        let ctx = self.callback_context();
        let callbacks = self.shared.callbacks.lock().clone();
        for callback in callbacks {
            guarded(|| callback.on_start(&ctx));
        }
    }

    fn deliver(&self, result: StepResult) {
        let callbacks = {
            let mut callbacks = self.shared.callbacks.lock();
            let mut outcome = self.shared.outcome.lock();
            if outcome.is_some() {
                error!(body = %self.id(), "Body finished twice");
                return;
            }
            *outcome = Some(result.clone());
            std::mem::take(&mut *callbacks)
        };
        self.shared.current.lock().clear();

        if let Some(label) = self.label() {
            match self.shared.invoker.execution() {
                Ok(execution) => execution.state().mark(BlockMarker::End {
                    body: self.id(),
                    label: label.to_string(),
                    failed: result.is_err(),
                }),
                Err(err) => warn!(body = %self.id(), error = %err, "Could not record block end"),
            }
        }

        for callback in &callbacks {
            self.fire(callback, result.clone());
        }
    }

    fn fire(&self, callback: &Arc<dyn BodyCallback>, result: StepResult) {
        let ctx = self.callback_context();
        guarded(|| match result {
            Ok(value) => callback.on_success(&ctx, value),
            Err(cause) => callback.on_failure(&ctx, cause),
        });
    }

    fn callback_context(&self) -> StepContext {
        let invoker = &self.shared.invoker;
        self.shared
            .body_ctx
            .get()
            .and_then(|body_ctx| body_ctx.variables().ok())
            .and_then(|variables| invoker.sub_context(variables).ok())
            .unwrap_or_else(|| invoker.clone())
    }
}

fn guarded<F: FnOnce()>(f: F) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(f)) {
        warn!("Body callback panicked: {:?}", e);
    }
}

pub(crate) struct BodySink(pub(crate) WeakBody);

impl CompletionSink for BodySink {
    fn deliver(&self, step: StepId, result: StepResult) {
        match self.0.upgrade() {
            Some(body) => body.deliver(result),
            None => warn!(step = %step, "Body finished after its handle was dropped"),
        }
    }
}

impl fmt::Debug for BodyExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyExecution")
            .field("id", &self.id())
            .field("label", &self.label())
            .field("done", &self.is_done())
            .field("cancelled", &self.is_cancelled())
            .field("running", &self.shared.current.lock().len())
            .finish()
    }
}
