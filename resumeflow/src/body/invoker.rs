//! Builder that launches a step's body.

use super::handle::BodySink;
use super::{Body, BodyCallback, BodyExecution};
use crate::context::{Completion, ContextOverrides, Contextual, StepContext, StepId};
use crate::errors::ContextError;
use crate::execution::{BlockMarker, ContextBinding};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Accumulates overrides, a label and a callback, then launches the body.
pub struct BodyInvoker {
    context: StepContext,
    overrides: ContextOverrides,
    label: Option<String>,
    callback: Option<Arc<dyn BodyCallback>>,
}

impl BodyInvoker {
    pub(crate) fn new(context: StepContext) -> Self {
        Self {
            context,
            overrides: ContextOverrides::new(),
            label: None,
            callback: None,
        }
    }

    /// Overrides a contextual value for the body.
    ///
    /// Repeated overrides of one type are merged with that type's merge rule.
    #[must_use]
    pub fn with_context<T: Contextual>(mut self, value: T) -> Self {
        self.overrides.add(value);
        self
    }

    /// Labels the body. Anonymous bodies leave no structural marker.
    #[must_use]
    pub fn with_display_name(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// Sets the completion callback.
    #[must_use]
    pub fn with_callback(mut self, callback: Arc<dyn BodyCallback>) -> Self {
        if self.callback.is_some() {
            warn!(step = %self.context.step_id(), "Replacing body callback");
        }
        self.callback = Some(callback);
        self
    }

    /// Launches the body on the current tokio runtime.
    pub fn start(self) -> Result<BodyExecution, ContextError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| ContextError::NoRuntime)?;
        let (execution, binding) = self.context.binding()?;
        let body = binding.body.clone().ok_or_else(|| ContextError::NoBody {
            step: self.context.step_id().to_string(),
        })?;

        let handle = BodyExecution::new(self.context.clone(), self.label);
        if let Some(callback) = self.callback {
            handle.push_callback(callback);
        }

        let step = StepId::new();
        let body_ctx = StepContext::new(
            execution.clone(),
            step,
            ContextBinding {
                variables: binding.variables.overlay(&self.overrides),
                completion: Completion::new(step, Arc::new(BodySink(handle.downgrade()))),
                body: None,
                scope: Some(handle.downgrade()),
            },
        );
        handle.attach(body_ctx.clone());
        execution.state().record_body(handle.clone());
        if let Some(label) = handle.label() {
            execution.state().mark(BlockMarker::Start {
                body: handle.id(),
                label: label.to_string(),
            });
        }

        debug!(
            step = %self.context.step_id(),
            body = %handle.id(),
            overrides = self.overrides.len(),
            "Launching body"
        );
        handle.fire_on_start();
        runtime.spawn(drive(handle.clone(), body, body_ctx));
        Ok(handle)
    }
}

async fn drive(handle: BodyExecution, body: Arc<dyn Body>, ctx: StepContext) {
    let evaluation = body.evaluate(ctx.clone());
    tokio::pin!(evaluation);
    let mut watching = true;

    let result = loop {
        tokio::select! {
            result = &mut evaluation => break result,
            cause = handle.cancelled(), if watching => {
                watching = false;
                if handle.current_executions().is_empty() {
                    debug!(body = %handle.id(), "Cutting off body with no running steps");
                    break Err(cause);
                }
            }
        }
    };

    if let Err(err) = ctx.complete(result) {
        warn!(body = %handle.id(), error = %err, "Body outcome was rejected");
    }
}

impl fmt::Debug for BodyInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BodyInvoker")
            .field("step", &self.context.step_id())
            .field("overrides", &self.overrides)
            .field("label", &self.label)
            .field("has_callback", &self.callback.is_some())
            .finish()
    }
}
