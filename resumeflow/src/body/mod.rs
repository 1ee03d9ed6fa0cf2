//! Nested block invocation.
//!
//! A block-taking step (retry, timeout, worker allocation) launches its body
//! through a [`BodyInvoker`] and gets back a [`BodyExecution`] handle. The
//! outcome of the body is reported to [`BodyCallback`]s, which decide how the
//! invoking step continues.

mod callback;
mod handle;
mod invoker;


pub use callback::{deliver, BodyCallback, ForwardOutcome, TailCall};
pub use handle::{BodyExecution, WeakBody};
pub use invoker::BodyInvoker;

use crate::context::StepContext;
use crate::errors::StepResult;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::Arc;

/// A nested block of work.
///
/// The host supplies bodies; this crate only launches and supervises them.
pub trait Body: Send + Sync {
    /// Runs the block with the context scoped to this invocation.
    fn evaluate(&self, ctx: StepContext) -> BoxFuture<'static, StepResult>;
}

/// A body backed by an async closure.
pub struct FnBody<F> {
    func: F,
}

impl<F, Fut> FnBody<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    /// Creates a body from a closure.
    #[must_use]
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F, Fut> Body for FnBody<F>
where
    F: Fn(StepContext) -> Fut + Send + Sync,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    fn evaluate(&self, ctx: StepContext) -> BoxFuture<'static, StepResult> {
        (self.func)(ctx).boxed()
    }
}

/// Wraps an async closure as a shared body.
#[must_use]
pub fn body_fn<F, Fut>(func: F) -> Arc<dyn Body>
where
    F: Fn(StepContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = StepResult> + Send + 'static,
{
    Arc::new(FnBody::new(func))
}
