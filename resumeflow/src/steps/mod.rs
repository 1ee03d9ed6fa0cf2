//! The canonical suspend/resume step kinds.
//!
//! Each step is constructed by a factory function (`retry(3)`,
//! `timeout(..)`, ...) that the host hands to
//! [`LocalFlow::launch`](crate::host::LocalFlow::launch) or
//! [`StepContext::run_block_step`]. Body callbacks never keep the step
//! object itself: they find the live step through the execution state, so
//! a rehydrated step takes over seamlessly.

mod catch_error;
mod input;
mod retry;
mod sleep;
mod timeout;
mod wait_until;

pub use catch_error::{catch_error, catch_error_default, CatchErrorStep};
pub use input::{input, InputStep, PendingInputs};
pub use retry::{retry, RetryStep};
pub use sleep::{sleep, SleepStep};
pub use timeout::{timeout, TimeoutStep};
pub use wait_until::{wait_until, WaitUntilStep};

use crate::body::BodyExecution;
use crate::context::{BodyId, StepContext};
use crate::errors::StepError;
use crate::execution::StepExecution;
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::warn;

/// Finds the live step of type `T` that owns `ctx`.
pub(crate) fn live_step<T: StepExecution + 'static>(ctx: &StepContext) -> Option<Arc<T>> {
    let execution = ctx.execution().ok()?;
    execution.state().unit(ctx.step_id())?.downcast::<T>()
}

/// A body reference read back from a step snapshot.
#[derive(Debug, Clone, Default)]
pub(crate) enum RestoredBody {
    /// No body had been launched.
    #[default]
    Absent,
    /// The body is still running in this process.
    Live(BodyExecution),
    /// The body was launched but its handle did not survive the restart.
    Lost(BodyId),
}

impl RestoredBody {
    pub(crate) fn live(&self) -> Option<BodyExecution> {
        match self {
            Self::Live(body) => Some(body.clone()),
            _ => None,
        }
    }

    pub(crate) fn lost(&self) -> Option<BodyId> {
        match self {
            Self::Lost(id) => Some(*id),
            _ => None,
        }
    }
}

/// Finds a body launched before a restart.
pub(crate) fn find_body(ctx: &StepContext, id: Option<BodyId>) -> RestoredBody {
    let Some(id) = id else {
        return RestoredBody::Absent;
    };
    let found = ctx.execution().ok().and_then(|execution| execution.state().body(id));
    match found {
        Some(body) => RestoredBody::Live(body),
        None => {
            warn!(step = %ctx.step_id(), body = %id, "Body did not survive the restart");
            RestoredBody::Lost(id)
        }
    }
}

/// The failure of a step whose running body was lost across a restart.
pub(crate) fn lost_body(id: BodyId) -> StepError {
    StepError::failed(format!("Body {id} did not survive the restart"))
}

/// Spawns a timer task on the current runtime.
pub(crate) fn spawn_timer<F>(ctx: &StepContext, task: F) -> Option<JoinHandle<()>>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    match Handle::try_current() {
        Ok(handle) => Some(handle.spawn(task)),
        Err(_) => {
            warn!(step = %ctx.step_id(), "No runtime available to arm a timer");
            None
        }
    }
}
