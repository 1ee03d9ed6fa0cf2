//! Startup recovery.

use super::ExecutionRegistry;
use crate::execution::LifecycleState;
use tracing::{debug, info};

/// Resumes every suspended unit of work of every live execution.
///
/// Units whose context is still rebinding are skipped; they resume when the
/// host next calls this. Returns the number of units resumed.
pub fn resume_all(registry: &ExecutionRegistry) -> usize {
    let mut resumed = 0;
    for execution in registry.iter() {
        for unit in execution.state().current_executions() {
            if unit.state() != LifecycleState::Suspended {
                continue;
            }
            if !unit.context().is_ready() {
                debug!(owner = %execution.owner(), step = %unit.step_id(), "Context not ready; resuming later");
                continue;
            }
            if unit.resume() {
                resumed += 1;
            }
        }
    }
    info!(resumed, "Resumed suspended steps");
    resumed
}
