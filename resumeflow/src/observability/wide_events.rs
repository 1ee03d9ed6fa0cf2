//! One wide event per finished flow.

use crate::context::ExecutionOwner;
use crate::errors::RunResult;
use crate::host::RunListener;
use dashmap::DashMap;
use std::time::Instant;
use tracing::info;

/// Emits a single structured event when a flow finishes.
///
/// Call [`WideEventListener::started`] when a flow is launched to get its
/// duration in the payload.
#[derive(Debug)]
pub struct WideEventListener {
    event_type: String,
    started: DashMap<ExecutionOwner, Instant>,
}

impl Default for WideEventListener {
    fn default() -> Self {
        Self {
            event_type: "flow.wide".to_string(),
            started: DashMap::new(),
        }
    }
}

impl WideEventListener {
    /// Creates a listener emitting `flow.wide` events.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the launch time of `owner`.
    pub fn started(&self, owner: &ExecutionOwner) {
        self.started.insert(owner.clone(), Instant::now());
    }

    /// Builds the payload of a finished flow.
    #[must_use]
    pub fn build_payload(owner: &ExecutionOwner, result: RunResult, duration_ms: Option<f64>) -> serde_json::Value {
        let mut payload = serde_json::json!({
            "job": owner.job,
            "build": owner.build,
            "result": result,
            "failed": result.is_worse_or_equal_to(RunResult::Failure),
        });
        if let Some(duration_ms) = duration_ms {
            payload["duration_ms"] = serde_json::json!(duration_ms);
        }
        payload
    }
}

impl RunListener for WideEventListener {
    fn on_completed(&self, owner: &ExecutionOwner, result: RunResult) {
        let duration_ms = self
            .started
            .remove(owner)
            .map(|(_, started)| started.elapsed().as_secs_f64() * 1000.0);
        let payload = Self::build_payload(owner, result, duration_ms);
        info!(event_type = %self.event_type, payload = %payload, "Flow finished");
    }
}
