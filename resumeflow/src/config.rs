//! Runtime configuration.

use crate::errors::{FlowError, RunResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Configuration for condition polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollingConfig {
    /// Shortest delay between two polls, in milliseconds.
    #[serde(default = "default_min_recurrence_ms")]
    pub min_recurrence_ms: u64,
    /// Growth factor applied to the delay after each negative poll.
    #[serde(default = "default_recurrence_factor")]
    pub recurrence_factor: f64,
}

fn default_min_recurrence_ms() -> u64 {
    250
}

fn default_recurrence_factor() -> f64 {
    1.2
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            min_recurrence_ms: default_min_recurrence_ms(),
            recurrence_factor: default_recurrence_factor(),
        }
    }
}

impl PollingConfig {
    /// The minimum delay.
    #[must_use]
    pub fn min_recurrence(&self) -> Duration {
        Duration::from_millis(self.min_recurrence_ms)
    }

    /// The delay after `current`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss, clippy::cast_precision_loss)]
    pub fn next_recurrence(&self, current: Duration) -> Duration {
        let nanos = (current.as_nanos() as f64 * self.recurrence_factor).round();
        Duration::from_nanos(nanos.min(u64::MAX as f64) as u64)
    }
}

/// Configuration for the whole runtime.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Directory holding persisted records.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Record key of the execution registry.
    #[serde(default = "default_registry_key")]
    pub registry_key: String,
    /// Record key of the gate table.
    #[serde(default = "default_gates_key")]
    pub gates_key: String,
    /// Whether file writes are synced before the rename.
    #[serde(default = "default_sync_writes")]
    pub sync_writes: bool,
    /// Condition polling.
    #[serde(default)]
    pub polling: PollingConfig,
    /// Attempts a retry block gets when none are given.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Result recorded when a caught error is swallowed.
    #[serde(default = "default_catch_error_result")]
    pub catch_error_result: RunResult,
    /// Name prefix of worker threads.
    #[serde(default = "default_worker_thread_prefix")]
    pub worker_thread_prefix: String,
    /// Environment variable carrying the worker cookie.
    #[serde(default = "default_cookie_variable")]
    pub cookie_variable: String,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_registry_key() -> String {
    "flow-executions.json".to_string()
}

fn default_gates_key() -> String {
    "segment-gates.json".to_string()
}

fn default_sync_writes() -> bool {
    true
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_catch_error_result() -> RunResult {
    RunResult::Failure
}

fn default_worker_thread_prefix() -> String {
    "resumeflow-worker".to_string()
}

fn default_cookie_variable() -> String {
    "RESUMEFLOW_SERVER_COOKIE".to_string()
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            registry_key: default_registry_key(),
            gates_key: default_gates_key(),
            sync_writes: default_sync_writes(),
            polling: PollingConfig::default(),
            retry_attempts: default_retry_attempts(),
            catch_error_result: default_catch_error_result(),
            worker_thread_prefix: default_worker_thread_prefix(),
            cookie_variable: default_cookie_variable(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, FlowError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| FlowError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, FlowError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Checks value ranges.
    pub fn validate(&self) -> Result<(), FlowError> {
        if self.polling.min_recurrence_ms == 0 {
            return Err(FlowError::Config("polling.min_recurrence_ms must be positive".into()));
        }
        if !(self.polling.recurrence_factor >= 1.0) {
            return Err(FlowError::Config("polling.recurrence_factor must be at least 1.0".into()));
        }
        if self.retry_attempts == 0 {
            return Err(FlowError::Config("retry_attempts must be positive".into()));
        }
        if self.cookie_variable.is_empty() {
            return Err(FlowError::Config("cookie_variable must not be empty".into()));
        }
        Ok(())
    }

    /// Sets the state directory.
    #[must_use]
    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }

    /// Sets the polling configuration.
    #[must_use]
    pub fn with_polling(mut self, min_recurrence: Duration, factor: f64) -> Self {
        self.polling = PollingConfig {
            min_recurrence_ms: u64::try_from(min_recurrence.as_millis()).unwrap_or(u64::MAX),
            recurrence_factor: factor,
        };
        self
    }

    /// Sets whether file writes are synced.
    #[must_use]
    pub fn with_sync_writes(mut self, sync: bool) -> Self {
        self.sync_writes = sync;
        self
    }

    /// Sets the default retry budget.
    #[must_use]
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Sets the result recorded by caught errors.
    #[must_use]
    pub fn with_catch_error_result(mut self, result: RunResult) -> Self {
        self.catch_error_result = result;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.polling.min_recurrence(), Duration::from_millis(250));
        assert!((config.polling.recurrence_factor - 1.2).abs() < f64::EPSILON);
        assert_eq!(config.registry_key, "flow-executions.json");
        assert_eq!(config.catch_error_result, RunResult::Failure);
        assert_eq!(config.retry_attempts, 3);
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config = RuntimeConfig::from_json_str(
            r#"{"state_dir": "/var/lib/flows", "polling": {"min_recurrence_ms": 100}}"#,
        )
        .unwrap();
        assert_eq!(config.state_dir, PathBuf::from("/var/lib/flows"));
        assert_eq!(config.polling.min_recurrence_ms, 100);
        assert!((config.polling.recurrence_factor - 1.2).abs() < f64::EPSILON);
        assert!(config.sync_writes);
    }

    #[test]
    fn test_rejects_shrinking_factor() {
        let err = RuntimeConfig::from_json_str(r#"{"polling": {"recurrence_factor": 0.5}}"#);
        assert!(matches!(err, Err(FlowError::Config(_))));
    }

    #[test]
    fn test_rejects_zero_retry_attempts() {
        let err = RuntimeConfig::from_json_str(r#"{"retry_attempts": 0}"#);
        assert!(matches!(err, Err(FlowError::Config(_))));
    }

    #[test]
    fn test_next_recurrence_grows() {
        let polling = PollingConfig::default();
        let next = polling.next_recurrence(Duration::from_millis(250));
        assert_eq!(next, Duration::from_millis(300));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runtime.json");
        std::fs::write(&path, r#"{"catch_error_result": "UNSTABLE"}"#).unwrap();

        let config = RuntimeConfig::load(&path).unwrap();
        assert_eq!(config.catch_error_result, RunResult::Unstable);
    }
}
