//! Error types for the resumeflow substrate.
//!
//! Failures are split the same way the runtime treats them:
//!
//! - [`StepError`] is what a unit of work delivers through its completion sink
//!   (an ordinary failure or an interruption with structured causes).
//! - [`ContextError`], [`LoadError`], [`StoreError`] and [`GateError`] describe
//!   infrastructure and programming errors around those deliveries.
//! - [`FlowError`] is the umbrella type for callers that do not care which.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// What a unit of work delivers through its completion sink.
pub type StepResult = Result<serde_json::Value, StepError>;

/// The main error type for resumeflow operations.
#[derive(Debug, Error)]
pub enum FlowError {
    /// A unit of work failed.
    #[error("{0}")]
    Step(#[from] StepError),

    /// A context operation was rejected.
    #[error("{0}")]
    Context(#[from] ContextError),

    /// Persisted state could not be loaded.
    #[error("{0}")]
    Load(#[from] LoadError),

    /// Durable storage failed.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// A gate admission was rejected.
    #[error("{0}")]
    Gate(#[from] GateError),

    /// Configuration could not be read.
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outcome severity of a flow, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunResult {
    /// Everything went fine.
    Success,
    /// Completed, but something was flagged.
    Unstable,
    /// A step failed.
    Failure,
    /// Never ran to a meaningful point.
    NotBuilt,
    /// Stopped on purpose.
    Aborted,
}

impl RunResult {
    /// Returns the worse of two results.
    #[must_use]
    pub fn combine(self, other: Self) -> Self {
        self.max(other)
    }

    /// Returns true if `self` is at least as bad as `other`.
    #[must_use]
    pub fn is_worse_or_equal_to(self, other: Self) -> bool {
        self >= other
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Success => "SUCCESS",
            Self::Unstable => "UNSTABLE",
            Self::Failure => "FAILURE",
            Self::NotBuilt => "NOT_BUILT",
            Self::Aborted => "ABORTED",
        };
        f.write_str(name)
    }
}

/// A structured reason for interrupting a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InterruptCause {
    /// A newer build took over the waiting slot, or was already holding it.
    Superseded {
        /// The newer build number.
        by: u64,
    },
    /// A deadline elapsed.
    TimedOut {
        /// The configured limit in milliseconds.
        after_ms: u64,
    },
    /// Someone asked for the flow to stop.
    UserStop {
        /// Who asked, if known.
        user: Option<String>,
    },
    /// A pending input was rejected.
    Rejected {
        /// The input identifier.
        input_id: String,
    },
    /// Anything else.
    Other {
        /// Free-form reason.
        reason: String,
    },
}

impl InterruptCause {
    /// Creates a free-form cause.
    #[must_use]
    pub fn other(reason: impl Into<String>) -> Self {
        Self::Other {
            reason: reason.into(),
        }
    }

    /// Creates a timeout cause for the given duration.
    #[must_use]
    pub fn timed_out(after: Duration) -> Self {
        Self::TimedOut {
            after_ms: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl fmt::Display for InterruptCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded { by } => write!(f, "Superseded by #{by}"),
            Self::TimedOut { after_ms } => write!(f, "Timeout of {after_ms}ms has been exceeded"),
            Self::UserStop { user: Some(user) } => write!(f, "Aborted by {user}"),
            Self::UserStop { user: None } => f.write_str("Aborted"),
            Self::Rejected { input_id } => write!(f, "Input {input_id} was rejected"),
            Self::Other { reason } => f.write_str(reason),
        }
    }
}

/// An interruption: a result severity plus the causes that led to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowInterrupted {
    /// How the flow should be marked.
    pub result: RunResult,
    /// Why it was interrupted, most relevant first.
    pub causes: Vec<InterruptCause>,
}

impl FlowInterrupted {
    /// Creates an interruption with a single cause.
    #[must_use]
    pub fn new(result: RunResult, cause: InterruptCause) -> Self {
        Self {
            result,
            causes: vec![cause],
        }
    }

    /// Adds another cause.
    #[must_use]
    pub fn with_cause(mut self, cause: InterruptCause) -> Self {
        self.causes.push(cause);
        self
    }
}

impl fmt::Display for FlowInterrupted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Interrupted ({})", self.result)?;
        for cause in &self.causes {
            write!(f, ": {cause}")?;
        }
        Ok(())
    }
}

/// The failure cause delivered through a completion sink.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepError {
    /// An ordinary failure raised by a body or step.
    #[error("{message}")]
    Failed {
        /// Human readable message.
        message: String,
    },

    /// Explicit cancellation carrying structured causes.
    #[error("{0}")]
    Interrupted(FlowInterrupted),

    /// A body produced a value of the wrong shape.
    #[error("Condition error: {message}")]
    Condition {
        /// What was wrong.
        message: String,
    },
}

impl StepError {
    /// Creates an ordinary failure.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
        }
    }

    /// Creates an interruption with one cause.
    #[must_use]
    pub fn interrupted(result: RunResult, cause: InterruptCause) -> Self {
        Self::Interrupted(FlowInterrupted::new(result, cause))
    }

    /// Creates an aborted interruption.
    #[must_use]
    pub fn aborted(cause: InterruptCause) -> Self {
        Self::interrupted(RunResult::Aborted, cause)
    }

    /// Returns true for interruptions.
    #[must_use]
    pub fn is_interruption(&self) -> bool {
        matches!(self, Self::Interrupted(_))
    }

    /// Returns the interruption details, if any.
    #[must_use]
    pub fn interruption(&self) -> Option<&FlowInterrupted> {
        match self {
            Self::Interrupted(interrupted) => Some(interrupted),
            _ => None,
        }
    }

    /// The flow result this error implies.
    #[must_use]
    pub fn result(&self) -> RunResult {
        match self {
            Self::Interrupted(interrupted) => interrupted.result,
            _ => RunResult::Failure,
        }
    }
}

impl From<anyhow::Error> for StepError {
    fn from(err: anyhow::Error) -> Self {
        Self::failed(format!("{err:#}"))
    }
}

/// Errors raised by context operations.
#[derive(Debug, Error)]
pub enum ContextError {
    /// A second completion was attempted.
    #[error("Step {step} was already completed")]
    AlreadyCompleted {
        /// The step identifier.
        step: String,
    },

    /// The step was not given a body to invoke.
    #[error("Step {step} has no body to invoke")]
    NoBody {
        /// The step identifier.
        step: String,
    },

    /// No async runtime is available to launch a body.
    #[error("No async runtime available to launch a body")]
    NoRuntime,

    /// The backing execution could not be reconstructed.
    #[error("{0}")]
    Load(#[from] LoadError),
}

/// Errors raised while reconstructing persisted state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LoadError {
    /// The execution owner does not resolve to anything.
    #[error("No execution found for {owner}")]
    NotFound {
        /// The owner that was looked up.
        owner: String,
    },

    /// A record referenced by persisted state is gone.
    #[error("Missing {what}")]
    Missing {
        /// Description of the missing piece.
        what: String,
    },

    /// A persisted record could not be decoded.
    #[error("Corrupt record {key}: {reason}")]
    Corrupt {
        /// The record key.
        key: String,
        /// The decode failure.
        reason: String,
    },

    /// A persisted record uses a format this build does not read.
    #[error("Unsupported version {found} for {key} (expected {expected})")]
    UnsupportedVersion {
        /// The record key.
        key: String,
        /// The version found on disk.
        found: u32,
        /// The version this build writes.
        expected: u32,
    },
}

impl LoadError {
    /// Creates a not-found error.
    #[must_use]
    pub fn not_found(owner: impl fmt::Display) -> Self {
        Self::NotFound {
            owner: owner.to_string(),
        }
    }

    /// Creates a missing-record error.
    #[must_use]
    pub fn missing(what: impl Into<String>) -> Self {
        Self::Missing { what: what.into() }
    }
}

/// Errors raised by durable storage.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("IO error on {key}: {source}")]
    Io {
        /// The record key.
        key: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The single-lane writer is gone.
    #[error("Persistence lane closed")]
    LaneClosed,
}

impl StoreError {
    /// Wraps an IO error for a record key.
    #[must_use]
    pub fn io(key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            key: key.into(),
            source,
        }
    }
}

/// Errors raised by the gate controller.
#[derive(Debug, Error)]
pub enum GateError {
    /// A build tried to enter a gate it is already waiting on.
    #[error("Build #{build} is already waiting on gate {gate} of {job}")]
    Reentrant {
        /// The job name.
        job: String,
        /// The gate name.
        gate: String,
        /// The build number.
        build: u64,
    },

    /// The gate table could not be persisted.
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl From<GateError> for StepError {
    fn from(err: GateError) -> Self {
        Self::failed(err.to_string())
    }
}

impl From<ContextError> for StepError {
    fn from(err: ContextError) -> Self {
        Self::failed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_run_result_only_gets_worse() {
        assert_eq!(RunResult::Success.combine(RunResult::Failure), RunResult::Failure);
        assert_eq!(RunResult::Aborted.combine(RunResult::Unstable), RunResult::Aborted);
        assert!(RunResult::NotBuilt.is_worse_or_equal_to(RunResult::Failure));
    }

    #[test]
    fn test_superseded_message() {
        let err = StepError::interrupted(RunResult::NotBuilt, InterruptCause::Superseded { by: 7 });
        assert_eq!(err.to_string(), "Interrupted (NOT_BUILT): Superseded by #7");
        assert!(err.is_interruption());
        assert_eq!(err.result(), RunResult::NotBuilt);
    }

    #[test]
    fn test_failed_result_is_failure() {
        let err = StepError::failed("boom");
        assert_eq!(err.result(), RunResult::Failure);
        assert!(err.interruption().is_none());
    }

    #[test]
    fn test_step_error_serde() {
        let err = StepError::aborted(InterruptCause::timed_out(Duration::from_secs(5)));
        let json = serde_json::to_string(&err).unwrap();
        let back: StepError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err: StepError = anyhow::anyhow!("disk full").context("writing report").into();
        assert_eq!(err.to_string(), "writing report: disk full");
    }

    #[test]
    fn test_flow_error_wraps_gate_error() {
        let err: FlowError = GateError::Reentrant {
            job: "app".to_string(),
            gate: "deploy".to_string(),
            build: 3,
        }
        .into();
        assert!(err.to_string().contains("already waiting"));
    }
}
