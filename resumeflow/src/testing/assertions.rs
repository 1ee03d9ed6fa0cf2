//! Assertions on step outcomes.

use crate::errors::{InterruptCause, RunResult, StepError, StepResult};

/// Asserts that the step succeeded with `expected`.
pub fn assert_succeeded_with(result: &StepResult, expected: &serde_json::Value) {
    match result {
        Ok(value) => assert_eq!(value, expected, "Step succeeded with an unexpected value"),
        Err(err) => panic!("Expected success with {expected}, got failure: {err}"),
    }
}

/// Asserts that the step failed with an ordinary failure carrying `message`.
pub fn assert_failed_with(result: &StepResult, message: &str) {
    match result {
        Err(StepError::Failed { message: actual }) => assert!(
            actual.contains(message),
            "Expected failure mentioning '{message}', got '{actual}'"
        ),
        other => panic!("Expected failure mentioning '{message}', got {other:?}"),
    }
}

/// Asserts that the step was interrupted with `result` and, first, `cause`.
pub fn assert_interrupted_by(result: &StepResult, expected: RunResult, cause: &InterruptCause) {
    let Err(err) = result else {
        panic!("Expected interruption, got {result:?}");
    };
    let Some(interrupted) = err.interruption() else {
        panic!("Expected interruption, got {err}");
    };
    assert_eq!(interrupted.result, expected, "Unexpected interruption result");
    assert_eq!(
        interrupted.causes.first(),
        Some(cause),
        "Unexpected interruption cause"
    );
}
