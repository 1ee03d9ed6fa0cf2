//! Helpers for exercising steps against an in-process flow.
//!
//! This module provides:
//! - A ready-made flow with a collecting console
//! - Scripted bodies and recording callbacks
//! - Assertions on step outcomes

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{assert_failed_with, assert_interrupted_by, assert_succeeded_with};
pub use fixtures::{flow_fixture, FlowFixture};
pub use mocks::{CountingBody, RecordedEvent, RecordingCallback, ScriptedBody};
