//! Cross-build admission control.
//!
//! A gate ("stage") of a job admits a bounded number of builds. At most one
//! build waits per gate; when a newer build arrives the older waiter is
//! cancelled, since its work would be superseded anyway. Entering a gate
//! releases every other gate of the same job the build was holding.
//!
//! Only the waiter's build number is persisted. Its context is attached
//! again when the [`GateStep`] resumes; decisions made while it was
//! detached are stored as pending verdicts and applied on reattach.

mod controller;
mod step;
mod table;

#[cfg(test)]
mod gate_tests;

pub use controller::GateController;
pub use step::{gate, GateStep};
pub use table::{BuildOracle, GateState, Verdict, GATE_TABLE_VERSION};

#[cfg(test)]
pub use table::MockBuildOracle;
