//! Console output for steps.
//!
//! Steps report progress ("Waiting for builds [3]", "Retrying") as plain
//! lines. Where those lines go is decided by the [`ConsoleLog`] contextual
//! value visible to the step.

mod sink;

pub use sink::{
    CollectingConsoleSink, ConsoleLog, ConsoleSink, NoOpConsoleSink, TeeConsoleSink,
    TracingConsoleSink,
};
