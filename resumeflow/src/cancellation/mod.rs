//! Cooperative cancellation.
//!
//! A [`CancellationToken`] records the first cancellation cause, notifies
//! synchronous listeners, and can be awaited from async code.

mod token;

pub use token::{CancelCallback, CancellationToken};
