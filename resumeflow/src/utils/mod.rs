//! Small shared helpers.

pub mod timestamps;

pub use timestamps::{deadline_after, format_duration, now_epoch_ms, remaining_until, Timestamp};
