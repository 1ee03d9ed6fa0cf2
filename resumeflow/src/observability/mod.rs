//! Logging setup and flow-level wide events.

mod subscriber;
mod wide_events;

pub use subscriber::init_tracing;
pub use wide_events::WideEventListener;
