//! Wall-clock helpers for persisted deadlines.
//!
//! Deadlines that must survive a restart are stored as absolute UTC epoch
//! milliseconds; the remaining time is recomputed when a step is resumed.

use chrono::{DateTime, TimeZone, Utc};
use std::time::Duration;

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// The current time in epoch milliseconds.
#[must_use]
pub fn now_epoch_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// The absolute deadline `after` from now, in epoch milliseconds.
#[must_use]
pub fn deadline_after(after: Duration) -> i64 {
    let after = i64::try_from(after.as_millis()).unwrap_or(i64::MAX);
    now_epoch_ms().saturating_add(after)
}

/// Time left until `deadline_ms`. Zero once the deadline has passed.
#[must_use]
pub fn remaining_until(deadline_ms: i64) -> Duration {
    let left = deadline_ms.saturating_sub(now_epoch_ms());
    Duration::from_millis(u64::try_from(left).unwrap_or(0))
}

/// Converts epoch milliseconds into a timestamp, if representable.
#[must_use]
pub fn from_epoch_ms(ms: i64) -> Option<Timestamp> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Formats a span the way console messages show it: `0.25 sec`, `1.2 sec`,
/// `3 min 5 sec`, `2 hr 10 min`.
#[must_use]
pub fn format_duration(span: Duration) -> String {
    let millis = span.as_millis();
    if millis < 60_000 {
        let secs = format!("{:.2}", span.as_secs_f64());
        let secs = secs.trim_end_matches('0').trim_end_matches('.');
        return format!("{secs} sec");
    }
    let total_secs = span.as_secs();
    let (hours, minutes, seconds) = (total_secs / 3600, (total_secs % 3600) / 60, total_secs % 60);
    if hours > 0 {
        format!("{hours} hr {minutes} min")
    } else {
        format!("{minutes} min {seconds} sec")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_format_short_spans() {
        assert_eq!(format_duration(Duration::from_millis(250)), "0.25 sec");
        assert_eq!(format_duration(Duration::from_millis(300)), "0.3 sec");
        assert_eq!(format_duration(Duration::from_millis(1200)), "1.2 sec");
        assert_eq!(format_duration(Duration::from_secs(5)), "5 sec");
        assert_eq!(format_duration(Duration::ZERO), "0 sec");
    }

    #[test]
    fn test_format_long_spans() {
        assert_eq!(format_duration(Duration::from_secs(185)), "3 min 5 sec");
        assert_eq!(format_duration(Duration::from_secs(2 * 3600 + 600)), "2 hr 10 min");
    }

    #[test]
    fn test_passed_deadline_has_nothing_left() {
        assert_eq!(remaining_until(now_epoch_ms() - 1_000), Duration::ZERO);
    }

    #[test]
    fn test_future_deadline_round_trips() {
        let deadline = deadline_after(Duration::from_secs(60));
        let left = remaining_until(deadline);
        assert!(left > Duration::from_secs(59) && left <= Duration::from_secs(60));
        assert!(from_epoch_ms(deadline).is_some());
    }
}
