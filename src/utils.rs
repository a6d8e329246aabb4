//! Utility functions and helpers
//!
//! Common utilities used throughout the relay.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Get current time as fractional seconds since Unix epoch
pub fn current_timestamp_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Convert a filesystem timestamp into fractional epoch seconds
pub fn system_time_secs(time: SystemTime) -> f64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Trim and case-fold a value for matching; empty input yields `None`
pub fn fold_case(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Clamp a value between min and max
pub fn clamp<T: PartialOrd>(value: T, min: T, max: T) -> T {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}

/// Render a duration for log lines
pub fn format_duration(duration: Duration) -> String {
    humantime::format_duration(duration).to_string()
}
