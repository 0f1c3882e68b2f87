//! Human-readable TTL parsing ("2 hours", "30min", "1.5d").

use crate::error::{CourierError, Result};
use regex::Regex;
use std::sync::OnceLock;
use std::time::Duration;

fn ttl_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*([-+]?(?:\d+(?:\.\d*)?|\.\d+))\s*([A-Za-z]+)\s*$")
            .expect("ttl regex")
    })
}

/// Seconds per unit, `None` for an unknown unit.
fn unit_seconds(unit: &str) -> Option<f64> {
    let seconds = match unit.to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => 1.0,
        "m" | "min" | "mins" | "minute" | "minutes" => 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600.0,
        "d" | "day" | "days" => 86_400.0,
        "w" | "week" | "weeks" => 604_800.0,
        _ => return None,
    };
    Some(seconds)
}

/// Parses a TTL such as `"1 hour"` into a [`Duration`].
///
/// Unknown formats, unknown units and non-positive amounts are configuration
/// errors.
pub fn parse_ttl(input: &str) -> Result<Duration> {
    let invalid = || {
        CourierError::config(format!(
            "Invalid cache TTL '{input}'. Expected an amount and a unit, e.g. '2 hours' or '30 min'"
        ))
    };

    let captures = ttl_pattern().captures(input).ok_or_else(invalid)?;
    let amount: f64 = captures[1].parse().map_err(|_| invalid())?;
    let unit = unit_seconds(&captures[2]).ok_or_else(invalid)?;

    let seconds = amount * unit;
    if !seconds.is_finite() || seconds <= 0.0 {
        return Err(CourierError::config(format!(
            "Cache TTL must be positive, got '{input}'"
        )));
    }
    Duration::try_from_secs_f64(seconds).map_err(|_| invalid())
}
