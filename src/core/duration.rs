//! Parsing of window durations such as `15m` or `1hour`.

use crate::error::{MortarError, Result};
use regex::Regex;
use std::time::Duration;

const DURATION_PATTERN: &str = r"^\s*(\d+)\s*([A-Za-z]+)\s*$";

/// Parse `<number><unit>` into a [`Duration`].
///
/// Units: h/hr/hour(s), m/min/minute(s), s/sec/second(s), ms/msec/millisecond(s),
/// us/usec/microsecond(s), ns/nsec/nanosecond(s), d/day(s).
pub fn parse_duration(expr: &str) -> Result<Duration> {
    let re = Regex::new(DURATION_PATTERN)?;
    let caps = re.captures(expr).ok_or_else(|| {
        MortarError::Validation(format!(
            "Invalid duration '{}'. Must be Number followed by h,m,s,us,ms,ns,d",
            expr
        ))
    })?;

    let count: u64 = caps[1]
        .parse()
        .map_err(|e| MortarError::Validation(format!("Invalid duration '{}': {}", expr, e)))?;

    let unit = match &caps[2] {
        "h" | "hr" | "hour" | "hours" => Duration::from_secs(3600),
        "m" | "min" | "minute" | "minutes" => Duration::from_secs(60),
        "s" | "sec" | "second" | "seconds" => Duration::from_secs(1),
        "ms" | "msec" | "millisecond" | "milliseconds" => Duration::from_millis(1),
        "us" | "usec" | "microsecond" | "microseconds" => Duration::from_micros(1),
        "ns" | "nsec" | "nanosecond" | "nanoseconds" => Duration::from_nanos(1),
        "d" | "day" | "days" => Duration::from_secs(24 * 3600),
        other => {
            return Err(MortarError::Validation(format!(
                "Invalid unit {}. Must be h,m,s,us,ms,ns,d",
                other
            )))
        }
    };

    let count = u32::try_from(count)
        .map_err(|_| MortarError::Validation(format!("Duration '{}' is too large", expr)))?;
    unit.checked_mul(count)
        .ok_or_else(|| MortarError::Validation(format!("Duration '{}' is too large", expr)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_units() {
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("15min").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2days").unwrap(), Duration::from_secs(2 * 86400));
        assert_eq!(parse_duration("7ns").unwrap(), Duration::from_nanos(7));
    }

    #[test]
    fn test_parse_rejects_unknown_unit() {
        let err = parse_duration("3weeks").unwrap_err();
        assert!(err.to_string().contains("Invalid unit weeks"));
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("").is_err());
    }
}
