//! Prometheus-style duration parsing
//!
//! TSDB status endpoints report their retention period in the Prometheus
//! duration notation (`30d`, `2w`, `1y2w`, `15d12h`). Only the duration
//! component of combined retention strings (`30d or 10GiB`) is relevant to
//! routing decisions, so callers split that off before parsing here.

use crate::{Error, Result};
use std::time::Duration;

const SECONDS_PER_MINUTE: u64 = 60;
const SECONDS_PER_HOUR: u64 = 60 * SECONDS_PER_MINUTE;
const SECONDS_PER_DAY: u64 = 24 * SECONDS_PER_HOUR;
const SECONDS_PER_WEEK: u64 = 7 * SECONDS_PER_DAY;
// Prometheus defines y as exactly 365 days
const SECONDS_PER_YEAR: u64 = 365 * SECONDS_PER_DAY;

/// Parse a Prometheus duration string such as `30d`, `12h30m` or `1y`.
///
/// Units may appear at most once each and must be ordered from largest to
/// smallest, matching the upstream grammar.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::invalid_request("empty duration"));
    }

    let mut total: u64 = 0;
    let mut number = String::new();
    let mut last_unit_rank = usize::MAX;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }

        if number.is_empty() {
            return Err(Error::invalid_request(format!("invalid duration: {}", s)));
        }

        let value: u64 = number
            .parse()
            .map_err(|_| Error::invalid_request(format!("invalid duration: {}", s)))?;
        number.clear();

        // ms needs a lookahead since m is also a valid unit
        let (unit_secs_num, unit_secs_den, rank) = match c {
            'y' => (SECONDS_PER_YEAR, 1, 7),
            'w' => (SECONDS_PER_WEEK, 1, 6),
            'd' => (SECONDS_PER_DAY, 1, 5),
            'h' => (SECONDS_PER_HOUR, 1, 4),
            'm' => {
                if chars.peek() == Some(&'s') {
                    chars.next();
                    (1, 1000, 1)
                } else {
                    (SECONDS_PER_MINUTE, 1, 3)
                }
            }
            's' => (1, 1, 2),
            _ => return Err(Error::invalid_request(format!("invalid duration unit in: {}", s))),
        };

        if rank >= last_unit_rank {
            return Err(Error::invalid_request(format!("duration units out of order: {}", s)));
        }
        last_unit_rank = rank;

        total += value * unit_secs_num * 1000 / unit_secs_den;
    }

    if !number.is_empty() {
        return Err(Error::invalid_request(format!("missing unit in duration: {}", s)));
    }

    Ok(Duration::from_millis(total))
}

/// Format a duration back into Prometheus notation using the largest
/// exact units, the inverse of [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let mut millis = d.as_millis() as u64;
    if millis == 0 {
        return "0s".to_string();
    }

    let mut out = String::new();

    for (unit, unit_millis) in [
        ("y", SECONDS_PER_YEAR * 1000),
        ("w", SECONDS_PER_WEEK * 1000),
        ("d", SECONDS_PER_DAY * 1000),
        ("h", SECONDS_PER_HOUR * 1000),
        ("m", SECONDS_PER_MINUTE * 1000),
        ("s", 1000),
        ("ms", 1),
    ] {
        let count = millis / unit_millis;
        if count > 0 {
            out.push_str(&format!("{}{}", count, unit));
            millis -= count * unit_millis;
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_units() {
        assert_eq!(parse_duration("30d").unwrap(), Duration::from_secs(30 * 24 * 3600));
        assert_eq!(parse_duration("720h").unwrap(), Duration::from_secs(720 * 3600));
        assert_eq!(parse_duration("15m").unwrap(), Duration::from_secs(900));
        assert_eq!(parse_duration("10s").unwrap(), Duration::from_secs(10));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2w").unwrap(), Duration::from_secs(14 * 24 * 3600));
        assert_eq!(parse_duration("1y").unwrap(), Duration::from_secs(365 * 24 * 3600));
    }

    #[test]
    fn test_parse_compound() {
        assert_eq!(
            parse_duration("1d12h").unwrap(),
            Duration::from_secs(36 * 3600)
        );
        assert_eq!(
            parse_duration("1h30m10s").unwrap(),
            Duration::from_secs(5410)
        );
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("d30").is_err());
        assert!(parse_duration("30x").is_err());
        // out of order
        assert!(parse_duration("30m1h").is_err());
    }

    #[test]
    fn test_retention_equivalence() {
        // 30d and 720h describe the same retention window
        assert_eq!(parse_duration("30d").unwrap(), parse_duration("720h").unwrap());
    }

    #[test]
    fn test_format_roundtrip() {
        for s in ["30d", "1d12h", "1h30m10s", "500ms", "2w"] {
            let parsed = parse_duration(s).unwrap();
            let formatted = format_duration(parsed);
            assert_eq!(parse_duration(&formatted).unwrap(), parsed, "roundtrip of {}", s);
        }
    }

    #[test]
    fn test_format_zero() {
        assert_eq!(format_duration(Duration::ZERO), "0s");
    }
}
