//! Human-readable duration parsing for job timeouts.

use crate::{Error, Result};
use std::time::Duration;

/// Parse a duration such as `"1h 30m"`, `"45m"`, `"90s"` or `"2 hours 10 minutes"`.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || Error::Config(format!("Invalid duration: '{}'", input));

    let mut total: u64 = 0;
    let mut chars = input.trim().chars().peekable();
    let mut parsed_any = false;

    loop {
        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }
        if chars.peek().is_none() {
            break;
        }

        let mut digits = String::new();
        while let Some(c) = chars.peek().copied().filter(char::is_ascii_digit) {
            digits.push(c);
            chars.next();
        }
        if digits.is_empty() {
            return Err(invalid());
        }
        let amount: u64 = digits.parse().map_err(|_| invalid())?;

        while chars.peek().is_some_and(|c| c.is_whitespace()) {
            chars.next();
        }

        let mut unit = String::new();
        while let Some(c) = chars.peek().copied().filter(|c| c.is_ascii_alphabetic()) {
            unit.push(c.to_ascii_lowercase());
            chars.next();
        }

        let seconds = match unit.as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hr" | "hrs" | "hour" | "hours" => 3600,
            "d" | "day" | "days" => 86_400,
            _ => return Err(invalid()),
        };

        total = amount
            .checked_mul(seconds)
            .and_then(|s| total.checked_add(s))
            .ok_or_else(invalid)?;
        parsed_any = true;
    }

    if !parsed_any {
        return Err(invalid());
    }
    Ok(Duration::from_secs(total))
}

/// Parse a job timeout. A zero timeout would expire every attempt at once.
pub fn parse_timeout(input: &str) -> Result<Duration> {
    let timeout = parse_duration(input)?;
    if timeout.is_zero() {
        return Err(Error::Config(format!("Timeout must be positive: '{}'", input)));
    }
    Ok(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compact_forms() {
        assert_eq!(parse_duration("90s").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("45m").unwrap(), Duration::from_secs(2700));
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_spelled_out_forms() {
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("2 hours 10 minutes").unwrap(),
            Duration::from_secs(7800)
        );
        assert_eq!(parse_duration("1 day").unwrap(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("ten minutes").is_err());
        assert!(parse_duration("5 fortnights").is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        assert_eq!(parse_duration("0s").unwrap(), Duration::ZERO);
        assert!(parse_timeout("0s").is_err());
        assert!(parse_timeout("0h 0m").is_err());
        assert_eq!(parse_timeout("1s").unwrap(), Duration::from_secs(1));
    }
}
