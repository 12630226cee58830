//! Duration parsing for timeouts.

use regex::Regex;
use std::sync::LazyLock;
use std::time::Duration;

use crate::{ConfigError, ConfigResult};

static PART_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)(ms|h|m|s)").expect("valid duration regex"));

/// Parse "45", "90s", "10m", "1h30m", or "250ms".
///
/// A bare number is seconds.
pub fn parse_duration(input: &str) -> ConfigResult<Duration> {
    let text = input.trim();
    let invalid = |message: &str| ConfigError::InvalidValue {
        field: "duration".to_string(),
        message: format!("{} in '{}'", message, input),
    };

    if text.is_empty() {
        return Err(invalid("empty duration"));
    }
    if let Ok(secs) = text.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut consumed = 0;
    for caps in PART_REGEX.captures_iter(text) {
        let whole = caps.get(0).map(|m| m.range()).unwrap_or_default();
        if whole.start != consumed {
            return Err(invalid("unexpected characters"));
        }
        consumed = whole.end;

        let value: u64 = caps[1].parse().map_err(|_| invalid("number too large"))?;
        let part = match &caps[2] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            _ => unreachable!("regex only matches known units"),
        };
        total = part
            .and_then(|part| total.checked_add(part))
            .ok_or_else(|| invalid("number too large"))?;
    }

    if consumed != text.len() {
        return Err(invalid("unexpected characters"));
    }
    Ok(total)
}
