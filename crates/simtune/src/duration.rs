use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d+)(ms|s|m|h)$").expect("duration regex"))
}

/// Parse an interval string ("250ms", "1s", "5m", "2h") into seconds.
///
/// An empty string is the documented fallback and parses as 1.0 second.
/// Anything outside `<integer><ms|s|m|h>` (floats, negatives, bare numbers,
/// combined units) is `InvalidFormat`.
pub fn parse(text: &str) -> Result<f64> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(1.0);
    }

    let caps = duration_re().captures(text).ok_or_else(|| {
        Error::invalid_format(format!(
            "invalid duration '{text}' (expected <integer><ms|s|m|h>)"
        ))
    })?;

    let value = caps[1]
        .parse::<u64>()
        .map_err(|e| Error::invalid_format(format!("duration magnitude in '{text}': {e}")))?;

    let multiplier = match &caps[2] {
        "ms" => 0.001,
        "s" => 1.0,
        "m" => 60.0,
        "h" => 3600.0,
        other => {
            return Err(Error::invalid_format(format!(
                "unsupported duration unit '{other}'"
            )));
        }
    };

    Ok(value as f64 * multiplier)
}

/// Format seconds back into an interval string, choosing the coarsest unit
/// that keeps the magnitude >= 1.
///
/// The s/m/h branches truncate (integer division), so sub-unit precision is
/// lost: parse is exact, format is not.
pub fn format(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{}ms", (seconds * 1000.0) as i64)
    } else if seconds < 60.0 {
        format!("{}s", seconds as i64)
    } else if seconds < 3600.0 {
        format!("{}m", seconds as i64 / 60)
    } else {
        format!("{}h", seconds as i64 / 3600)
    }
}
