//! Shared utility functions used across the crate.

use std::time::Duration;

use crate::error::ConfigurationError;

/// Parse a duration string (e.g., "100ms", "30s", "1m") into std::time::Duration.
///
/// Supported formats:
/// - `Nms` - milliseconds (e.g., "500ms")
/// - `Ns` - seconds (e.g., "30s")
/// - `Nm` - minutes (e.g., "5m")
///
/// `N` is an unsigned integer. Surrounding whitespace is ignored; anything else
/// (fractions, hours, bare numbers) is rejected.
pub fn parse_duration(s: &str) -> Result<Duration, ConfigurationError> {
    let trimmed = s.trim();
    let invalid = || ConfigurationError::InvalidDuration(s.to_string());

    let (digits, unit) = match trimmed.find(|c: char| !c.is_ascii_digit()) {
        Some(0) | None => return Err(invalid()),
        Some(idx) => trimmed.split_at(idx),
    };
    let value: u64 = digits.parse().map_err(|_| invalid())?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => value
            .checked_mul(60)
            .map(Duration::from_secs)
            .ok_or_else(invalid),
        _ => Err(invalid()),
    }
}

/// Like [`parse_duration`] but treats a missing value as `default`.
pub fn parse_optional_duration(
    s: Option<&str>,
    default: Duration,
) -> Result<Duration, ConfigurationError> {
    s.map(parse_duration).unwrap_or(Ok(default))
}
