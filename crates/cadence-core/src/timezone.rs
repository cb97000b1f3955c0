use crate::error::CoreError;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::str::FromStr;

/// Parse an IANA timezone name
pub fn parse_timezone(timezone: &str) -> Result<Tz, CoreError> {
    Tz::from_str(timezone.trim()).map_err(|_| CoreError::InvalidTimezone(timezone.to_string()))
}

/// Validate IANA timezone name
pub fn validate_timezone(timezone: &str) -> Result<(), CoreError> {
    parse_timezone(timezone).map(|_| ())
}

/// Validate an optional timezone, treating `None` as UTC
pub fn validate_optional_timezone(timezone: Option<&str>) -> Result<(), CoreError> {
    timezone.map_or(Ok(()), validate_timezone)
}

/// Calendar date of an instant as seen in `timezone`
pub fn local_date(instant: DateTime<Utc>, timezone: &str) -> Result<NaiveDate, CoreError> {
    let tz = parse_timezone(timezone)?;
    Ok(instant.with_timezone(&tz).date_naive())
}

/// Format datetime with timezone-aware display
pub fn format_with_timezone(
    datetime: DateTime<Utc>,
    timezone: &str,
    format: &str,
) -> Result<String, CoreError> {
    let tz = parse_timezone(timezone)?;
    Ok(datetime.with_timezone(&tz).format(format).to_string())
}
