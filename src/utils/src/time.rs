use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, NaiveDate, NaiveDateTime};

use metricdb_common::error::StoreError;

const DATE_KEY_FORMAT: &str = "%Y%m%d";

/// Timestamp format used by tests and debug tooling, e.g. "20190904 19:10:48".
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d %H:%M:%S";

/// now returns the current unix timestamp in milliseconds.
pub fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time before Unix epoch")
        .as_millis() as i64
}

/// parse_date_key returns the midnight UTC timestamp (ms) of a `YYYYMMDD` key.
pub fn parse_date_key(date_key: &str) -> anyhow::Result<i64> {
    if date_key.len() != 8 || !date_key.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StoreError::InvalidDateKey(date_key.to_string()).into());
    }
    let date = NaiveDate::parse_from_str(date_key, DATE_KEY_FORMAT)
        .map_err(|_| StoreError::InvalidDateKey(date_key.to_string()))?;
    let midnight = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    Ok(midnight.and_utc().timestamp_millis())
}

/// format_date_key returns the `YYYYMMDD` key of the UTC day containing the timestamp.
pub fn format_date_key(timestamp: i64) -> anyhow::Result<String> {
    let dt = DateTime::from_timestamp_millis(timestamp)
        .ok_or_else(|| anyhow::anyhow!("timestamp out of range: {}", timestamp))?;
    Ok(dt.format(DATE_KEY_FORMAT).to_string())
}

/// parse_timestamp parses a wall-clock string as UTC milliseconds.
pub fn parse_timestamp(value: &str, format: &str) -> anyhow::Result<i64> {
    let dt = NaiveDateTime::parse_from_str(value, format)?;
    Ok(dt.and_utc().timestamp_millis())
}
