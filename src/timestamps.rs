use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

use crate::error::{ImportError, ImportResult};

/// Smallest timestamp increment the importer reasons in. Boundaries and
/// resume cursors move by exactly one tick.
pub fn tick() -> Duration {
    Duration::nanoseconds(1)
}

/// Largest numeric value still interpreted as Unix seconds (9999-12-31);
/// anything bigger is taken as Unix nanoseconds.
const MAX_EPOCH_SECONDS: f64 = 253_402_300_799.0;

/// Parses a user-supplied time bound: RFC3339, Unix seconds, Unix
/// nanoseconds, or a handful of plain date/datetime forms assumed UTC.
pub fn parse_timestamp(raw: &str) -> ImportResult<DateTime<Utc>> {
    let value = raw.trim();

    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Ok(parsed.with_timezone(&Utc));
    }

    if let Ok(numeric) = value.parse::<f64>() {
        let nanos = if numeric.abs() <= MAX_EPOCH_SECONDS {
            (numeric * 1e9) as i64
        } else {
            numeric as i64
        };
        return Ok(DateTime::from_timestamp_nanos(nanos));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S") {
        return Ok(Utc.from_utc_datetime(&naive));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(ImportError::config(format!(
        "Unable to parse timestamp: {}",
        raw
    )))
}

/// Parses a row-level `time` cell to integer nanoseconds. Strings are
/// RFC3339 (nanosecond fractions preserved exactly), integers are already
/// nanoseconds, floats are seconds.
pub fn parse_value_to_nanos(value: &Value) -> ImportResult<i64> {
    match value {
        Value::String(raw) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
                return parsed.timestamp_nanos_opt().ok_or_else(|| {
                    ImportError::window(format!("Timestamp out of range: {}", raw))
                });
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
                return Ok(Utc.from_utc_datetime(&naive).timestamp_nanos_opt().unwrap_or_default());
            }
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
                return Ok(Utc.from_utc_datetime(&naive).timestamp_nanos_opt().unwrap_or_default());
            }
            Err(ImportError::window(format!(
                "Unable to parse timestamp: {}",
                raw
            )))
        }
        Value::Number(number) => {
            if let Some(nanos) = number.as_i64() {
                Ok(nanos)
            } else if let Some(nanos) = number.as_u64() {
                i64::try_from(nanos).map_err(|_| {
                    ImportError::window(format!("Timestamp out of range: {}", number))
                })
            } else if let Some(seconds) = number.as_f64() {
                Ok((seconds * 1e9) as i64)
            } else {
                Err(ImportError::window(format!(
                    "Unable to parse timestamp: {}",
                    number
                )))
            }
        }
        other => Err(ImportError::window(format!(
            "Unable to parse timestamp: {}",
            other
        ))),
    }
}

/// RFC3339 with nine fractional digits and a `Z` suffix, the form used in
/// query literals and persisted resume cursors.
pub fn format_rfc3339_nanos(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn nanos_to_rfc3339(nanos: i64) -> String {
    format_rfc3339_nanos(DateTime::from_timestamp_nanos(nanos))
}

pub fn datetime_to_nanos(at: DateTime<Utc>) -> i64 {
    at.timestamp_nanos_opt().unwrap_or_default()
}

pub fn now_nanos() -> i64 {
    datetime_to_nanos(Utc::now())
}
