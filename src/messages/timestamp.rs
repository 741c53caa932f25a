//! Wire timestamps
//!
//! Producers in the field emit either RFC 3339 strings or naive ISO-8601 local
//! times without an offset. Naive values are taken as UTC. Everything we emit
//! is RFC 3339 with microsecond precision.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer};

pub type Timestamp = DateTime<Utc>;

const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse a wire timestamp, accepting RFC 3339 or naive ISO-8601
pub fn parse(raw: &str) -> Option<Timestamp> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }

    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

pub fn format(ts: &Timestamp) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn serialize<S>(ts: &Timestamp, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&format(ts))
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Timestamp, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {raw}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_parse_rfc3339_with_offset() {
        let ts = parse("2024-05-01T12:00:00+02:00").unwrap();
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn test_parse_naive_isoformat() {
        // datetime.isoformat() style, no offset
        let ts = parse("2024-05-01T12:30:15.123456").unwrap();
        assert_eq!(ts.day(), 1);
        assert_eq!(ts.minute(), 30);
        assert_eq!(ts.nanosecond(), 123_456_000);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse("yesterday").is_none());
        assert!(parse("").is_none());
    }

    #[test]
    fn test_format_is_rfc3339() {
        let ts = parse("2024-05-01T12:30:15").unwrap();
        assert_eq!(format(&ts), "2024-05-01T12:30:15.000000Z");
    }
}
