//! Serde helpers for timestamps written by Go's `time.Time` JSON encoding.
//!
//! Go never omits a `time.Time`, it writes the zero value
//! `0001-01-01T00:00:00Z` instead. Checkpoint files rely on that, so an
//! absent timestamp maps to the zero value on the way out and back to
//! `None` on the way in.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Deserializer, Serializer, de};

/// Go's zero `time.Time`, as encoded by `encoding/json`.
pub const GO_ZERO_TIME: &str = "0001-01-01T00:00:00Z";

/// Unix timestamp of [`GO_ZERO_TIME`].
const GO_ZERO_UNIX: i64 = -62_135_596_800;

/// Formats a timestamp the way Go's `time.RFC3339Nano` does for UTC values:
/// fractional seconds drop their trailing zeros.
pub fn format(t: &DateTime<Utc>) -> String {
    let full = t.to_rfc3339_opts(SecondsFormat::Nanos, true);
    let Some((head, frac)) = full.strip_suffix('Z').and_then(|s| s.split_once('.')) else {
        return full;
    };
    let frac = frac.trim_end_matches('0');
    if frac.is_empty() {
        format!("{head}Z")
    } else {
        format!("{head}.{frac}Z")
    }
}

/// Parses an RFC 3339 timestamp, mapping Go's zero value to `None`.
pub fn parse(raw: &str) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    if raw.is_empty() {
        return Ok(None);
    }
    let t = DateTime::parse_from_rfc3339(raw)?.with_timezone(&Utc);
    if t.timestamp() == GO_ZERO_UNIX {
        return Ok(None);
    }
    Ok(Some(t))
}

pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match value {
        Some(t) => serializer.serialize_str(&format(t)),
        None => serializer.serialize_str(GO_ZERO_TIME),
    }
}

pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<String>::deserialize(deserializer)?;
    match raw {
        None => Ok(None),
        Some(s) => parse(&s).map_err(de::Error::custom),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Stamp {
        #[serde(with = "crate::go_time", default)]
        at: Option<DateTime<Utc>>,
    }

    #[test]
    fn none_serializes_as_go_zero() {
        let json = serde_json::to_string(&Stamp { at: None }).unwrap();
        assert_eq!(json, r#"{"at":"0001-01-01T00:00:00Z"}"#);
    }

    #[test]
    fn go_zero_parses_as_none() {
        let parsed: Stamp = serde_json::from_str(r#"{"at":"0001-01-01T00:00:00Z"}"#).unwrap();
        assert_eq!(parsed.at, None);
    }

    #[test]
    fn missing_field_parses_as_none() {
        let parsed: Stamp = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed.at, None);
    }

    #[test]
    fn utc_timestamp_matches_go_layout() {
        let t = Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap();
        let json = serde_json::to_string(&Stamp { at: Some(t) }).unwrap();
        assert_eq!(json, r#"{"at":"2024-03-09T12:30:05Z"}"#);
    }

    #[test]
    fn fraction_drops_trailing_zeros() {
        let t = Utc.with_ymd_and_hms(2024, 6, 10, 6, 13, 20).unwrap()
            + chrono::Duration::milliseconds(500);
        assert_eq!(format(&t), "2024-06-10T06:13:20.5Z");
        let t = t + chrono::Duration::nanoseconds(70);
        assert_eq!(format(&t), "2024-06-10T06:13:20.50000007Z");
    }

    #[test]
    fn offset_timestamp_normalizes_to_utc() {
        let parsed: Stamp = serde_json::from_str(r#"{"at":"2024-03-09T20:30:05+08:00"}"#).unwrap();
        assert_eq!(
            parsed.at,
            Some(Utc.with_ymd_and_hms(2024, 3, 9, 12, 30, 5).unwrap())
        );
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(serde_json::from_str::<Stamp>(r#"{"at":"yesterday"}"#).is_err());
    }
}
