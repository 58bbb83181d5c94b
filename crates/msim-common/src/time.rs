//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the simulator runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Wire timestamp helpers.
//!
//! Readings carry round-trip UTC timestamps with seven fractional digits
//! (`2024-01-01T00:00:00.0000000Z`), i.e. 100ns ticks.

use chrono::{DateTime, Timelike, Utc};

/// Capture the current UTC time for a reading.
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Format a timestamp with 100ns precision and a `Z` suffix.
pub fn format_wire_timestamp(timestamp: &DateTime<Utc>) -> String {
    // leap seconds report nanos >= 1e9
    let ticks = (timestamp.nanosecond() / 100).min(9_999_999);
    format!("{}.{:07}Z", timestamp.format("%Y-%m-%dT%H:%M:%S"), ticks)
}

/// Parse any RFC 3339 timestamp into UTC.
pub fn parse_wire_timestamp(value: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(value).map(|ts| ts.with_timezone(&Utc))
}

/// Serde adapter for `#[serde(with = "msim_common::time::wire_timestamp")]`.
pub mod wire_timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(timestamp: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_wire_timestamp(timestamp))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        super::parse_wire_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn formats_seven_fractional_digits() {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_wire_timestamp(&ts), "2024-01-01T00:00:00.0000000Z");

        let with_nanos = ts.with_nanosecond(123_456_789).unwrap();
        assert_eq!(
            format_wire_timestamp(&with_nanos),
            "2024-01-01T00:00:00.1234567Z"
        );
    }

    #[test]
    fn parses_what_it_formats() {
        let ts = Utc.with_ymd_and_hms(2025, 6, 30, 12, 34, 56).unwrap();
        let parsed = parse_wire_timestamp(&format_wire_timestamp(&ts)).unwrap();
        assert_eq!(parsed, ts);
        assert!(parse_wire_timestamp("yesterday").is_err());
    }
}
