//! ---
//! shdr_section: "01-core-functionality"
//! shdr_subsection: "module"
//! shdr_type: "source"
//! shdr_scope: "code"
//! shdr_description: "Shared primitives and utilities for the SHDR runtime."
//! shdr_version: "v0.0.0-prealpha"
//! shdr_owner: "tbd"
//! ---
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};

const MICROS_PER_SECOND: i64 = 1_000_000;

/// Current wall-clock time as Unix epoch microseconds.
pub fn now_micros() -> i64 {
    Utc::now().timestamp_micros()
}

/// Render epoch microseconds as an ISO-8601 UTC timestamp with microsecond precision.
pub fn format_timestamp(micros: i64) -> String {
    let secs = micros.div_euclid(MICROS_PER_SECOND);
    let nanos = (micros.rem_euclid(MICROS_PER_SECOND) * 1_000) as u32;
    match DateTime::<Utc>::from_timestamp(secs, nanos) {
        Some(instant) => instant.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
        None => micros.to_string(),
    }
}

/// Parse an ISO-8601 timestamp into epoch microseconds.
///
/// Offsets are honoured when present; timestamps without a zone are taken as UTC.
pub fn parse_timestamp(token: &str) -> Option<i64> {
    let token = token.trim();
    // Cheap rejection: every accepted form starts with a four digit year.
    if token.len() < 10 || !token.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(token) {
        return Some(parsed.with_timezone(&Utc).timestamp_micros());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(token, format) {
            return Some(Utc.from_utc_datetime(&naive).timestamp_micros());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_and_parse_agree() {
        let micros = 1_704_067_200_123_456;
        let text = format_timestamp(micros);
        assert_eq!(text, "2024-01-01T00:00:00.123456Z");
        assert_eq!(parse_timestamp(&text), Some(micros));
    }

    #[test]
    fn parse_accepts_offsets_and_naive_forms() {
        assert_eq!(
            parse_timestamp("2024-01-01T01:00:00+01:00"),
            Some(1_704_067_200_000_000)
        );
        assert_eq!(
            parse_timestamp("2024-01-01T00:00:00"),
            Some(1_704_067_200_000_000)
        );
        assert_eq!(
            parse_timestamp("2024-01-01T00:00:00.5"),
            Some(1_704_067_200_500_000)
        );
    }

    #[test]
    fn parse_rejects_keys() {
        assert_eq!(parse_timestamp("avail"), None);
        assert_eq!(parse_timestamp("2024"), None);
        assert_eq!(parse_timestamp("Xaxis_position"), None);
    }
}
