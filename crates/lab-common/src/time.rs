//! Wire timestamps.

use chrono::{DateTime, Utc};

/// Timestamp format used in every published document.
pub const WIRE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Current UTC time formatted for the wire (`2024-05-01T12:00:00Z`).
pub fn now_iso() -> String {
    format_iso(Utc::now())
}

/// Format an instant for the wire.
pub fn format_iso(at: DateTime<Utc>) -> String {
    at.format(WIRE_TIME_FORMAT).to_string()
}

/// Parse an ISO-8601 instant as sent by clients.
///
/// Accepts a trailing `Z` or an explicit offset, with or without fractional seconds.
pub fn parse_iso(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_iso() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 5).unwrap();
        assert_eq!(format_iso(at), "2024-05-01T12:30:05Z");
    }

    #[test]
    fn test_parse_iso_accepts_zulu_and_offset() {
        let zulu = parse_iso("2024-05-01T12:30:05Z").unwrap();
        let offset = parse_iso("2024-05-01T14:30:05+02:00").unwrap();
        assert_eq!(zulu, offset);
        assert!(parse_iso("tomorrow").is_none());
    }
}
