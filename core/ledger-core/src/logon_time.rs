//! Logon timestamp storage format and elapsed-minute arithmetic.
//!
//! Hosts report logon times as local wall-clock values without an offset, so
//! everything here works on `NaiveDateTime` and is compared against the local
//! clock at closeout.

use chrono::NaiveDateTime;

/// Canonical text form written to and read from the store.
pub const STORED_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn to_stored(value: NaiveDateTime) -> String {
    value.format(STORED_FORMAT).to_string()
}

pub fn parse_stored(value: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), STORED_FORMAT).ok()
}

/// Parses a host-reported logon time using the configured source format.
pub fn parse_reported(value: &str, format: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value.trim(), format).ok()
}

/// Whole minutes between `logon` and `now`, rounded half-up.
///
/// A logon time in the future (clock skew between hosts) yields zero.
pub fn elapsed_minutes(logon: NaiveDateTime, now: NaiveDateTime) -> i64 {
    let seconds = now.signed_duration_since(logon).num_seconds();
    if seconds <= 0 {
        return 0;
    }
    (seconds + 30) / 60
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(value: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(value, STORED_FORMAT).expect("parse")
    }

    #[test]
    fn stored_format_round_trips_reported_time() {
        let reported = parse_reported("01.01.2025 09:00", "%d.%m.%Y %H:%M").expect("parse");
        let stored = to_stored(reported);
        assert_eq!(stored, "2025-01-01 09:00:00");
        assert_eq!(parse_stored(&stored), Some(reported));
    }

    #[test]
    fn elapsed_minutes_rounds_half_up() {
        let logon = at("2025-01-01 09:00:00");
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:47:00")), 47);
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:00:29")), 0);
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:00:30")), 1);
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:01:29")), 1);
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:01:30")), 2);
    }

    #[test]
    fn elapsed_minutes_clamps_future_logon_to_zero() {
        let logon = at("2025-01-01 10:00:00");
        assert_eq!(elapsed_minutes(logon, at("2025-01-01 09:00:00")), 0);
    }

    #[test]
    fn parse_stored_rejects_reported_format() {
        assert!(parse_stored("01.01.2025 09:00").is_none());
        assert!(parse_stored("garbage").is_none());
    }
}
