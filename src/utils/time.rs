//! Time and timestamp utilities

use chrono::{SecondsFormat, TimeZone, Utc};

/// Current Unix time in milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current UTC time as RFC 3339 with millisecond precision
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Render epoch milliseconds as RFC 3339, falling back to the raw number
/// when it is out of chrono's range
pub fn millis_to_rfc3339(millis: i64) -> String {
    match Utc.timestamp_millis_opt(millis).single() {
        Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
        None => millis.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_to_rfc3339() {
        assert_eq!(millis_to_rfc3339(0), "1970-01-01T00:00:00.000Z");
        assert_eq!(millis_to_rfc3339(1_000), "1970-01-01T00:00:01.000Z");
    }

    #[test]
    fn test_now_is_after_2020() {
        assert!(now_millis() > 1_577_836_800_000);
        assert!(now_rfc3339().ends_with('Z'));
    }
}
