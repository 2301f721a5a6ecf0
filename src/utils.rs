use std::time::{SystemTime, UNIX_EPOCH};

use time::format_description::well_known::Rfc2822;
use time::OffsetDateTime;

/// Current time as Unix-epoch seconds; the TS in "TS6".
pub(crate) fn now_ts() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs(),
        Err(_) => 0,
    }
}

/// Human-readable form of an epoch timestamp, for numerics like 003 and 391.
pub(crate) fn format_ts(epoch: u64) -> String {
    match OffsetDateTime::from_unix_timestamp(epoch as i64) {
        Ok(t) => t.format(&Rfc2822).unwrap_or_else(|_| epoch.to_string()),
        Err(_) => epoch.to_string(),
    }
}

/// Topics and similar free text are restricted to printable ASCII and capped
/// in length; anything else is dropped rather than relayed.
pub(crate) fn sanitize_text(text: &str, max_bytes: usize) -> String {
    let mut out: String = text.chars().filter(|c| (' '..='~').contains(c)).collect();
    out.truncate(max_bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_text() {
        assert_eq!(sanitize_text("hello", 300), "hello");
        assert_eq!(sanitize_text("a\tb\rc\nd", 300), "abcd");
        assert_eq!(sanitize_text("caf\u{e9}", 300), "caf");
        assert_eq!(sanitize_text("xyz", 2), "xy");
    }

    #[test]
    fn test_format_ts() {
        assert!(!format_ts(0).is_empty());
        assert!(format_ts(1_600_000_000).contains("2020"));
    }
}
