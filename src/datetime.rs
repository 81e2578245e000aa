//! Date/time utilities.

use chrono::{DateTime, TimeDelta, Utc};

/// Format used by HTTP `Date`/`Expires` headers.
const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Format an instant as an HTTP date, e.g. `Sun, 06 Nov 1994 08:49:37 GMT`.
pub fn http_date(dt: &DateTime<Utc>) -> String {
    dt.format(HTTP_DATE_FORMAT).to_string()
}

/// Add whole days to an instant, saturating at the representable maximum.
///
/// Negative day counts are treated as zero.
pub fn add_days(dt: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    TimeDelta::try_days(days.max(0))
        .and_then(|delta| dt.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_http_date() {
        let dt = Utc.with_ymd_and_hms(1994, 11, 6, 8, 49, 37).unwrap();
        assert_eq!(http_date(&dt), "Sun, 06 Nov 1994 08:49:37 GMT");
    }

    #[test]
    fn test_add_days() {
        let dt = Utc.with_ymd_and_hms(2024, 2, 27, 12, 0, 0).unwrap();
        assert_eq!(
            add_days(dt, 3),
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_add_days_saturates() {
        let dt = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(add_days(dt, i64::MAX), DateTime::<Utc>::MAX_UTC);
        assert_eq!(add_days(dt, -5), dt);
    }
}
