//! Calendar-month rollover check for monthly token counters.

use chrono::{DateTime, Datelike, Utc};

/// Whether counters last reset at `last_reset` must be reset at `now`.
///
/// True iff `now` falls in a later calendar month (UTC). Day-of-month is
/// ignored and a `now` earlier than `last_reset` never triggers a reset.
pub fn needs_reset(last_reset: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    now.year() > last_reset.year()
        || (now.year() == last_reset.year() && now.month() > last_reset.month())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 12, 0, 0).unwrap()
    }

    #[test]
    fn next_day_in_new_month_resets() {
        assert!(needs_reset(date(2024, 1, 31), date(2024, 2, 1)));
    }

    #[test]
    fn same_month_does_not_reset() {
        assert!(!needs_reset(date(2024, 2, 1), date(2024, 2, 28)));
    }

    #[test]
    fn year_boundary_resets() {
        assert!(needs_reset(date(2023, 12, 15), date(2024, 1, 1)));
    }

    #[test]
    fn earlier_month_in_later_year_still_resets() {
        assert!(needs_reset(date(2023, 11, 1), date(2024, 3, 1)));
    }

    #[test]
    fn clock_going_backwards_never_resets() {
        assert!(!needs_reset(date(2024, 5, 1), date(2024, 4, 30)));
        assert!(!needs_reset(date(2024, 1, 1), date(2023, 12, 31)));
    }

    #[test]
    fn repeated_calls_agree() {
        let last = date(2024, 1, 31);
        let now = date(2024, 2, 1);
        let first = needs_reset(last, now);
        for _ in 0..5 {
            assert_eq!(needs_reset(last, now), first);
        }
    }
}
