use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, Utc};

use crate::model::{LimitUnit, Ms, Span};

// ── Period windows ────────────────────────────────────────────────

/// The enclosing civil-time window for `unit` around instant `at`, in UTC:
/// day = calendar day, week = ISO week (Monday start), month = calendar
/// month, year = calendar year. Half-open `[start, end)` in milliseconds.
///
/// `at` must lie within the validated timestamp range (see `caps`); the
/// calendar conversions cannot fail there.
pub fn window_containing(unit: LimitUnit, at: Ms) -> Span {
    let date = DateTime::<Utc>::from_timestamp_millis(at)
        .expect("timestamp validated against caps")
        .date_naive();

    let (first, next) = match unit {
        LimitUnit::Day => (date, date + Days::new(1)),
        LimitUnit::Week => {
            let monday = date - Days::new(u64::from(date.weekday().num_days_from_monday()));
            (monday, monday + Days::new(7))
        }
        LimitUnit::Month => {
            let first = date.with_day(1).expect("day 1 exists in every month");
            let next = if first.month() == 12 {
                NaiveDate::from_ymd_opt(first.year() + 1, 1, 1)
            } else {
                NaiveDate::from_ymd_opt(first.year(), first.month() + 1, 1)
            }
            .expect("first of month is a valid date");
            (first, next)
        }
        LimitUnit::Year => {
            let first = NaiveDate::from_ymd_opt(date.year(), 1, 1)
                .expect("January 1st is a valid date");
            let next = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                .expect("January 1st is a valid date");
            (first, next)
        }
    };

    Span::new(midnight_ms(first), midnight_ms(next))
}

fn midnight_ms(date: NaiveDate) -> Ms {
    date.and_time(NaiveTime::MIN).and_utc().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY: Ms = 86_400_000;

    // 2024-03-15T00:00:00Z (a Friday).
    const MAR15: Ms = 1_710_460_800_000;
    // 2024-03-11T00:00:00Z (the Monday of that week).
    const MAR11: Ms = 1_710_115_200_000;
    // 2024-03-01T00:00:00Z.
    const MAR1: Ms = 1_709_251_200_000;
    // 2024-01-01T00:00:00Z.
    const JAN1: Ms = 1_704_067_200_000;

    #[test]
    fn day_window() {
        let noon = MAR15 + 12 * 3_600_000;
        let w = window_containing(LimitUnit::Day, noon);
        assert_eq!(w, Span::new(MAR15, MAR15 + DAY));
    }

    #[test]
    fn day_window_boundaries() {
        let w = window_containing(LimitUnit::Day, MAR15);
        assert_eq!(w.start, MAR15); // midnight belongs to its own day
        let w = window_containing(LimitUnit::Day, MAR15 + DAY - 1);
        assert_eq!(w.start, MAR15); // last millisecond still inside
        let w = window_containing(LimitUnit::Day, MAR15 + DAY);
        assert_eq!(w.start, MAR15 + DAY); // next midnight rolls over
    }

    #[test]
    fn week_window_starts_monday() {
        let w = window_containing(LimitUnit::Week, MAR15);
        assert_eq!(w, Span::new(MAR11, MAR11 + 7 * DAY));
        // The Monday itself maps to the same window.
        assert_eq!(window_containing(LimitUnit::Week, MAR11), w);
        // Sunday night is the last day of the same window.
        assert_eq!(window_containing(LimitUnit::Week, MAR11 + 7 * DAY - 1), w);
    }

    #[test]
    fn week_window_across_year_boundary() {
        // 2025-01-01 (Wednesday) belongs to the week starting 2024-12-30.
        let jan1_2025: Ms = 1_735_689_600_000;
        let dec30_2024: Ms = 1_735_516_800_000;
        let w = window_containing(LimitUnit::Week, jan1_2025);
        assert_eq!(w, Span::new(dec30_2024, dec30_2024 + 7 * DAY));
    }

    #[test]
    fn month_window() {
        let w = window_containing(LimitUnit::Month, MAR15 + 5 * 3_600_000);
        // March has 31 days.
        assert_eq!(w, Span::new(MAR1, MAR1 + 31 * DAY));
    }

    #[test]
    fn month_window_leap_february() {
        // 2024-02-29T10:00Z — February 2024 has 29 days.
        let feb1: Ms = 1_706_745_600_000;
        let feb29_10h = feb1 + 28 * DAY + 10 * 3_600_000;
        let w = window_containing(LimitUnit::Month, feb29_10h);
        assert_eq!(w, Span::new(feb1, feb1 + 29 * DAY));
    }

    #[test]
    fn month_window_december_rolls_year() {
        // 2024-12-15 → [2024-12-01, 2025-01-01).
        let dec1: Ms = 1_733_011_200_000;
        let jan1_2025: Ms = 1_735_689_600_000;
        let w = window_containing(LimitUnit::Month, dec1 + 14 * DAY);
        assert_eq!(w, Span::new(dec1, jan1_2025));
    }

    #[test]
    fn year_window() {
        let w = window_containing(LimitUnit::Year, MAR15);
        // 2024 is a leap year: 366 days.
        assert_eq!(w, Span::new(JAN1, JAN1 + 366 * DAY));
    }

    #[test]
    fn windows_nest() {
        let at = MAR15 + 9 * 3_600_000;
        let day = window_containing(LimitUnit::Day, at);
        let month = window_containing(LimitUnit::Month, at);
        let year = window_containing(LimitUnit::Year, at);
        assert!(month.start <= day.start && day.end <= month.end);
        assert!(year.start <= month.start && month.end <= year.end);
    }
}
