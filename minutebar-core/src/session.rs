//! Regular-trading-hours session windows.
//!
//! Picks the bar-fetch window for a poll cycle: the live session from its open
//! up to `now`, or the most recent completed session when the market is shut.
//!
//! Exchange holidays are not modeled. A holiday is treated as an ordinary
//! weekday and yields a window with little or no data.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A session's bounds in UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionWindow {
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
    /// True when `close` is "now" inside a session still in progress.
    pub partial: bool,
}

impl SessionWindow {
    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        self.open <= ts && ts <= self.close
    }
}

impl std::fmt::Display for SessionWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} -> {}{}",
            self.open.to_rfc3339(),
            self.close.to_rfc3339(),
            if self.partial { " (live)" } else { "" }
        )
    }
}

/// Fixed daily open/close clock times in an exchange time zone, weekdays only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarketCalendar {
    pub tz: Tz,
    pub open: NaiveTime,
    pub close: NaiveTime,
}

impl Default for MarketCalendar {
    fn default() -> Self {
        Self::us_equities()
    }
}

impl MarketCalendar {
    /// US equities regular hours: 09:30 to 16:00 America/New_York.
    pub fn us_equities() -> Self {
        Self {
            tz: chrono_tz::America::New_York,
            open: NaiveTime::from_hms_opt(9, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    /// Full regular-hours bounds of a civil day in the exchange zone.
    pub fn session_bounds(&self, day: NaiveDate) -> SessionWindow {
        SessionWindow {
            open: self.localize(day, self.open),
            close: self.localize(day, self.close),
            partial: false,
        }
    }

    /// Window to request from upstream at instant `now`.
    ///
    /// Inside a session this is `(open, now)`; otherwise the full bounds of
    /// the most recent session that has already opened.
    pub fn window_for(&self, now: DateTime<Utc>) -> SessionWindow {
        let local_day = now.with_timezone(&self.tz).date_naive();
        let candidate = last_weekday_on_or_before(local_day);
        let mut session = self.session_bounds(candidate);

        if now < session.open {
            let prev = last_weekday_on_or_before(session_day_before(candidate));
            session = self.session_bounds(prev);
        }

        if session.contains(now) {
            SessionWindow {
                open: session.open,
                close: now,
                partial: true,
            }
        } else {
            session
        }
    }

    fn localize(&self, day: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
        let naive = day.and_time(time);
        match self.tz.from_local_datetime(&naive).earliest() {
            Some(local) => local.with_timezone(&Utc),
            // Clock gap (spring-forward); the wall time does not exist locally.
            None => self.tz.from_utc_datetime(&naive).with_timezone(&Utc),
        }
    }
}

fn is_weekend(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

fn last_weekday_on_or_before(mut day: NaiveDate) -> NaiveDate {
    while is_weekend(day) {
        day = session_day_before(day);
    }
    day
}

fn session_day_before(day: NaiveDate) -> NaiveDate {
    day.pred_opt().unwrap_or(day)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ny(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        chrono_tz::America::New_York
            .with_ymd_and_hms(y, m, d, h, min, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn inside_session_returns_open_to_now() {
        let cal = MarketCalendar::us_equities();
        // Tuesday 2024-03-05, 11:15 New York
        let now = ny(2024, 3, 5, 11, 15);
        let w = cal.window_for(now);
        assert_eq!(w.open, ny(2024, 3, 5, 9, 30));
        assert_eq!(w.close, now);
        assert!(w.partial);
    }

    #[test]
    fn exactly_at_open_is_partial_empty_window() {
        let cal = MarketCalendar::us_equities();
        let now = ny(2024, 3, 5, 9, 30);
        let w = cal.window_for(now);
        assert_eq!(w.open, now);
        assert_eq!(w.close, now);
        assert!(w.partial);
    }

    #[test]
    fn before_open_returns_previous_weekday() {
        let cal = MarketCalendar::us_equities();
        let w = cal.window_for(ny(2024, 3, 5, 8, 0));
        assert_eq!(w.open, ny(2024, 3, 4, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 4, 16, 0));
        assert!(!w.partial);
    }

    #[test]
    fn monday_before_open_skips_weekend_to_friday() {
        let cal = MarketCalendar::us_equities();
        let w = cal.window_for(ny(2024, 3, 4, 7, 45));
        assert_eq!(w.open, ny(2024, 3, 1, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 1, 16, 0));
    }

    #[test]
    fn after_close_returns_full_same_day_session() {
        let cal = MarketCalendar::us_equities();
        let w = cal.window_for(ny(2024, 3, 5, 18, 30));
        assert_eq!(w.open, ny(2024, 3, 5, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 5, 16, 0));
        assert!(!w.partial);
    }

    #[test]
    fn saturday_returns_friday_full_session() {
        let cal = MarketCalendar::us_equities();
        let w = cal.window_for(ny(2024, 3, 9, 12, 0));
        assert_eq!(w.open, ny(2024, 3, 8, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 8, 16, 0));
    }

    #[test]
    fn sunday_early_morning_returns_friday_full_session() {
        let cal = MarketCalendar::us_equities();
        let w = cal.window_for(ny(2024, 3, 10, 1, 0));
        assert_eq!(w.open, ny(2024, 3, 8, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 8, 16, 0));
    }

    #[test]
    fn utc_midnight_is_still_previous_local_day() {
        let cal = MarketCalendar::us_equities();
        // 2024-03-06 02:00 UTC is 21:00 on Tuesday 2024-03-05 in New York.
        let now = Utc.with_ymd_and_hms(2024, 3, 6, 2, 0, 0).unwrap();
        let w = cal.window_for(now);
        assert_eq!(w.open, ny(2024, 3, 5, 9, 30));
        assert_eq!(w.close, ny(2024, 3, 5, 16, 0));
    }

    #[test]
    fn session_bounds_track_daylight_saving() {
        let cal = MarketCalendar::us_equities();
        // EST (UTC-5) before the March switch, EDT (UTC-4) after.
        let winter = cal.session_bounds(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        let summer = cal.session_bounds(NaiveDate::from_ymd_opt(2024, 3, 11).unwrap());
        assert_eq!(winter.open, Utc.with_ymd_and_hms(2024, 3, 8, 14, 30, 0).unwrap());
        assert_eq!(summer.open, Utc.with_ymd_and_hms(2024, 3, 11, 13, 30, 0).unwrap());
    }

    #[test]
    fn holiday_is_treated_as_weekday() {
        let cal = MarketCalendar::us_equities();
        // 2024-12-25 is a market holiday (Wednesday) but is not modeled.
        let w = cal.window_for(ny(2024, 12, 25, 12, 0));
        assert_eq!(w.open, ny(2024, 12, 25, 9, 30));
        assert!(w.partial);
    }
}
