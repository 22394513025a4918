//! Trading calendar used for cache staleness decisions.
//!
//! Trading days are Monday to Friday minus an optional holiday list. Staleness
//! is measured in trading days, which makes the weekend rule fall out
//! naturally: a cache ending Friday is zero days behind on Saturday and Sunday.

use chrono::{Datelike, NaiveDate, Weekday};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Default)]
pub struct TradingCalendar {
    holidays: BTreeSet<NaiveDate>,
}

impl TradingCalendar {
    /// Weekday-only calendar.
    pub fn weekdays() -> Self {
        Self::default()
    }

    pub fn with_holidays(holidays: impl IntoIterator<Item = NaiveDate>) -> Self {
        Self {
            holidays: holidays.into_iter().collect(),
        }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Number of trading days `d` with `last < d <= today`.
    ///
    /// Zero when `last` is on or after `today`.
    pub fn trading_days_behind(&self, last: NaiveDate, today: NaiveDate) -> u32 {
        if last >= today {
            return 0;
        }
        let mut count = 0;
        let mut day = last;
        while day < today {
            day = match day.succ_opt() {
                Some(d) => d,
                None => break,
            };
            if self.is_trading_day(day) {
                count += 1;
            }
        }
        count
    }

    /// Most recent trading day on or before `date`.
    pub fn last_trading_day(&self, date: NaiveDate) -> NaiveDate {
        let mut day = date;
        while !self.is_trading_day(day) {
            match day.pred_opt() {
                Some(d) => day = d,
                None => break,
            }
        }
        day
    }
}
