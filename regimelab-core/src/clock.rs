//! Source of "today" for staleness and snapshot decisions.
//!
//! Everything that asks what day it is goes through a `Clock`, so tests can
//! pin the date (a Friday cache queried on a Monday, say) without touching
//! the system time.

use chrono::{Datelike, Local, NaiveDate};
use std::sync::atomic::{AtomicI32, Ordering};

pub trait Clock: Send + Sync {
    fn today(&self) -> NaiveDate;
}

/// Local calendar date of the host.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn today(&self) -> NaiveDate {
        Local::now().date_naive()
    }
}

/// A clock pinned to a date, which tests may move forward.
#[derive(Debug)]
pub struct FixedClock {
    // Days since the common era, so the date can change behind `&self`.
    days: AtomicI32,
}

impl FixedClock {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            days: AtomicI32::new(date.num_days_from_ce()),
        }
    }

    pub fn set(&self, date: NaiveDate) {
        self.days.store(date.num_days_from_ce(), Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn today(&self) -> NaiveDate {
        let days = self.days.load(Ordering::SeqCst);
        NaiveDate::from_num_days_from_ce_opt(days).unwrap_or_default()
    }
}
