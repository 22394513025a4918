//! Shared fixtures: a scripted upstream provider that records every call,
//! and helpers for building weekday bar series.

#![allow(dead_code)]

use chrono::{Datelike, NaiveDate, Weekday};
use regimelab_core::clock::{Clock, FixedClock};
use regimelab_core::data::{
    BarCache, DataError, DataProvider, DataSource, FetchResult, FetchSpan, SyncOrchestrator,
};
use regimelab_core::domain::{Bar, BarSeries, Interval};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub fn d(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

/// Weekdays in `[start, end]`.
pub fn weekdays(start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    start
        .iter_days()
        .take_while(|day| *day <= end)
        .filter(|day| !matches!(day.weekday(), Weekday::Sat | Weekday::Sun))
        .collect()
}

pub fn bar(date: NaiveDate, close: f64) -> Bar {
    Bar {
        date,
        open: close,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 1_000,
    }
}

/// One bar per weekday in `[start, end]`, close given by the bar index.
pub fn weekday_series(start: NaiveDate, end: NaiveDate, close: impl Fn(usize) -> f64) -> BarSeries {
    weekdays(start, end)
        .into_iter()
        .enumerate()
        .map(|(i, day)| bar(day, close(i)))
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Call {
    pub span: FetchSpan,
    pub interval: Interval,
}

/// Upstream stand-in. Serves whatever bars were registered per symbol,
/// filtered to the requested span, and records each call.
pub struct MockProvider {
    clock: Arc<FixedClock>,
    data: Mutex<HashMap<String, BarSeries>>,
    failing: Mutex<HashSet<String>>,
    available: AtomicBool,
    calls: Mutex<Vec<(String, Call)>>,
}

impl MockProvider {
    pub fn new(clock: Arc<FixedClock>) -> Self {
        Self {
            clock,
            data: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            available: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn set_series(&self, symbol: &str, series: BarSeries) {
        self.data.lock().unwrap().insert(symbol.to_string(), series);
    }

    pub fn set_failing(&self, symbol: &str, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(symbol.to_string());
        } else {
            set.remove(symbol);
        }
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(String, Call)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, symbol: &str) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, c)| c)
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().unwrap().clear();
    }
}

impl DataProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn fetch(
        &self,
        symbol: &str,
        span: FetchSpan,
        interval: Interval,
    ) -> Result<FetchResult, DataError> {
        self.calls
            .lock()
            .unwrap()
            .push((symbol.to_string(), Call { span, interval }));

        if self.failing.lock().unwrap().contains(symbol) {
            return Err(DataError::NetworkUnreachable("scripted failure".into()));
        }

        let today = self.clock.today();
        let (start, end) = match span {
            FetchSpan::Period(period) => (period.start_from(today), Some(today)),
            FetchSpan::Range { start, end } => (Some(start), Some(end)),
        };
        let bars = self
            .data
            .lock()
            .unwrap()
            .get(symbol)
            .map(|s| s.slice(start, end))
            .unwrap_or_default();
        if bars.is_empty() {
            return Err(DataError::NoData {
                symbol: symbol.to_string(),
            });
        }
        Ok(FetchResult {
            symbol: symbol.to_string(),
            bars,
            source: DataSource::Mock,
        })
    }

    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

/// A temp cache dir, a pinned clock, a mock provider and an orchestrator
/// wired together.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub clock: Arc<FixedClock>,
    pub provider: Arc<MockProvider>,
    pub sync: Arc<SyncOrchestrator>,
}

impl Harness {
    pub fn new(today: NaiveDate) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(FixedClock::new(today));
        let provider = Arc::new(MockProvider::new(clock.clone()));
        let sync = Arc::new(
            SyncOrchestrator::new(provider.clone(), BarCache::new(dir.path())).with_clock(clock.clone()),
        );
        Self {
            dir,
            clock,
            provider,
            sync,
        }
    }

    pub fn cache(&self) -> &BarCache {
        self.sync.cache()
    }
}
