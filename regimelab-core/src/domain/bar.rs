//! Bar and BarSeries: the fundamental market data units.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// OHLCV bar for a single instrument on a single calendar day.
///
/// Prices are provider-adjusted. Intraday intervals are stored at day
/// granularity like every other interval: the date carries no time of day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl Bar {
    /// Returns true if any OHLC field is NaN.
    pub fn is_void(&self) -> bool {
        self.open.is_nan() || self.high.is_nan() || self.low.is_nan() || self.close.is_nan()
    }

    /// Basic OHLC sanity check: high >= low, high bounds open/close, etc.
    pub fn is_sane(&self) -> bool {
        if self.is_void() {
            return false;
        }
        self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.close > 0.0
    }
}

/// Ascending, date-deduplicated sequence of bars for one (symbol, interval).
///
/// Invariant: dates are strictly increasing. Every constructor enforces it,
/// so a `BarSeries` can never hold two bars for the same day.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BarSeries {
    bars: Vec<Bar>,
}

impl BarSeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from bars in any order.
    ///
    /// When two bars share a date, the one supplied later wins.
    pub fn from_bars(bars: impl IntoIterator<Item = Bar>) -> Self {
        let mut by_date: BTreeMap<NaiveDate, Bar> = BTreeMap::new();
        for bar in bars {
            by_date.insert(bar.date, bar);
        }
        Self {
            bars: by_date.into_values().collect(),
        }
    }

    /// Wrap bars that are already strictly ascending. Returns `None` otherwise.
    pub fn from_sorted(bars: Vec<Bar>) -> Option<Self> {
        if bars.windows(2).all(|w| w[0].date < w[1].date) {
            Some(Self { bars })
        } else {
            None
        }
    }

    /// Merge `newer` into this series. On overlapping dates the bar from
    /// `newer` replaces the existing one.
    pub fn merge(&self, newer: &BarSeries) -> BarSeries {
        Self::from_bars(self.bars.iter().cloned().chain(newer.bars.iter().cloned()))
    }

    /// Bars with `start <= date <= end`. A `None` bound is open.
    pub fn slice(&self, start: Option<NaiveDate>, end: Option<NaiveDate>) -> BarSeries {
        let lo = match start {
            Some(s) => self.bars.partition_point(|b| b.date < s),
            None => 0,
        };
        let hi = match end {
            Some(e) => self.bars.partition_point(|b| b.date <= e),
            None => self.bars.len(),
        };
        let bars = if lo < hi {
            self.bars[lo..hi].to_vec()
        } else {
            Vec::new()
        };
        Self { bars }
    }

    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    pub fn into_bars(self) -> Vec<Bar> {
        self.bars
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.bars.first().map(|b| b.date)
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.bars.last().map(|b| b.date)
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        self.bars.iter().map(|b| b.date).collect()
    }

    pub fn closes(&self) -> Vec<f64> {
        self.bars.iter().map(|b| b.close).collect()
    }

    pub fn get(&self, date: NaiveDate) -> Option<&Bar> {
        self.bars
            .binary_search_by_key(&date, |b| b.date)
            .ok()
            .map(|i| &self.bars[i])
    }
}

impl FromIterator<Bar> for BarSeries {
    fn from_iter<T: IntoIterator<Item = Bar>>(iter: T) -> Self {
        Self::from_bars(iter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(date: &str, close: f64) -> Bar {
        Bar {
            date: NaiveDate::parse_from_str(date, "%Y-%m-%d").unwrap(),
            open: close - 1.0,
            high: close + 1.0,
            low: close - 2.0,
            close,
            volume: 1000,
        }
    }

    #[test]
    fn from_bars_sorts_and_keeps_last_duplicate() {
        let series = BarSeries::from_bars(vec![
            bar("2024-01-03", 102.0),
            bar("2024-01-02", 100.0),
            bar("2024-01-03", 105.0),
        ]);
        assert_eq!(series.len(), 2);
        assert_eq!(series.bars()[0].close, 100.0);
        assert_eq!(series.bars()[1].close, 105.0);
    }

    #[test]
    fn from_sorted_rejects_duplicates() {
        assert!(BarSeries::from_sorted(vec![bar("2024-01-02", 1.0), bar("2024-01-02", 2.0)]).is_none());
        assert!(BarSeries::from_sorted(vec![bar("2024-01-02", 1.0), bar("2024-01-03", 2.0)]).is_some());
    }

    #[test]
    fn merge_prefers_newer_values() {
        let old = BarSeries::from_bars(vec![bar("2024-01-02", 100.0), bar("2024-01-03", 101.0)]);
        let new = BarSeries::from_bars(vec![bar("2024-01-03", 111.0), bar("2024-01-04", 112.0)]);
        let merged = old.merge(&new);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged.get(bar("2024-01-03", 0.0).date).unwrap().close, 111.0);
        assert_eq!(merged.last_date(), Some(bar("2024-01-04", 0.0).date));
    }

    #[test]
    fn slice_is_inclusive_and_handles_open_bounds() {
        let series = BarSeries::from_bars(vec![
            bar("2024-01-02", 1.0),
            bar("2024-01-03", 2.0),
            bar("2024-01-04", 3.0),
        ]);
        let d = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        assert_eq!(series.slice(Some(d("2024-01-03")), None).len(), 2);
        assert_eq!(series.slice(None, Some(d("2024-01-03"))).len(), 2);
        assert_eq!(series.slice(Some(d("2024-01-03")), Some(d("2024-01-03"))).len(), 1);
        assert!(series.slice(Some(d("2024-02-01")), None).is_empty());
        assert!(series.slice(Some(d("2024-01-04")), Some(d("2024-01-02"))).is_empty());
    }

    #[test]
    fn sanity_checks() {
        assert!(bar("2024-01-02", 100.0).is_sane());
        let mut b = bar("2024-01-02", 100.0);
        b.high = 50.0;
        assert!(!b.is_sane());
        b.close = f64::NAN;
        assert!(b.is_void());
    }
}
