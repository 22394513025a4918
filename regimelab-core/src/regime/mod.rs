//! Market regime flags.
//!
//! A regime flag says whether an instrument is in a healthy trend on a date:
//! close above its moving average for equities and sector funds, below it
//! for volatility and yield tickers. Flags are always evaluated in the
//! instrument's own calendar and only then aligned onto whatever timeline the
//! caller analyses.

pub mod engine;
pub mod table;

pub use engine::{RegimeEngine, RegimeSettings};
pub use table::{ConsolidatedRegimeCache, RegimeTable, TableMeta};

use crate::domain::BarSeries;
use crate::indicators::Sma;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which side of the moving average counts as healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegimeDirection {
    Above,
    Below,
}

impl RegimeDirection {
    pub fn is_ok(self, close: f64, ma: f64) -> bool {
        match self {
            RegimeDirection::Above => close > ma,
            RegimeDirection::Below => close < ma,
        }
    }
}

/// An instrument whose regime is tracked, with its moving-average window.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TrackedInstrument {
    pub symbol: String,
    pub window: usize,
    pub direction: RegimeDirection,
}

impl TrackedInstrument {
    pub fn new(symbol: &str, window: usize, direction: RegimeDirection) -> Self {
        Self {
            symbol: symbol.to_string(),
            window,
            direction,
        }
    }

    /// Column prefix: lowercase alphanumerics of the ticker (`^VIX` → `vix`).
    pub fn prefix(&self) -> String {
        self.symbol
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }
}

/// Regime flags aligned 1:1 to an analysis timeline.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegimeFlags {
    pub market_ok: Vec<bool>,
    pub sector_ok: Vec<bool>,
    pub overall_ok: Vec<bool>,
}

impl RegimeFlags {
    pub fn new(market_ok: Vec<bool>, sector_ok: Vec<bool>) -> Self {
        let overall_ok = market_ok
            .iter()
            .zip(&sector_ok)
            .map(|(m, s)| *m && *s)
            .collect();
        Self {
            market_ok,
            sector_ok,
            overall_ok,
        }
    }

    pub fn all_false(len: usize) -> Self {
        Self::new(vec![false; len], vec![false; len])
    }

    pub fn len(&self) -> usize {
        self.overall_ok.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overall_ok.is_empty()
    }
}

/// Per-instrument regime as of one date.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegimeSnapshot {
    pub as_of: NaiveDate,
    pub regimes: BTreeMap<String, bool>,
}

impl RegimeSnapshot {
    /// Regime for a symbol; unknown symbols are not ok.
    pub fn is_ok(&self, symbol: &str) -> bool {
        self.regimes.get(symbol).copied().unwrap_or(false)
    }
}

/// Moving average and regime per bar of one instrument's series.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentRegime {
    pub dates: Vec<NaiveDate>,
    pub closes: Vec<f64>,
    pub ma: Vec<Option<f64>>,
    pub regime_ok: Vec<bool>,
}

impl InstrumentRegime {
    /// Compute over the whole series. Bars without a moving average yet are
    /// not ok.
    pub fn compute(series: &BarSeries, window: usize, direction: RegimeDirection) -> Self {
        Self::from_closes(series.dates(), series.closes(), window, direction)
    }

    pub fn from_closes(
        dates: Vec<NaiveDate>,
        closes: Vec<f64>,
        window: usize,
        direction: RegimeDirection,
    ) -> Self {
        let ma = Sma::new(window).values(&closes);
        let regime_ok = closes
            .iter()
            .zip(&ma)
            .map(|(&close, ma)| match ma {
                Some(ma) if !close.is_nan() => direction.is_ok(close, *ma),
                _ => false,
            })
            .collect();
        Self {
            dates,
            closes,
            ma,
            regime_ok,
        }
    }

    /// `(date, regime)` pairs for point-in-time alignment.
    pub fn regime_points(&self) -> Vec<(NaiveDate, bool)> {
        self.dates.iter().copied().zip(self.regime_ok.iter().copied()).collect()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}
