//! Point-in-time regime flags for an arbitrary analysis timeline.
//!
//! For each timeline date the flags use only bars dated on or before it:
//! moving averages are trailing, and alignment onto the timeline only ever
//! carries values forward. Upstream trouble never fails the caller; the
//! affected flag is reported as all `false` with a warning.

use super::{InstrumentRegime, RegimeDirection, RegimeFlags, RegimeSnapshot};
use crate::align::{point_in_time_join, FillPolicy};
use crate::config::RegimeConfig;
use crate::data::sectors::SectorMap;
use crate::data::sync::{validate_symbol, SyncOptions, SyncOrchestrator, HISTORY_START};
use crate::data::DataError;
use crate::domain::{BarSeries, Interval};
use crate::memo::{InMemoryMemo, MemoCache};
use chrono::{Months, NaiveDate};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, warn};

/// Memo of a single instrument's regime on a date.
pub type RegimeMemo = dyn MemoCache<(String, NaiveDate), bool>;

#[derive(Debug, Clone, PartialEq)]
pub struct RegimeSettings {
    pub benchmark: String,
    pub benchmark_window: usize,
    pub sector_window: usize,
    pub warmup_months: u32,
    pub interval: Interval,
    /// Drop bars dated on the clock's today before computing, so a partial
    /// bar for a session still in progress never feeds a flag.
    pub exclude_today: bool,
    pub sync_options: SyncOptions,
}

impl Default for RegimeSettings {
    fn default() -> Self {
        Self {
            benchmark: "SPY".into(),
            benchmark_window: 200,
            sector_window: 50,
            warmup_months: 12,
            interval: Interval::Day1,
            exclude_today: false,
            sync_options: SyncOptions::default(),
        }
    }
}

impl RegimeSettings {
    pub fn from_config(config: &RegimeConfig) -> Self {
        Self {
            benchmark: config.benchmark.symbol.clone(),
            benchmark_window: config.benchmark.window,
            sector_window: config.sectors.window,
            warmup_months: config.warmup_months,
            ..Self::default()
        }
    }
}

pub struct RegimeEngine {
    sync: Arc<SyncOrchestrator>,
    sectors: SectorMap,
    settings: RegimeSettings,
    memo: Arc<RegimeMemo>,
}

impl RegimeEngine {
    /// Windows below one bar are raised to one.
    pub fn new(sync: Arc<SyncOrchestrator>, sectors: SectorMap, mut settings: RegimeSettings) -> Self {
        settings.benchmark_window = settings.benchmark_window.max(1);
        settings.sector_window = settings.sector_window.max(1);
        Self {
            sync,
            sectors,
            settings,
            memo: Arc::new(InMemoryMemo::new()),
        }
    }

    /// Replace the memo, e.g. to share one across engines in a run.
    pub fn with_memo(mut self, memo: Arc<RegimeMemo>) -> Self {
        self.memo = memo;
        self
    }

    pub fn settings(&self) -> &RegimeSettings {
        &self.settings
    }

    pub fn sector_for(&self, symbol: &str) -> &str {
        self.sectors.sector_for(symbol)
    }

    /// Flags for `symbol` on every date of `timeline`, in timeline order.
    pub fn historical_regime(
        &self,
        symbol: &str,
        timeline: &[NaiveDate],
    ) -> Result<RegimeFlags, DataError> {
        validate_symbol(symbol)?;
        let (Some(&earliest), Some(&latest)) = (timeline.iter().min(), timeline.iter().max())
        else {
            return Ok(RegimeFlags::default());
        };

        let fetch_start = warmup_start(earliest, self.settings.warmup_months);
        let benchmark = self.settings.benchmark.as_str();
        let sector = self.sectors.sector_for(symbol);

        // The sector instrument defaults to the benchmark; fetch it once.
        let mut fetched: HashMap<&str, Option<BarSeries>> = HashMap::new();
        for instrument in [benchmark, sector] {
            if !fetched.contains_key(instrument) {
                let series = self.fetch_series(instrument, fetch_start, latest);
                fetched.insert(instrument, series);
            }
        }

        let market_ok = self.align_flags(
            benchmark,
            fetched.get(benchmark).and_then(Option::as_ref),
            self.settings.benchmark_window,
            timeline,
        );
        let sector_ok = self.align_flags(
            sector,
            fetched.get(sector).and_then(Option::as_ref),
            self.settings.sector_window,
            timeline,
        );

        debug!(symbol, sector, dates = timeline.len(), "regime computed");
        Ok(RegimeFlags::new(market_ok, sector_ok))
    }

    /// Regime of the benchmark and of `symbol`'s sector instrument today.
    ///
    /// Memoized per (instrument, date), so a batch over many symbols that
    /// share a sector computes each instrument once per day.
    pub fn current_regime(&self, symbol: &str) -> Result<RegimeSnapshot, DataError> {
        validate_symbol(symbol)?;
        let today = self.sync.today();
        let benchmark = self.settings.benchmark.clone();
        let sector = self.sectors.sector_for(symbol).to_string();

        let mut regimes = BTreeMap::new();
        let market = self.instrument_today(&benchmark, self.settings.benchmark_window, today);
        regimes.insert(benchmark.clone(), market);
        if sector != benchmark {
            let ok = self.instrument_today(&sector, self.settings.sector_window, today);
            regimes.insert(sector, ok);
        }
        Ok(RegimeSnapshot {
            as_of: today,
            regimes,
        })
    }

    /// Drop memoized regimes, e.g. after a forced resync.
    pub fn clear_memo(&self) {
        self.memo.clear();
    }

    fn instrument_today(&self, instrument: &str, window: usize, today: NaiveDate) -> bool {
        let key = (format!("{instrument}@{window}"), today);
        if let Some(ok) = self.memo.get(&key) {
            return ok;
        }
        let start = warmup_start(today, self.settings.warmup_months);
        let series = self.fetch_series(instrument, start, today);
        let ok = self
            .align_flags(instrument, series.as_ref(), window, &[today])
            .first()
            .copied()
            .unwrap_or(false);
        self.memo.put(key, ok);
        ok
    }

    /// Bars for an instrument, or `None` (with a warning) when unavailable.
    fn fetch_series(&self, instrument: &str, start: NaiveDate, end: NaiveDate) -> Option<BarSeries> {
        let series = match self.sync.get_range(
            instrument,
            start,
            end,
            self.settings.interval,
            self.settings.sync_options,
        ) {
            Ok(series) => series,
            Err(e) => {
                warn!(instrument, error = %e, "regime input unavailable, flag defaults to false");
                return None;
            }
        };
        if self.settings.exclude_today {
            let today = self.sync.today();
            let kept: BarSeries = series.bars().iter().filter(|b| b.date < today).cloned().collect();
            return Some(kept);
        }
        Some(series)
    }

    fn align_flags(
        &self,
        instrument: &str,
        series: Option<&BarSeries>,
        window: usize,
        timeline: &[NaiveDate],
    ) -> Vec<bool> {
        let Some(series) = series else {
            return vec![false; timeline.len()];
        };
        if series.len() < window {
            warn!(
                instrument,
                bars = series.len(),
                window,
                "insufficient history for moving average, flag defaults to false"
            );
            return vec![false; timeline.len()];
        }
        let regime = InstrumentRegime::compute(series, window, RegimeDirection::Above);
        point_in_time_join(&regime.regime_points(), timeline, &FillPolicy::conservative())
    }
}

/// First date to fetch so a moving average is warm by `earliest`.
pub(crate) fn warmup_start(earliest: NaiveDate, months: u32) -> NaiveDate {
    earliest
        .checked_sub_months(Months::new(months))
        .unwrap_or(HISTORY_START)
}
