//! Sync orchestrator: decides, per request, whether to serve the cache,
//! fetch only the missing suffix, or refetch the whole window.
//!
//! Upstream calls happen only when the cache cannot satisfy a request. Once
//! a usable cache exists, upstream failures never fail the caller; the stale
//! cache is served with a warning instead.

use super::cache::BarCache;
use super::calendar::TradingCalendar;
use super::provider::{DataError, DataProvider, FetchResult, FetchSpan};
use crate::clock::{Clock, SystemClock};
use crate::domain::{BarSeries, Interval, Period};
use chrono::NaiveDate;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Coverage marker recorded for `max` fetches. Nothing tradable is older.
pub const HISTORY_START: NaiveDate = match NaiveDate::from_ymd_opt(1900, 1, 1) {
    Some(d) => d,
    None => NaiveDate::MIN,
};

const MAX_SYMBOL_LEN: usize = 32;

/// Per-request switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncOptions {
    /// Ignore the cache and refetch the whole window.
    pub force_refresh: bool,
    /// Never go upstream; a missing cache is an error.
    pub cache_only: bool,
}

impl SyncOptions {
    pub fn force() -> Self {
        Self {
            force_refresh: true,
            cache_only: false,
        }
    }

    pub fn offline() -> Self {
        Self {
            force_refresh: false,
            cache_only: true,
        }
    }
}

/// Reject symbols the provider could never resolve before touching disk.
pub fn validate_symbol(symbol: &str) -> Result<(), DataError> {
    let ok = !symbol.is_empty()
        && symbol.len() <= MAX_SYMBOL_LEN
        && symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '^' | '.' | '-' | '=' | '_'));
    if ok {
        Ok(())
    } else {
        Err(DataError::InvalidSymbol(symbol.to_string()))
    }
}

pub fn parse_period(s: &str) -> Result<Period, DataError> {
    s.parse().map_err(DataError::InvalidPeriod)
}

pub fn parse_interval(s: &str) -> Result<Interval, DataError> {
    s.parse().map_err(DataError::InvalidInterval)
}

/// The calendar window a request asks for.
#[derive(Debug, Clone, Copy)]
struct Window {
    /// `None` is unbounded (`max`).
    start: Option<NaiveDate>,
    end: NaiveDate,
    /// What to ask the provider for when the whole window is needed.
    full_span: FetchSpan,
}

impl Window {
    fn coverage_start(&self) -> NaiveDate {
        self.start.unwrap_or(HISTORY_START)
    }

    fn slice(&self, series: &BarSeries) -> BarSeries {
        series.slice(self.start, Some(self.end))
    }
}

pub struct SyncOrchestrator {
    provider: Arc<dyn DataProvider>,
    cache: BarCache,
    calendar: TradingCalendar,
    clock: Arc<dyn Clock>,
}

impl SyncOrchestrator {
    pub fn new(provider: Arc<dyn DataProvider>, cache: BarCache) -> Self {
        Self {
            provider,
            cache,
            calendar: TradingCalendar::weekdays(),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_calendar(mut self, calendar: TradingCalendar) -> Self {
        self.calendar = calendar;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn cache(&self) -> &BarCache {
        &self.cache
    }

    pub fn calendar(&self) -> &TradingCalendar {
        &self.calendar
    }

    pub fn provider(&self) -> &dyn DataProvider {
        self.provider.as_ref()
    }

    pub fn today(&self) -> NaiveDate {
        self.clock.today()
    }

    /// Bars for `symbol` over the lookback `period` ending today.
    pub fn get_data(
        &self,
        symbol: &str,
        period: Period,
        interval: Interval,
        options: SyncOptions,
    ) -> Result<BarSeries, DataError> {
        validate_symbol(symbol)?;
        let today = self.today();
        let window = Window {
            start: period.start_from(today),
            end: today,
            full_span: FetchSpan::Period(period),
        };
        self.sync_window(symbol, interval, window, options)
    }

    /// Bars for `symbol` over the inclusive range `[start, end]`.
    pub fn get_range(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
        interval: Interval,
        options: SyncOptions,
    ) -> Result<BarSeries, DataError> {
        validate_symbol(symbol)?;
        if start > end {
            return Err(DataError::InvalidRange { start, end });
        }
        let window = Window {
            start: Some(start),
            end,
            full_span: FetchSpan::Range { start, end },
        };
        self.sync_window(symbol, interval, window, options)
    }

    /// Sync a batch of symbols over the same period.
    ///
    /// Failures are collected per symbol. If the provider stops accepting
    /// requests mid-batch (circuit breaker), the remaining symbols are
    /// marked failed without further calls.
    pub fn sync_many(
        &self,
        symbols: &[&str],
        period: Period,
        interval: Interval,
        options: SyncOptions,
    ) -> SyncSummary {
        let total = symbols.len();
        let mut summary = SyncSummary {
            total,
            ..SyncSummary::default()
        };

        for (i, symbol) in symbols.iter().enumerate() {
            match self.get_data(symbol, period, interval, options) {
                Ok(series) => {
                    info!(symbol, %interval, records = series.len(), "{}/{} synced", i + 1, total);
                    summary.synced.push((symbol.to_string(), series.len()));
                }
                Err(e) => {
                    warn!(symbol, %interval, error = %e, "{}/{} failed", i + 1, total);
                    summary.errors.push((symbol.to_string(), e));
                }
            }

            if !options.cache_only && !self.provider.is_available() {
                for sym in &symbols[(i + 1)..] {
                    summary
                        .errors
                        .push((sym.to_string(), DataError::CircuitBreakerTripped));
                }
                warn!(skipped = total - i - 1, "provider unavailable, stopping batch");
                break;
            }
        }

        summary
    }

    fn fetch(
        &self,
        symbol: &str,
        span: FetchSpan,
        interval: Interval,
    ) -> Result<FetchResult, DataError> {
        debug!(symbol, %interval, ?span, provider = self.provider.name(), "fetching upstream");
        self.provider.fetch(symbol, span, interval)
    }

    fn sync_window(
        &self,
        symbol: &str,
        interval: Interval,
        window: Window,
        options: SyncOptions,
    ) -> Result<BarSeries, DataError> {
        let today = self.today();

        if options.cache_only && !options.force_refresh {
            let cached = self
                .cache
                .load(symbol, interval)
                .ok_or_else(|| DataError::CacheMiss {
                    symbol: symbol.to_string(),
                    interval,
                })?;
            if let Some(last) = cached.last_date() {
                let behind = self.calendar.trading_days_behind(last, window.end.min(today));
                if behind > 0 {
                    warn!(symbol, %interval, %last, behind, "serving stale cache in cache-only mode");
                }
            }
            return Ok(window.slice(&cached));
        }

        if options.force_refresh {
            info!(symbol, %interval, "force refresh");
            return self.full_fetch(symbol, interval, window);
        }

        let Some((cached, meta)) = self.cache.load_with_metadata(symbol, interval) else {
            info!(symbol, %interval, "no cache, fetching full window");
            return self.full_fetch(symbol, interval, window);
        };

        let needed_from = window.coverage_start();
        if let Some(covered) = meta.covered_from() {
            if covered > needed_from {
                info!(symbol, %interval, %covered, %needed_from, "cache does not reach window start, backfilling");
                let result = self.fetch(symbol, window.full_span, interval);
                return self.merge_or_serve(symbol, interval, window, cached, Some(needed_from), result);
            }
        }

        let Some(last) = cached.last_date() else {
            return self.full_fetch(symbol, interval, window);
        };
        let effective_end = window.end.min(today);
        let behind = self.calendar.trading_days_behind(last, effective_end);
        if behind == 0 {
            debug!(symbol, %interval, %last, "cache is current");
            return Ok(window.slice(&cached));
        }

        let span = if interval.is_intraday() && behind > 1 {
            info!(symbol, %interval, behind, "intraday cache too stale, refetching window");
            window.full_span
        } else {
            let Some(from) = last.succ_opt() else {
                return Ok(window.slice(&cached));
            };
            info!(symbol, %interval, behind, %from, to = %effective_end, "fetching missing suffix");
            FetchSpan::Range {
                start: from,
                end: effective_end,
            }
        };
        let result = self.fetch(symbol, span, interval);
        self.merge_or_serve(symbol, interval, window, cached, meta.coverage_start, result)
    }

    /// Fetch the whole window and overwrite the cache with it.
    fn full_fetch(
        &self,
        symbol: &str,
        interval: Interval,
        window: Window,
    ) -> Result<BarSeries, DataError> {
        let fetched = self.fetch(symbol, window.full_span, interval)?;
        self.cache.save_with_coverage(
            symbol,
            interval,
            &fetched.bars,
            Some(window.coverage_start()),
            fetched.source,
        )?;
        Ok(window.slice(&fetched.bars))
    }

    /// Merge a fetch into an existing cache (fresh bars win), or fall back
    /// to the cache when the fetch failed.
    fn merge_or_serve(
        &self,
        symbol: &str,
        interval: Interval,
        window: Window,
        cached: BarSeries,
        coverage_start: Option<NaiveDate>,
        result: Result<FetchResult, DataError>,
    ) -> Result<BarSeries, DataError> {
        match result {
            Ok(fetched) => {
                let merged = cached.merge(&fetched.bars);
                self.cache
                    .save_with_coverage(symbol, interval, &merged, coverage_start, fetched.source)?;
                debug!(symbol, %interval, added = merged.len() - cached.len(), "cache extended");
                Ok(window.slice(&merged))
            }
            Err(DataError::NoData { .. }) => {
                debug!(symbol, %interval, "provider returned no new bars");
                Ok(window.slice(&cached))
            }
            Err(e) => {
                warn!(symbol, %interval, error = %e, "fetch failed, serving cached data");
                Ok(window.slice(&cached))
            }
        }
    }
}

/// Outcome of a batch sync.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub total: usize,
    /// Symbols served, with the number of bars in the requested window.
    pub synced: Vec<(String, usize)>,
    pub errors: Vec<(String, DataError)>,
}

impl SyncSummary {
    pub fn succeeded(&self) -> usize {
        self.synced.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    pub fn all_succeeded(&self) -> bool {
        self.errors.is_empty()
    }
}
