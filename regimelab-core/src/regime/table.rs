//! Consolidated regime cache: one wide table of every tracked instrument.
//!
//! Layout:
//! - `{cache_dir}/regime_table.parquet`: `date` plus, per instrument,
//!   `{prefix}_close`, `{prefix}_{window}ma` and `{prefix}_regime_ok`. The
//!   benchmark is also tracked at the sector window for symbols without a
//!   sector; that group shares the close column and stores
//!   `{prefix}_{window}ma` and `{prefix}_{window}ma_regime_ok`.
//! - `{cache_dir}/regime_table.meta.json`: covered range, instrument set,
//!   build time and row count
//!
//! Coverage is monotonic. Once `[start, end]` is materialized the covered
//! range only grows: earlier starts trigger a rebuild over the union range,
//! later ends append a suffix computed from the stored closes plus only the
//! new bars. Reads inside the covered range never touch the provider.
//!
//! The recorded end of coverage stops short of today: a bar dated today or
//! later may not be published yet, so those dates are fetched again by the
//! next extend, which always resumes after the table's last row.

use super::engine::warmup_start;
use super::{InstrumentRegime, RegimeFlags, RegimeSnapshot, TrackedInstrument};
use crate::align::{point_in_time_join, FillPolicy};
use crate::config::{ConfigError, RegimeConfig};
use crate::data::format::atomic_write;
use crate::data::sectors::SectorMap;
use crate::data::sync::{validate_symbol, SyncOptions, SyncOrchestrator};
use crate::data::DataError;
use crate::domain::{BarSeries, Interval};
use crate::memo::{InMemoryMemo, MemoCache};
use chrono::{NaiveDate, NaiveDateTime, Utc};
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub const TABLE_FILE: &str = "regime_table.parquet";
pub const META_FILE: &str = "regime_table.meta.json";

/// Memo of table snapshots by date.
pub type SnapshotMemo = dyn MemoCache<NaiveDate, RegimeSnapshot>;

/// Bars fetched during one build or extend, keyed by symbol and range, so an
/// instrument tracked at two windows is requested once.
type Fetches = HashMap<(String, NaiveDate, NaiveDate), Option<BarSeries>>;

/// Columns of one instrument, aligned to the table's dates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InstrumentColumns {
    pub close: Vec<Option<f64>>,
    pub ma: Vec<Option<f64>>,
    pub regime_ok: Vec<bool>,
}

impl InstrumentColumns {
    /// Columns for an instrument with no data: values absent, regime false.
    fn degraded(len: usize) -> Self {
        Self {
            close: vec![None; len],
            ma: vec![None; len],
            regime_ok: vec![false; len],
        }
    }

    /// Close and MA exact-aligned; regime carried forward from the
    /// instrument's own calendar.
    fn aligned(regime: &InstrumentRegime, dates: &[NaiveDate]) -> Self {
        let closes: Vec<(NaiveDate, Option<f64>)> = regime
            .dates
            .iter()
            .zip(&regime.closes)
            .map(|(d, c)| (*d, (!c.is_nan()).then_some(*c)))
            .collect();
        let mas: Vec<(NaiveDate, Option<f64>)> =
            regime.dates.iter().copied().zip(regime.ma.iter().copied()).collect();
        Self {
            close: point_in_time_join(&closes, dates, &FillPolicy::exact(None)),
            ma: point_in_time_join(&mas, dates, &FillPolicy::exact(None)),
            regime_ok: point_in_time_join(
                &regime.regime_points(),
                dates,
                &FillPolicy::conservative(),
            ),
        }
    }

    fn extend(&mut self, other: InstrumentColumns) {
        self.close.extend(other.close);
        self.ma.extend(other.ma);
        self.regime_ok.extend(other.regime_ok);
    }
}

/// The materialized wide table.
#[derive(Debug, Clone, PartialEq)]
pub struct RegimeTable {
    dates: Vec<NaiveDate>,
    instruments: Vec<TrackedInstrument>,
    columns: Vec<InstrumentColumns>,
}

impl RegimeTable {
    pub fn empty(instruments: Vec<TrackedInstrument>) -> Self {
        let columns = vec![InstrumentColumns::default(); instruments.len()];
        Self {
            dates: Vec::new(),
            instruments,
            columns,
        }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn instruments(&self) -> &[TrackedInstrument] {
        &self.instruments
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    /// Columns of `symbol` at the window it was first tracked with.
    pub fn column(&self, symbol: &str) -> Option<&InstrumentColumns> {
        self.position(symbol, None).map(|idx| &self.columns[idx])
    }

    /// Columns of exactly this instrument and window.
    pub fn column_for(&self, instrument: &TrackedInstrument) -> Option<&InstrumentColumns> {
        self.instruments
            .iter()
            .position(|i| i == instrument)
            .map(|idx| &self.columns[idx])
    }

    fn position(&self, symbol: &str, window: Option<usize>) -> Option<usize> {
        self.instruments
            .iter()
            .position(|i| i.symbol == symbol && window.map_or(true, |w| i.window == w))
    }

    /// Rows with `start <= date <= end`.
    pub fn slice(&self, start: NaiveDate, end: NaiveDate) -> RegimeTable {
        let lo = self.dates.partition_point(|d| *d < start);
        let hi = self.dates.partition_point(|d| *d <= end).max(lo);
        RegimeTable {
            dates: self.dates[lo..hi].to_vec(),
            instruments: self.instruments.clone(),
            columns: self
                .columns
                .iter()
                .map(|c| InstrumentColumns {
                    close: c.close[lo..hi].to_vec(),
                    ma: c.ma[lo..hi].to_vec(),
                    regime_ok: c.regime_ok[lo..hi].to_vec(),
                })
                .collect(),
        }
    }

    /// `(date, regime)` for every row, for point-in-time alignment. With no
    /// `window` the instrument's first tracked window is used.
    pub fn regime_points(&self, symbol: &str, window: Option<usize>) -> Option<Vec<(NaiveDate, bool)>> {
        self.position(symbol, window).map(|idx| {
            self.dates
                .iter()
                .copied()
                .zip(self.columns[idx].regime_ok.iter().copied())
                .collect()
        })
    }

    /// Per-instrument regime at the last row dated on or before `date`, at
    /// each instrument's first tracked window.
    pub fn snapshot_at(&self, date: NaiveDate) -> Option<RegimeSnapshot> {
        let idx = self.dates.partition_point(|d| *d <= date).checked_sub(1)?;
        let mut regimes = BTreeMap::new();
        for (inst, col) in self.instruments.iter().zip(&self.columns) {
            regimes.entry(inst.symbol.clone()).or_insert(col.regime_ok[idx]);
        }
        Some(RegimeSnapshot {
            as_of: date,
            regimes,
        })
    }

    /// Append rows dated after the current last row.
    fn append(&mut self, dates: Vec<NaiveDate>, columns: Vec<InstrumentColumns>) {
        debug_assert!(match (self.dates.last(), dates.first()) {
            (Some(last), Some(first)) => first > last,
            _ => true,
        });
        self.dates.extend(dates);
        for (col, new) in self.columns.iter_mut().zip(columns) {
            col.extend(new);
        }
    }

    pub fn to_dataframe(&self) -> Result<DataFrame, DataError> {
        let epoch = epoch();
        let days: Vec<i32> = self
            .dates
            .iter()
            .map(|d| (*d - epoch).num_days() as i32)
            .collect();

        let mut columns = vec![Column::new("date".into(), days)
            .cast(&DataType::Date)
            .map_err(|e| DataError::ParquetError(format!("date cast: {e}")))?];
        let names = ColumnNames::for_table(&self.instruments);
        let mut written = BTreeSet::new();
        for (names, col) in names.into_iter().zip(&self.columns) {
            // A repeated symbol shares the close column of its first group.
            if written.insert(names.close.clone()) {
                columns.push(Column::new(names.close.into(), col.close.clone()));
            }
            columns.push(Column::new(names.ma.into(), col.ma.clone()));
            columns.push(Column::new(names.regime.into(), col.regime_ok.clone()));
        }
        DataFrame::new(columns).map_err(|e| DataError::ParquetError(format!("dataframe creation: {e}")))
    }

    pub fn from_dataframe(
        df: &DataFrame,
        instruments: Vec<TrackedInstrument>,
    ) -> Result<Self, DataError> {
        let map_err = |e: PolarsError| DataError::ParquetError(format!("column read: {e}"));
        let n = df.height();
        let epoch = epoch();

        let date_ca = df
            .column("date")
            .map_err(map_err)?
            .date()
            .map_err(|e| DataError::ParquetError(format!("date column type: {e}")))?;
        let mut dates = Vec::with_capacity(n);
        for i in 0..n {
            let days = date_ca
                .get(i)
                .ok_or_else(|| DataError::ParquetError(format!("null date at row {i}")))?;
            dates.push(epoch + chrono::Duration::days(i64::from(days)));
        }
        if dates.windows(2).any(|w| w[0] >= w[1]) {
            return Err(DataError::ParquetError("dates are not strictly ascending".into()));
        }

        let mut columns = Vec::with_capacity(instruments.len());
        for names in ColumnNames::for_table(&instruments) {
            let close_ca = df
                .column(&names.close)
                .map_err(map_err)?
                .f64()
                .map_err(map_err)?;
            let ma_ca = df.column(&names.ma).map_err(map_err)?.f64().map_err(map_err)?;
            let regime_ca = df
                .column(&names.regime)
                .map_err(map_err)?
                .bool()
                .map_err(map_err)?;
            columns.push(InstrumentColumns {
                close: (0..n).map(|i| close_ca.get(i)).collect(),
                ma: (0..n).map(|i| ma_ca.get(i)).collect(),
                regime_ok: (0..n).map(|i| regime_ca.get(i).unwrap_or(false)).collect(),
            });
        }

        Ok(Self {
            dates,
            instruments,
            columns,
        })
    }
}

struct ColumnNames {
    close: String,
    ma: String,
    regime: String,
}

impl ColumnNames {
    /// Names per instrument, in table order. A symbol's later groups keep
    /// its close column and qualify the regime column with their window.
    fn for_table(instruments: &[TrackedInstrument]) -> Vec<Self> {
        let mut seen = BTreeSet::new();
        instruments
            .iter()
            .map(|inst| {
                let prefix = inst.prefix();
                let ma = format!("{prefix}_{}ma", inst.window);
                let regime = if seen.insert(inst.symbol.as_str()) {
                    format!("{prefix}_regime_ok")
                } else {
                    format!("{ma}_regime_ok")
                };
                Self {
                    close: format!("{prefix}_close"),
                    ma,
                    regime,
                }
            })
            .collect()
    }
}

fn epoch() -> NaiveDate {
    NaiveDate::from_ymd_opt(1970, 1, 1).unwrap_or_default()
}

/// Sidecar metadata for the Parquet table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableMeta {
    pub covered_start: NaiveDate,
    pub covered_end: NaiveDate,
    pub instruments: Vec<TrackedInstrument>,
    pub built_at: NaiveDateTime,
    pub row_count: usize,
}

impl TableMeta {
    fn same_instruments(&self, instruments: &[TrackedInstrument]) -> bool {
        let a: BTreeSet<_> = self.instruments.iter().collect();
        let b: BTreeSet<_> = instruments.iter().collect();
        a == b && self.instruments.len() == instruments.len()
    }
}

pub struct ConsolidatedRegimeCache {
    sync: Arc<SyncOrchestrator>,
    dir: PathBuf,
    instruments: Vec<TrackedInstrument>,
    benchmark: String,
    sectors: SectorMap,
    sector_window: usize,
    warmup_months: u32,
    interval: Interval,
    sync_options: SyncOptions,
    current: Mutex<Option<(RegimeTable, TableMeta)>>,
    memo: Arc<SnapshotMemo>,
}

impl ConsolidatedRegimeCache {
    /// `benchmark` must be one of `instruments`; it is added with the default
    /// 200-day window when missing. Windows below one bar are raised to one.
    pub fn new(
        sync: Arc<SyncOrchestrator>,
        dir: impl Into<PathBuf>,
        mut instruments: Vec<TrackedInstrument>,
        benchmark: &str,
    ) -> Self {
        for inst in &mut instruments {
            inst.window = inst.window.max(1);
        }
        if !instruments.iter().any(|i| i.symbol == benchmark) {
            instruments.insert(
                0,
                TrackedInstrument::new(benchmark, 200, super::RegimeDirection::Above),
            );
        }
        Self {
            sync,
            dir: dir.into(),
            instruments,
            benchmark: benchmark.to_string(),
            sectors: SectorMap::empty(benchmark),
            sector_window: 50,
            warmup_months: 12,
            interval: Interval::Day1,
            sync_options: SyncOptions::default(),
            current: Mutex::new(None),
            memo: Arc::new(InMemoryMemo::new()),
        }
    }

    pub fn from_config(sync: Arc<SyncOrchestrator>, config: &RegimeConfig) -> Result<Self, ConfigError> {
        let sectors = config.load_sector_map()?;
        Ok(Self::new(
            sync,
            &config.cache_dir,
            config.tracked_instruments(),
            &config.benchmark.symbol,
        )
        .with_sectors(sectors)
        .with_sector_window(config.sectors.window)
        .with_warmup_months(config.warmup_months))
    }

    pub fn with_sectors(mut self, sectors: SectorMap) -> Self {
        self.sectors = sectors;
        self
    }

    /// Window of the sector flag for symbols whose sector is the benchmark.
    pub fn with_sector_window(mut self, window: usize) -> Self {
        self.sector_window = window.max(1);
        self
    }

    pub fn with_warmup_months(mut self, months: u32) -> Self {
        self.warmup_months = months;
        self
    }

    pub fn with_sync_options(mut self, options: SyncOptions) -> Self {
        self.sync_options = options;
        self
    }

    pub fn with_memo(mut self, memo: Arc<SnapshotMemo>) -> Self {
        self.memo = memo;
        self
    }

    pub fn instruments(&self) -> &[TrackedInstrument] {
        &self.instruments
    }

    /// Column groups of the stored table: the tracked instruments plus the
    /// benchmark at the sector window, unless already tracked that way.
    pub fn table_instruments(&self) -> Vec<TrackedInstrument> {
        let mut out = self.instruments.clone();
        let benchmark_sector = TrackedInstrument::new(
            &self.benchmark,
            self.sector_window,
            super::RegimeDirection::Above,
        );
        if !out.contains(&benchmark_sector) {
            out.push(benchmark_sector);
        }
        out
    }

    pub fn table_path(&self) -> PathBuf {
        self.dir.join(TABLE_FILE)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    /// Sidecar of the stored table, if any.
    pub fn meta(&self) -> Option<TableMeta> {
        self.load_stored().map(|(_, meta)| meta)
    }

    /// Table rows for `[start, end]`, building or extending the stored table
    /// only as far as needed.
    pub fn get(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        force_rebuild: bool,
    ) -> Result<RegimeTable, DataError> {
        Ok(self.ensure(start, end, force_rebuild)?.slice(start, end))
    }

    /// Per-instrument regime as of `date`, from the stored table.
    ///
    /// Memoized by date until the table is next rebuilt or extended. `None`
    /// when there is no table or `date` precedes its first row.
    pub fn snapshot_as_of(&self, date: NaiveDate) -> Option<RegimeSnapshot> {
        if let Some(snapshot) = self.memo.get(&date) {
            return Some(snapshot);
        }
        let (table, _) = self.load_stored()?;
        let snapshot = table.snapshot_at(date)?;
        self.memo.put(date, snapshot.clone());
        Some(snapshot)
    }

    /// Regime flags for `symbol` over `timeline`, served from the table.
    ///
    /// The sector flag reads the column of the symbol's sector instrument;
    /// an unmapped symbol reads the benchmark at the sector window.
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

        let table = match self.ensure(earliest, latest, false) {
            Ok(table) => table,
            Err(e) if e.is_transient() => {
                warn!(symbol, error = %e, "regime table unavailable, flags default to false");
                return Ok(RegimeFlags::all_false(timeline.len()));
            }
            Err(e) => return Err(e),
        };

        let market_ok = self.aligned_column(&table, &self.benchmark, None, timeline);
        let sector = self.sectors.sector_for(symbol);
        let sector_window = (sector == self.benchmark).then_some(self.sector_window);
        let sector_ok = self.aligned_column(&table, sector, sector_window, timeline);
        Ok(RegimeFlags::new(market_ok, sector_ok))
    }

    fn aligned_column(
        &self,
        table: &RegimeTable,
        instrument: &str,
        window: Option<usize>,
        timeline: &[NaiveDate],
    ) -> Vec<bool> {
        match table.regime_points(instrument, window) {
            Some(points) => point_in_time_join(&points, timeline, &FillPolicy::conservative()),
            None => {
                warn!(instrument, "instrument not tracked by the regime table, flag defaults to false");
                vec![false; timeline.len()]
            }
        }
    }

    /// The full stored table, guaranteed to cover `[start, end]`.
    fn ensure(
        &self,
        start: NaiveDate,
        end: NaiveDate,
        force_rebuild: bool,
    ) -> Result<RegimeTable, DataError> {
        if start > end {
            return Err(DataError::InvalidRange { start, end });
        }
        match self.load_stored() {
            None => match self.previous_coverage() {
                // Coverage survives a discarded table, e.g. a changed instrument set.
                Some((covered_start, covered_end)) => {
                    let union_start = start.min(covered_start);
                    let union_end = end.max(covered_end);
                    info!(%union_start, %union_end, "rebuilding regime table over previous coverage");
                    self.build(union_start, union_end)
                }
                None => self.build(start, end),
            },
            Some((table, meta)) => {
                let union_start = start.min(meta.covered_start);
                let union_end = end.max(meta.covered_end);
                if force_rebuild || meta.covered_start > start {
                    info!(%union_start, %union_end, force_rebuild, "rebuilding regime table");
                    self.build(union_start, union_end)
                } else if meta.covered_end < end {
                    self.extend(table, meta, end)
                } else {
                    debug!(%start, %end, "regime table covers request");
                    Ok(table)
                }
            }
        }
    }

    fn build(&self, start: NaiveDate, end: NaiveDate) -> Result<RegimeTable, DataError> {
        let instruments = self.table_instruments();
        let fetch_start = warmup_start(start, self.warmup_months);
        let mut fetches = Fetches::new();
        let computed: Vec<Option<InstrumentRegime>> = instruments
            .iter()
            .map(|inst| self.compute_instrument(&mut fetches, inst, fetch_start, end))
            .collect();
        if computed.iter().all(Option::is_none) {
            return Err(DataError::Other(format!(
                "no regime table input could be loaded for {start}..{end}"
            )));
        }

        let dates = union_dates(&computed, start, end);
        let columns = computed
            .iter()
            .map(|c| match c {
                Some(regime) => InstrumentColumns::aligned(regime, &dates),
                None => InstrumentColumns::degraded(dates.len()),
            })
            .collect();
        let table = RegimeTable {
            dates,
            instruments: instruments.clone(),
            columns,
        };
        let meta = TableMeta {
            covered_start: start,
            covered_end: self.settled_end(&table, start, end),
            instruments,
            built_at: Utc::now().naive_utc(),
            row_count: table.len(),
        };
        self.persist(&table, &meta)?;
        info!(%start, %end, rows = table.len(), instruments = meta.instruments.len(), "regime table built");
        self.install(table.clone(), meta);
        Ok(table)
    }

    /// Append rows dated after the table's last row up to `end`, fetching
    /// only the new bars and using stored closes to warm up the moving
    /// averages.
    fn extend(
        &self,
        mut table: RegimeTable,
        mut meta: TableMeta,
        end: NaiveDate,
    ) -> Result<RegimeTable, DataError> {
        let from = match table.last_date() {
            Some(last) => match last.succ_opt() {
                Some(next) => next,
                None => return Ok(table),
            },
            None => meta.covered_start,
        };
        if from > end {
            return Ok(table);
        }

        // Column order follows the stored table, which may differ from config order.
        let mut fetches = Fetches::new();
        let computed: Vec<Option<InstrumentRegime>> = table
            .instruments
            .iter()
            .zip(&table.columns)
            .map(|(inst, stored)| {
                self.extend_instrument(&mut fetches, inst, &table.dates, stored, &meta, from, end)
            })
            .collect();
        if computed.iter().all(Option::is_none) {
            warn!(%from, %end, "no regime table input could be loaded, coverage not extended");
            return Ok(table);
        }

        let dates = union_dates(&computed, from, end);
        let columns = computed
            .iter()
            .map(|c| match c {
                Some(regime) => InstrumentColumns::aligned(regime, &dates),
                None => InstrumentColumns::degraded(dates.len()),
            })
            .collect();
        let added = dates.len();
        table.append(dates, columns);

        meta.covered_end = self.settled_end(&table, meta.covered_start, end).max(meta.covered_end);
        meta.row_count = table.len();
        meta.built_at = Utc::now().naive_utc();
        self.persist(&table, &meta)?;
        info!(%from, %end, added, "regime table extended");
        self.install(table.clone(), meta);
        Ok(table)
    }

    /// End of coverage to record after materializing rows up to `end`.
    /// Dates from today on are left uncovered unless a row for them exists.
    fn settled_end(&self, table: &RegimeTable, start: NaiveDate, end: NaiveDate) -> NaiveDate {
        let settled = self.sync.today().pred_opt().unwrap_or(start);
        let last_row = table.last_date().unwrap_or(start);
        end.min(settled.max(last_row)).max(start)
    }

    /// Covered range recorded by a sidecar that no longer loads with its table.
    fn previous_coverage(&self) -> Option<(NaiveDate, NaiveDate)> {
        let meta = read_meta(&self.meta_path()).ok()?;
        Some((meta.covered_start, meta.covered_end))
    }

    fn fetch(&self, fetches: &mut Fetches, symbol: &str, start: NaiveDate, end: NaiveDate) -> Option<BarSeries> {
        let key = (symbol.to_string(), start, end);
        if let Some(series) = fetches.get(&key) {
            return series.clone();
        }
        let series = match self.sync.get_range(symbol, start, end, self.interval, self.sync_options) {
            Ok(series) => Some(series),
            Err(e) => {
                warn!(instrument = symbol, error = %e, "regime table input unavailable, columns degraded");
                None
            }
        };
        fetches.insert(key, series.clone());
        series
    }

    fn compute_instrument(
        &self,
        fetches: &mut Fetches,
        inst: &TrackedInstrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Option<InstrumentRegime> {
        match self.fetch(fetches, &inst.symbol, start, end) {
            Some(series) if !series.is_empty() => {
                if series.len() < inst.window {
                    warn!(
                        instrument = %inst.symbol,
                        bars = series.len(),
                        window = inst.window,
                        "insufficient history for moving average"
                    );
                }
                Some(InstrumentRegime::compute(&series, inst.window, inst.direction))
            }
            Some(_) => {
                warn!(instrument = %inst.symbol, "no bars for regime table, columns degraded");
                None
            }
            None => None,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn extend_instrument(
        &self,
        fetches: &mut Fetches,
        inst: &TrackedInstrument,
        stored_dates: &[NaiveDate],
        stored: &InstrumentColumns,
        meta: &TableMeta,
        from: NaiveDate,
        end: NaiveDate,
    ) -> Option<InstrumentRegime> {
        // Stored rows on the instrument's own calendar.
        let own: Vec<(NaiveDate, f64, bool)> = stored_dates
            .iter()
            .zip(&stored.close)
            .zip(&stored.regime_ok)
            .filter_map(|((d, c), ok)| c.map(|c| (*d, c, *ok)))
            .collect();

        if own.len() + 1 < inst.window {
            // Too few stored closes to warm the average; recompute from the
            // per-symbol cache, which already holds the warm-up history.
            let start = warmup_start(meta.covered_start, self.warmup_months);
            return self.compute_instrument(fetches, inst, start, end);
        }

        let fresh = self.fetch(fetches, &inst.symbol, from, end)?;

        let mut dates: Vec<NaiveDate> = own.iter().map(|(d, _, _)| *d).collect();
        let mut closes: Vec<f64> = own.iter().map(|(_, c, _)| *c).collect();
        for bar in fresh.bars().iter().filter(|b| b.date >= from) {
            dates.push(bar.date);
            closes.push(bar.close);
        }
        let mut regime = InstrumentRegime::from_closes(dates, closes, inst.window, inst.direction);
        // Stored rows keep their stored regime.
        for (slot, (_, _, ok)) in regime.regime_ok.iter_mut().zip(&own) {
            *slot = *ok;
        }
        Some(regime)
    }

    fn load_stored(&self) -> Option<(RegimeTable, TableMeta)> {
        if let Some(current) = self.lock_current().as_ref() {
            return Some(current.clone());
        }

        let table_path = self.table_path();
        let meta_path = self.meta_path();
        if !table_path.exists() || !meta_path.exists() {
            return None;
        }
        let loaded = read_meta(&meta_path).and_then(|meta| {
            if !meta.same_instruments(&self.table_instruments()) {
                return Err(DataError::CacheError("tracked instrument set changed".into()));
            }
            let table = read_table(&table_path, meta.instruments.clone())?;
            Ok((table, meta))
        });
        match loaded {
            Ok((table, meta)) => {
                *self.lock_current() = Some((table.clone(), meta.clone()));
                Some((table, meta))
            }
            Err(e) => {
                warn!(path = %table_path.display(), error = %e, "discarding stored regime table");
                None
            }
        }
    }

    fn persist(&self, table: &RegimeTable, meta: &TableMeta) -> Result<(), DataError> {
        let mut df = table.to_dataframe()?;
        let mut buf = Vec::new();
        ParquetWriter::new(&mut buf)
            .finish(&mut df)
            .map_err(|e| DataError::ParquetError(format!("write parquet: {e}")))?;
        atomic_write(&self.table_path(), &buf).map_err(|e| DataError::CacheError(e.to_string()))?;

        let json = serde_json::to_vec_pretty(meta)
            .map_err(|e| DataError::CacheError(format!("serialize table metadata: {e}")))?;
        atomic_write(&self.meta_path(), &json).map_err(|e| DataError::CacheError(e.to_string()))
    }

    fn install(&self, table: RegimeTable, meta: TableMeta) {
        *self.lock_current() = Some((table, meta));
        self.memo.clear();
    }

    fn lock_current(&self) -> MutexGuard<'_, Option<(RegimeTable, TableMeta)>> {
        self.current.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Sorted union of every instrument's dates within `[start, end]`.
fn union_dates(computed: &[Option<InstrumentRegime>], start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
    computed
        .iter()
        .flatten()
        .flat_map(|r| r.dates.iter().copied())
        .filter(|d| *d >= start && *d <= end)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn read_meta(path: &Path) -> Result<TableMeta, DataError> {
    let text = fs::read_to_string(path)
        .map_err(|e| DataError::CacheError(format!("read {}: {e}", path.display())))?;
    serde_json::from_str(&text)
        .map_err(|e| DataError::CacheError(format!("parse {}: {e}", path.display())))
}

fn read_table(path: &Path, instruments: Vec<TrackedInstrument>) -> Result<RegimeTable, DataError> {
    let file = fs::File::open(path).map_err(|e| DataError::ParquetError(format!("open: {e}")))?;
    let df = ParquetReader::new(file)
        .finish()
        .map_err(|e| DataError::ParquetError(format!("read: {e}")))?;
    RegimeTable::from_dataframe(&df, instruments)
}
