//! The consolidated regime table: build once, extend by suffix, rebuild only
//! when coverage must grow backwards or the instrument set changes.

mod common;

use chrono::NaiveDate;
use common::{bar, d, weekday_series, weekdays, Call, Harness};
use regimelab_core::data::{DataError, FetchSpan, SectorMap};
use regimelab_core::domain::{BarSeries, Interval};
use regimelab_core::memo::{InMemoryMemo, MemoCache};
use regimelab_core::regime::table::{TABLE_FILE, META_FILE};
use regimelab_core::regime::{
    ConsolidatedRegimeCache, RegimeDirection, RegimeEngine, RegimeSettings, RegimeSnapshot,
    TrackedInstrument,
};
use std::sync::Arc;

const TODAY: &str = "2025-01-31";

fn instruments() -> Vec<TrackedInstrument> {
    vec![
        TrackedInstrument::new("SPY", 5, RegimeDirection::Above),
        TrackedInstrument::new("XLK", 3, RegimeDirection::Above),
        TrackedInstrument::new("^VIX", 3, RegimeDirection::Below),
    ]
}

fn sectors() -> SectorMap {
    let mut map = SectorMap::empty("SPY");
    map.insert("AAPL", "XLK", "Technology");
    map
}

fn harness() -> Harness {
    let h = Harness::new(d(TODAY));
    h.provider
        .set_series("SPY", weekday_series(d("2024-06-03"), d(TODAY), |i| 100.0 + i as f64));
    h.provider
        .set_series("XLK", weekday_series(d("2024-06-03"), d(TODAY), |i| 80.0 + (i % 7) as f64));
    h.provider
        .set_series("^VIX", weekday_series(d("2024-06-03"), d(TODAY), |i| 400.0 - i as f64));
    h
}

fn table_for(h: &Harness, instruments: Vec<TrackedInstrument>) -> ConsolidatedRegimeCache {
    ConsolidatedRegimeCache::new(h.sync.clone(), h.dir.path(), instruments, "SPY")
        .with_sectors(sectors())
        .with_sector_window(3)
        .with_warmup_months(1)
}

fn engine_for(h: &Harness, benchmark_window: usize) -> RegimeEngine {
    RegimeEngine::new(
        h.sync.clone(),
        sectors(),
        RegimeSettings {
            benchmark: "SPY".into(),
            benchmark_window,
            sector_window: 3,
            warmup_months: 1,
            ..RegimeSettings::default()
        },
    )
}

fn calendar_days(start: &str, end: &str) -> Vec<NaiveDate> {
    d(start).iter_days().take_while(|x| *x <= d(end)).collect()
}

#[test]
fn covered_reads_never_call_the_provider() {
    let h = harness();
    let cache = table_for(&h, instruments());

    let table = cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    assert_eq!(table.dates(), weekdays(d("2024-12-02"), d("2024-12-31")).as_slice());
    assert_eq!(h.provider.call_count(), 3);
    assert!(h.dir.path().join(TABLE_FILE).exists());
    assert!(h.dir.path().join(META_FILE).exists());

    h.provider.reset_calls();
    let inner = cache.get(d("2024-12-09"), d("2024-12-20"), false).unwrap();
    assert_eq!(inner.first_date(), Some(d("2024-12-09")));
    assert_eq!(inner.last_date(), Some(d("2024-12-20")));
    assert_eq!(h.provider.call_count(), 0);

    // A second instance reads the persisted table from disk.
    let reopened = table_for(&h, instruments());
    let from_disk = reopened.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(from_disk, table);
}

#[test]
fn later_end_fetches_only_the_suffix() {
    let h = harness();
    let cache = table_for(&h, instruments());
    cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    h.provider.reset_calls();

    let extended = cache.get(d("2024-12-02"), d("2025-01-15"), false).unwrap();

    for inst in instruments() {
        assert_eq!(
            h.provider.calls_for(&inst.symbol),
            vec![Call {
                span: FetchSpan::Range {
                    start: d("2025-01-01"),
                    end: d("2025-01-15")
                },
                interval: Interval::Day1
            }],
            "{}",
            inst.symbol
        );
    }
    let meta = cache.meta().unwrap();
    assert_eq!(meta.covered_start, d("2024-12-02"));
    assert_eq!(meta.covered_end, d("2025-01-15"));
    assert_eq!(meta.row_count, extended.len());

    // Same answer as building the whole range in one go.
    let fresh_h = harness();
    let fresh = table_for(&fresh_h, instruments())
        .get(d("2024-12-02"), d("2025-01-15"), false)
        .unwrap();
    assert_eq!(extended.dates(), fresh.dates());
    for inst in instruments() {
        let a = extended.column(&inst.symbol).unwrap();
        let b = fresh.column(&inst.symbol).unwrap();
        assert_eq!(a.regime_ok, b.regime_ok, "{}", inst.symbol);
        assert_eq!(a.close, b.close, "{}", inst.symbol);
        for (x, y) in a.ma.iter().zip(&b.ma) {
            match (x, y) {
                (Some(x), Some(y)) => assert!((x - y).abs() < 1e-9, "{}: {x} vs {y}", inst.symbol),
                (None, None) => {}
                _ => panic!("{}: ma presence differs", inst.symbol),
            }
        }
    }
}

#[test]
fn suffix_resumes_after_the_last_stored_row() {
    // Built on a Friday before that day's bar is published.
    let h = Harness::new(d("2025-01-31"));
    let spy = |end: &str| weekday_series(d("2024-06-03"), d(end), |i| 100.0 + i as f64);
    let xlk = |end: &str| weekday_series(d("2024-06-03"), d(end), |i| 80.0 + (i % 7) as f64);
    h.provider.set_series("SPY", spy("2025-01-30"));
    h.provider.set_series("XLK", xlk("2025-01-30"));
    let cache = table_for(&h, instruments()[..2].to_vec());

    let first = cache.get(d("2025-01-02"), d("2025-01-31"), false).unwrap();
    assert_eq!(first.last_date(), Some(d("2025-01-30")));
    assert_eq!(cache.meta().unwrap().covered_end, d("2025-01-30"));

    // Monday: Friday's and Monday's bars are both out.
    h.clock.set(d("2025-02-03"));
    h.provider.set_series("SPY", spy("2025-02-03"));
    h.provider.set_series("XLK", xlk("2025-02-03"));
    h.provider.reset_calls();

    let extended = cache.get(d("2025-01-02"), d("2025-02-03"), false).unwrap();
    assert_eq!(
        &extended.dates()[extended.len() - 3..],
        &[d("2025-01-30"), d("2025-01-31"), d("2025-02-03")]
    );
    assert_eq!(
        h.provider.calls_for("SPY"),
        vec![Call {
            span: FetchSpan::Range {
                start: d("2025-01-31"),
                end: d("2025-02-03")
            },
            interval: Interval::Day1
        }]
    );
    assert_eq!(cache.meta().unwrap().covered_end, d("2025-02-03"));

    let rebuilt = cache.get(d("2025-01-02"), d("2025-02-03"), true).unwrap();
    assert_eq!(extended.dates(), rebuilt.dates());
    for inst in cache.table_instruments() {
        let a = extended.column_for(&inst).unwrap();
        let b = rebuilt.column_for(&inst).unwrap();
        assert_eq!(a.close, b.close, "{inst:?}");
        assert_eq!(a.regime_ok, b.regime_ok, "{inst:?}");
    }
}

#[test]
fn earlier_start_rebuilds_over_the_union() {
    let h = harness();
    let cache = table_for(&h, instruments());
    cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();

    let november = cache.get(d("2024-11-01"), d("2024-11-29"), false).unwrap();
    assert_eq!(november.first_date(), Some(d("2024-11-01")));
    assert_eq!(november.last_date(), Some(d("2024-11-29")));

    let meta = cache.meta().unwrap();
    assert_eq!(meta.covered_start, d("2024-11-01"));
    assert_eq!(meta.covered_end, d("2024-12-31"));

    // Coverage never shrinks: December is still served without calls.
    h.provider.reset_calls();
    cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    assert_eq!(h.provider.call_count(), 0);
}

#[test]
fn snapshot_memo_is_cleared_when_the_table_grows() {
    let h = harness();
    let memo: Arc<InMemoryMemo<NaiveDate, RegimeSnapshot>> = Arc::new(InMemoryMemo::new());
    let cache = table_for(&h, instruments()).with_memo(memo.clone());
    cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();

    let snap = cache.snapshot_as_of(d("2024-12-28")).unwrap();
    assert_eq!(snap.as_of, d("2024-12-28"));
    assert!(snap.is_ok("SPY"));
    assert!(snap.is_ok("^VIX"));
    assert_eq!(memo.len(), 1);
    assert_eq!(cache.snapshot_as_of(d("2024-12-28")), Some(snap));
    assert_eq!(memo.len(), 1);

    cache.get(d("2024-12-02"), d("2025-01-10"), false).unwrap();
    assert!(memo.is_empty());
    assert!(cache.snapshot_as_of(d("2024-11-29")).is_none());
}

#[test]
fn failed_instrument_stays_false_until_forced_rebuild() {
    let h = Harness::new(d(TODAY));
    h.provider
        .set_series("SPY", weekday_series(d("2024-06-03"), d(TODAY), |i| 100.0 + i as f64));
    h.provider
        .set_series("XLK", weekday_series(d("2024-06-03"), d(TODAY), |i| 100.0 + i as f64));
    h.provider.set_failing("XLK", true);
    let cache = table_for(&h, instruments()[..2].to_vec());

    let table = cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    let xlk = table.column("XLK").unwrap();
    assert!(xlk.regime_ok.iter().all(|ok| !ok));
    assert!(xlk.close.iter().all(Option::is_none));

    h.provider.set_failing("XLK", false);
    let again = cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    assert!(again.column("XLK").unwrap().regime_ok.iter().all(|ok| !ok));

    let rebuilt = cache.get(d("2024-12-02"), d("2024-12-31"), true).unwrap();
    assert!(rebuilt.column("XLK").unwrap().regime_ok.iter().all(|ok| *ok));
}

#[test]
fn all_inputs_failing_is_an_error_and_flags_degrade() {
    let h = Harness::new(d(TODAY));
    h.provider.set_failing("SPY", true);
    h.provider.set_failing("XLK", true);
    let cache = table_for(&h, instruments()[..2].to_vec());

    let err = cache.get(d("2024-12-02"), d("2024-12-31"), false).unwrap_err();
    assert!(matches!(err, DataError::Other(_)));
    assert!(!h.dir.path().join(TABLE_FILE).exists());

    let timeline = weekdays(d("2024-12-02"), d("2024-12-06"));
    let flags = cache.historical_regime("AAPL", &timeline).unwrap();
    assert_eq!(flags.overall_ok, vec![false; 5]);
}

#[test]
fn changed_instrument_set_rebuilds_over_previous_coverage() {
    let h = harness();
    table_for(&h, instruments()[..2].to_vec())
        .get(d("2024-12-02"), d("2024-12-31"), false)
        .unwrap();
    assert!(h.provider.calls_for("^VIX").is_empty());

    let wider = table_for(&h, instruments());
    let table = wider.get(d("2024-12-09"), d("2024-12-20"), false).unwrap();
    assert_eq!(h.provider.calls_for("^VIX").len(), 1);
    assert!(table.column("^VIX").is_some());
    assert_eq!(table.first_date(), Some(d("2024-12-09")));

    // Tracked instruments plus the benchmark at the sector window.
    let meta = wider.meta().unwrap();
    assert_eq!(meta.instruments.len(), 4);
    assert_eq!(meta.covered_start, d("2024-12-02"));
    assert_eq!(meta.covered_end, d("2024-12-31"));

    h.provider.reset_calls();
    wider.get(d("2024-12-02"), d("2024-12-31"), false).unwrap();
    assert_eq!(h.provider.call_count(), 0);
}

#[test]
fn benchmark_is_always_tracked() {
    let h = harness();
    let cache = ConsolidatedRegimeCache::new(
        h.sync.clone(),
        h.dir.path(),
        vec![TrackedInstrument::new("XLK", 3, RegimeDirection::Above)],
        "SPY",
    );
    assert_eq!(cache.instruments()[0], TrackedInstrument::new("SPY", 200, RegimeDirection::Above));
    assert_eq!(cache.instruments().len(), 2);
    assert_eq!(
        cache.table_instruments()[2],
        TrackedInstrument::new("SPY", 50, RegimeDirection::Above)
    );
}

#[test]
fn zero_windows_are_raised_to_one() {
    let h = harness();
    let cache = ConsolidatedRegimeCache::new(
        h.sync.clone(),
        h.dir.path(),
        vec![
            TrackedInstrument::new("SPY", 0, RegimeDirection::Above),
            TrackedInstrument::new("XLK", 0, RegimeDirection::Above),
        ],
        "SPY",
    )
    .with_sector_window(0)
    .with_warmup_months(1);
    assert!(cache.instruments().iter().all(|i| i.window == 1));
    assert_eq!(cache.table_instruments().len(), 2);

    let table = cache.get(d("2024-12-02"), d("2024-12-06"), false).unwrap();
    assert_eq!(table.len(), 5);
    // A close is never strictly above its own one-bar average.
    assert!(table.column("SPY").unwrap().regime_ok.iter().all(|ok| !ok));
}

#[test]
fn inverted_range_is_rejected() {
    let h = harness();
    let err = table_for(&h, instruments())
        .get(d("2024-12-31"), d("2024-12-02"), false)
        .unwrap_err();
    assert!(matches!(err, DataError::InvalidRange { .. }));
    assert_eq!(h.provider.call_count(), 0);
}

#[test]
fn table_flags_match_the_engine() {
    let h = harness();
    let cache = table_for(&h, instruments());
    let engine = engine_for(&h, 5);
    let timeline = calendar_days("2024-12-02", "2024-12-31");

    let from_table = cache.historical_regime("AAPL", &timeline).unwrap();
    let from_engine = engine.historical_regime("AAPL", &timeline).unwrap();
    assert_eq!(from_table, from_engine);
    assert!(from_table.market_ok.iter().all(|ok| *ok));
    assert!(from_table.sector_ok.iter().any(|ok| *ok));
    assert!(from_table.sector_ok.iter().any(|ok| !ok));

    let unmapped_table = cache.historical_regime("ZZZ", &timeline).unwrap();
    let unmapped_engine = engine.historical_regime("ZZZ", &timeline).unwrap();
    assert_eq!(unmapped_table, unmapped_engine);
}

#[test]
fn unmapped_symbols_use_the_benchmark_at_the_sector_window() {
    let h = Harness::new(d(TODAY));
    // Steady rise, then a shallow dip over the last week: the 20-bar trend
    // holds while the 3-bar one breaks.
    let dip_from = d("2025-01-27");
    let days = weekdays(d("2024-06-03"), d(TODAY));
    let before_dip = days.iter().filter(|x| **x < dip_from).count();
    let peak = 99.0 + before_dip as f64;
    let spy: BarSeries = days
        .iter()
        .enumerate()
        .map(|(i, &day)| {
            let close = if day < dip_from {
                100.0 + i as f64
            } else {
                peak - (i + 1 - before_dip) as f64
            };
            bar(day, close)
        })
        .collect();
    h.provider.set_series("SPY", spy);

    let cache = ConsolidatedRegimeCache::new(
        h.sync.clone(),
        h.dir.path(),
        vec![TrackedInstrument::new("SPY", 20, RegimeDirection::Above)],
        "SPY",
    )
    .with_sectors(sectors())
    .with_sector_window(3)
    .with_warmup_months(1);
    let timeline = calendar_days("2025-01-27", "2025-01-31");

    let from_table = cache.historical_regime("ZZZ", &timeline).unwrap();
    let from_engine = engine_for(&h, 20).historical_regime("ZZZ", &timeline).unwrap();
    assert_eq!(from_table, from_engine);
    assert_eq!(from_table.market_ok, vec![true; 5]);
    assert_eq!(from_table.sector_ok, vec![false; 5]);
    assert_eq!(from_table.overall_ok, vec![false; 5]);
}
