//! Property tests for cache and alignment invariants.
//!
//! 1. Appending the same bars twice changes nothing the second time
//! 2. The cached record count never decreases under appends
//! 3. Saved series load back unchanged and pass checksum validation
//! 4. Point-in-time values for a date ignore every later source entry
//! 5. Moving averages are trailing

use chrono::{Days, NaiveDate};
use proptest::prelude::*;
use regimelab_core::align::{point_in_time_join, FillPolicy};
use regimelab_core::data::{BarCache, SchemaRegistry};
use regimelab_core::domain::{Bar, BarSeries, Interval};
use regimelab_core::indicators::Sma;

fn base() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

// ── Strategies ───────────────────────────────────────────────────────

fn arb_bar() -> impl Strategy<Value = Bar> {
    (0u64..400, 1.0..500.0_f64, 0.0..5.0_f64, 0u64..10_000_000).prop_map(
        |(offset, close, spread, volume)| Bar {
            date: base() + Days::new(offset),
            open: close,
            high: close + spread,
            low: (close - spread).max(0.01),
            close,
            volume,
        },
    )
}

fn arb_series() -> impl Strategy<Value = BarSeries> {
    prop::collection::vec(arb_bar(), 1..60).prop_map(BarSeries::from_bars)
}

fn arb_flags() -> impl Strategy<Value = Vec<(NaiveDate, bool)>> {
    prop::collection::btree_map(0u64..120, any::<bool>(), 0..40).prop_map(|m| {
        m.into_iter()
            .map(|(offset, ok)| (base() + Days::new(offset), ok))
            .collect()
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    // ── 1. Idempotent append ─────────────────────────────────────────

    #[test]
    fn append_is_idempotent(existing in arb_series(), new in arb_series()) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarCache::new(dir.path());
        cache.save("T", Interval::Day1, &existing).unwrap();

        let first = cache.append("T", Interval::Day1, &new).unwrap();
        let after_first = cache.load("T", Interval::Day1).unwrap();
        let second = cache.append("T", Interval::Day1, &new).unwrap();
        let after_second = cache.load("T", Interval::Day1).unwrap();

        prop_assert_eq!(first, second);
        prop_assert_eq!(after_first, after_second);
    }

    // ── 2. Monotonic record count ────────────────────────────────────

    #[test]
    fn record_count_never_decreases(batches in prop::collection::vec(arb_series(), 1..5)) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarCache::new(dir.path());

        let mut previous = 0;
        for batch in &batches {
            let count = cache.append("T", Interval::Day1, batch).unwrap();
            prop_assert!(count >= previous);
            prop_assert!(count >= batch.len());
            previous = count;
        }
        let meta = cache.metadata("T", Interval::Day1).unwrap();
        prop_assert_eq!(meta.record_count, previous);
    }

    // ── 3. Save/load fidelity ────────────────────────────────────────

    #[test]
    fn saved_series_loads_unchanged(series in arb_series()) {
        let dir = tempfile::tempdir().unwrap();
        let cache = BarCache::new(dir.path());
        cache.save("T", Interval::Day1, &series).unwrap();

        let (loaded, meta) = cache.load_with_metadata("T", Interval::Day1).unwrap();
        prop_assert_eq!(&loaded, &series);
        prop_assert!(SchemaRegistry::is_valid(&loaded, &meta));
        prop_assert_eq!(meta.checksum, SchemaRegistry::checksum(&series));
    }

    // ── 4. Point-in-time join ────────────────────────────────────────

    #[test]
    fn join_ignores_later_entries(source in arb_flags(), cutoff in 0u64..120) {
        let cutoff = base() + Days::new(cutoff);
        let timeline: Vec<NaiveDate> = (0..120).map(|i| base() + Days::new(i)).collect();
        let known: Vec<(NaiveDate, bool)> =
            source.iter().copied().filter(|(d, _)| *d <= cutoff).collect();

        let policy = FillPolicy::conservative();
        let full = point_in_time_join(&source, &timeline, &policy);
        let truncated = point_in_time_join(&known, &timeline, &policy);

        for (i, day) in timeline.iter().enumerate() {
            if *day <= cutoff {
                prop_assert_eq!(full[i], truncated[i], "differs on {}", day);
            }
        }
    }

    // ── 5. Trailing moving average ───────────────────────────────────

    #[test]
    fn sma_only_sees_the_past(
        closes in prop::collection::vec(1.0..500.0_f64, 1..80),
        period in 1usize..20,
        cut in 0usize..80,
    ) {
        let cut = cut.min(closes.len());
        let sma = Sma::new(period);
        let full = sma.values(&closes);
        let prefix = sma.values(&closes[..cut]);
        for i in 0..cut {
            match (full[i], prefix[i]) {
                (Some(a), Some(b)) => prop_assert!((a - b).abs() < 1e-9),
                (None, None) => {}
                (a, b) => prop_assert!(false, "presence differs at {}: {:?} vs {:?}", i, a, b),
            }
        }
    }
}
