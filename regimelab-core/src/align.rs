//! Point-in-time alignment of a dated series onto an analysis timeline.
//!
//! Each timeline date only ever sees source values dated on or before it.
//! Gaps are either carried forward from the last known value or left at a
//! default, and unknown values resolve to the default (for regime flags:
//! `false`), never to something optimistic.

use chrono::NaiveDate;

/// How a value propagates to timeline dates with no source entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Propagation {
    /// Carry the most recent value dated on or before the timeline date.
    Forward,
    /// Only use a value dated exactly on the timeline date.
    Exact,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FillPolicy<T> {
    pub propagation: Propagation,
    /// Used before the first source value, and for misses under `Exact`.
    pub default: T,
}

impl FillPolicy<bool> {
    /// Forward-fill, unknown is `false`.
    pub fn conservative() -> Self {
        Self {
            propagation: Propagation::Forward,
            default: false,
        }
    }
}

impl<T> FillPolicy<T> {
    pub fn exact(default: T) -> Self {
        Self {
            propagation: Propagation::Exact,
            default,
        }
    }
}

/// Align `source` (ascending by date) onto `timeline`.
///
/// The timeline may be unsorted and may repeat dates; the output has one
/// value per timeline entry, in timeline order.
pub fn point_in_time_join<T: Clone>(
    source: &[(NaiveDate, T)],
    timeline: &[NaiveDate],
    policy: &FillPolicy<T>,
) -> Vec<T> {
    let (unique, positions) = dedup_timeline(timeline);
    let aligned = join_sorted(source, &unique, policy);
    positions.iter().map(|&i| aligned[i].clone()).collect()
}

/// Sorted distinct dates of `timeline`, plus for each original entry the
/// index of its date in the distinct list.
pub fn dedup_timeline(timeline: &[NaiveDate]) -> (Vec<NaiveDate>, Vec<usize>) {
    let mut unique = timeline.to_vec();
    unique.sort_unstable();
    unique.dedup();
    let positions = timeline
        .iter()
        .map(|d| unique.partition_point(|u| u < d))
        .collect();
    (unique, positions)
}

/// Merge-join against a sorted, distinct timeline.
fn join_sorted<T: Clone>(
    source: &[(NaiveDate, T)],
    timeline: &[NaiveDate],
    policy: &FillPolicy<T>,
) -> Vec<T> {
    debug_assert!(source.windows(2).all(|w| w[0].0 < w[1].0));
    let mut out = Vec::with_capacity(timeline.len());
    let mut cursor = 0;
    let mut last: Option<&(NaiveDate, T)> = None;

    for &date in timeline {
        while cursor < source.len() && source[cursor].0 <= date {
            last = Some(&source[cursor]);
            cursor += 1;
        }
        let value = match (policy.propagation, last) {
            (Propagation::Forward, Some((_, v))) => v.clone(),
            (Propagation::Exact, Some((d, v))) if *d == date => v.clone(),
            _ => policy.default.clone(),
        };
        out.push(value);
    }
    out
}
