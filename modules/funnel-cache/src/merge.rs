//! Merge engine: folds one fetched gap into a [`ParameterStore`].
//!
//! Layout invariant: entries sharing a (slice kind, signature) pair have
//! pairwise-disjoint ranges. A merge carves the fetched range out of older
//! entries of the same pair (splitting them when the new range lands in the
//! middle), then inserts the new entry. Entries under other signatures or
//! the other slice kind are never touched.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use funnel_common::{
    DateRange, FetchedSeries, FunnelError, ParameterStore, QuerySignature, Result, SliceKind,
    TimeSeriesEntry,
};
use serde::Serialize;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Days with a row in the new entry.
    pub inserted_days: usize,
    /// Previously stored rows the new entry superseded.
    pub replaced_days: usize,
    /// Older entries that were trimmed or split.
    pub trimmed_entries: usize,
}

/// Validate and order a fetched payload for `range`.
///
/// Rows must be aligned and inside the fetched range. Duplicate dates keep
/// the row that came last in the payload.
pub fn normalize_series(range: &DateRange, series: FetchedSeries) -> Result<FetchedSeries> {
    let len = series.dates.len();
    if series.n_daily.len() != len || series.k_daily.len() != len {
        return Err(FunnelError::InvalidSeries(format!(
            "misaligned arrays for {range}: dates={len}, n={}, k={}",
            series.n_daily.len(),
            series.k_daily.len()
        )));
    }
    if let Some(outside) = series.dates.iter().find(|d| !range.contains(**d)) {
        return Err(FunnelError::InvalidSeries(format!(
            "row dated {outside} outside fetched range {range}"
        )));
    }

    let mut rows: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
    for ((date, n), k) in series
        .dates
        .iter()
        .zip(series.n_daily.iter())
        .zip(series.k_daily.iter())
    {
        rows.insert(*date, (*n, *k));
    }

    Ok(FetchedSeries {
        dates: rows.keys().copied().collect(),
        n_daily: rows.values().map(|(n, _)| *n).collect(),
        k_daily: rows.values().map(|(_, k)| *k).collect(),
        lag: series.lag,
    })
}

/// Merge one fetched gap into the store. Latest fetch wins for days already
/// stored under the same signature. Merging the same gap twice leaves the
/// store exactly as merging it once.
///
/// On error the store is left untouched.
pub fn merge_fetched(
    store: &mut ParameterStore,
    kind: SliceKind,
    range: DateRange,
    series: FetchedSeries,
    signature: &QuerySignature,
    retrieved_at: DateTime<Utc>,
) -> Result<MergeOutcome> {
    let series = normalize_series(&range, series)?;
    let incoming = TimeSeriesEntry::new(
        kind,
        range,
        series.dates,
        series.n_daily,
        series.k_daily,
        signature.clone(),
        retrieved_at,
        series.lag,
    );

    let mut outcome = MergeOutcome {
        inserted_days: incoming.dates.len(),
        replaced_days: 0,
        trimmed_entries: 0,
    };

    let mut next: Vec<TimeSeriesEntry> = Vec::with_capacity(store.entries.len() + 2);
    for entry in &store.entries {
        let same_pair = entry.slice_kind == kind && &entry.query_signature == signature;
        if !same_pair || !entry.range.overlaps(&range) {
            next.push(entry.clone());
            continue;
        }

        outcome.trimmed_entries += 1;
        outcome.replaced_days += entry.dates.iter().filter(|d| range.contains(**d)).count();

        if entry.range.from < range.from {
            if let Some(left_end) = range.from.pred_opt() {
                let left = DateRange {
                    from: entry.range.from,
                    to: left_end,
                };
                next.extend(entry.restricted_to(&left));
            }
        }
        if entry.range.to > range.to {
            if let Some(right_start) = range.to.succ_opt() {
                let right = DateRange {
                    from: right_start,
                    to: entry.range.to,
                };
                next.extend(entry.restricted_to(&right));
            }
        }
    }
    next.push(incoming);
    sort_entries(&mut next);

    verify_entries(&store.parameter_id, &next)?;
    store.entries = next;

    debug!(
        parameter = %store.parameter_id,
        kind = %kind,
        range = %range,
        signature = signature.short(),
        inserted = outcome.inserted_days,
        replaced = outcome.replaced_days,
        "Merged fetched gap"
    );
    Ok(outcome)
}

fn sort_entries(entries: &mut [TimeSeriesEntry]) {
    entries.sort_by(|a, b| {
        (a.slice_kind, a.range.from, a.range.to, &a.query_signature, a.retrieved_at).cmp(&(
            b.slice_kind,
            b.range.from,
            b.range.to,
            &b.query_signature,
            b.retrieved_at,
        ))
    });
}

/// Per-entry invariants plus disjointness within each (kind, signature).
fn verify_entries(parameter: &str, entries: &[TimeSeriesEntry]) -> Result<()> {
    let mut last_seen: BTreeMap<(SliceKind, &QuerySignature), DateRange> = BTreeMap::new();
    for entry in entries {
        entry.validate(parameter).map_err(|e| {
            error!(parameter, error = %e, "Merge produced an invalid entry");
            e
        })?;
        let key = (entry.slice_kind, &entry.query_signature);
        if let Some(previous) = last_seen.get(&key) {
            if previous.overlaps(&entry.range) {
                let err = FunnelError::invariant(
                    parameter,
                    format!(
                        "{} entries {} and {} overlap under signature {}",
                        entry.slice_kind,
                        previous,
                        entry.range,
                        entry.query_signature.short()
                    ),
                );
                error!(parameter, error = %err, "Merge produced overlapping entries");
                return Err(err);
            }
        }
        last_seen.insert(key, entry.range);
    }
    Ok(())
}

/// The combined daily view of every entry under one (kind, signature).
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CompositeSeries {
    pub dates: Vec<NaiveDate>,
    pub n_daily: Vec<u64>,
    pub k_daily: Vec<u64>,
    pub n: u64,
    pub k: u64,
}

/// Stitch all entries of `kind` under `signature` into one ascending series.
/// Totals are checked against the per-entry totals; any drift is an
/// invariant violation.
pub fn composite(
    store: &ParameterStore,
    kind: SliceKind,
    signature: &QuerySignature,
) -> Result<CompositeSeries> {
    let mut rows: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
    let mut expected_n = 0u64;
    let mut expected_k = 0u64;

    for entry in store
        .entries_of(kind)
        .filter(|e| &e.query_signature == signature)
    {
        entry.validate(&store.parameter_id)?;
        expected_n += entry.n_total;
        expected_k += entry.k_total;
        for (date, n, k) in entry.points() {
            if rows.insert(date, (n, k)).is_some() {
                return Err(FunnelError::invariant(
                    &store.parameter_id,
                    format!("{kind} date {date} stored twice under one signature"),
                ));
            }
        }
    }

    let series = CompositeSeries {
        dates: rows.keys().copied().collect(),
        n_daily: rows.values().map(|(n, _)| *n).collect(),
        k_daily: rows.values().map(|(_, k)| *k).collect(),
        n: rows.values().map(|(n, _)| *n).sum(),
        k: rows.values().map(|(_, k)| *k).sum(),
    };

    if series.n != expected_n || series.k != expected_k {
        return Err(FunnelError::invariant(
            &store.parameter_id,
            format!(
                "composite totals drifted: n={} vs {}, k={} vs {}",
                series.n, expected_n, series.k, expected_k
            ),
        ));
    }
    Ok(series)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use funnel_common::LagStats;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn range(from: u32, to: u32) -> DateRange {
        DateRange::new(d(from), d(to)).unwrap()
    }

    fn fetched(from: u32, to: u32, n: u64, k: u64) -> FetchedSeries {
        let dates: Vec<_> = range(from, to).days().collect();
        FetchedSeries {
            n_daily: vec![n; dates.len()],
            k_daily: vec![k; dates.len()],
            dates,
            lag: LagStats::default(),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap()
    }

    fn sig(s: &str) -> QuerySignature {
        QuerySignature::new(s)
    }

    /// Merge a uniform fetch of `from..=to` as its own gap.
    fn merge_uniform(
        store: &mut ParameterStore,
        kind: SliceKind,
        (from, to): (u32, u32),
        (n, k): (u64, u64),
        signature: &str,
    ) -> Result<MergeOutcome> {
        let series = fetched(from, to, n, k);
        merge_fetched(store, kind, range(from, to), series, &sig(signature), t0())
    }

    fn assert_store_invariants(store: &ParameterStore) {
        for e in &store.entries {
            assert_eq!(e.n_daily.iter().sum::<u64>(), e.n_total);
            assert_eq!(e.k_daily.iter().sum::<u64>(), e.k_total);
            assert!(e.dates.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[test]
    fn merging_same_gap_twice_is_idempotent() {
        let mut once = ParameterStore::new("p");
        merge_uniform(&mut once, SliceKind::Window, (1, 5), (10, 2), "A").unwrap();

        let mut twice = once.clone();
        let outcome = merge_uniform(&mut twice, SliceKind::Window, (1, 5), (10, 2), "A").unwrap();

        assert_eq!(once, twice);
        assert_eq!(outcome.replaced_days, 5);
        assert_eq!(twice.entries.len(), 1);
        assert_eq!(twice.entries[0].n_total, 50);
    }

    #[test]
    fn latest_fetch_wins_for_overlapping_days() {
        let mut store = ParameterStore::new("p");
        merge_uniform(&mut store, SliceKind::Window, (1, 10), (10, 1), "A").unwrap();
        merge_uniform(&mut store, SliceKind::Window, (4, 6), (20, 5), "A").unwrap();

        let series = composite(&store, SliceKind::Window, &sig("A")).unwrap();
        assert_eq!(series.dates, range(1, 10).days().collect::<Vec<_>>());
        assert_eq!(series.n, 7 * 10 + 3 * 20);
        assert_eq!(series.k, 7 + 3 * 5);
        // Split into left remainder, new middle, right remainder.
        assert_eq!(store.entries.len(), 3);
        assert_eq!(store.entries[0].range, range(1, 3));
        assert_eq!(store.entries[1].range, range(4, 6));
        assert_eq!(store.entries[2].range, range(7, 10));
        assert_store_invariants(&store);
    }

    #[test]
    fn other_signatures_are_left_alone() {
        let mut store = ParameterStore::new("p");
        merge_uniform(&mut store, SliceKind::Window, (1, 10), (10, 1), "old").unwrap();
        merge_uniform(&mut store, SliceKind::Window, (1, 10), (30, 3), "new").unwrap();

        assert_eq!(store.entries.len(), 2);
        assert_eq!(composite(&store, SliceKind::Window, &sig("old")).unwrap().n, 100);
        assert_eq!(composite(&store, SliceKind::Window, &sig("new")).unwrap().n, 300);
    }

    #[test]
    fn window_and_cohort_never_merge() {
        let mut store = ParameterStore::new("p");
        merge_uniform(&mut store, SliceKind::Window, (1, 5), (10, 1), "A").unwrap();
        merge_uniform(&mut store, SliceKind::Cohort, (1, 5), (40, 4), "A").unwrap();

        assert_eq!(store.entries.len(), 2);
        assert_eq!(composite(&store, SliceKind::Window, &sig("A")).unwrap().n, 50);
        assert_eq!(composite(&store, SliceKind::Cohort, &sig("A")).unwrap().n, 200);
    }

    #[test]
    fn out_of_order_payload_is_sorted_and_deduplicated() {
        let mut store = ParameterStore::new("p");
        let series = FetchedSeries {
            dates: vec![d(3), d(1), d(2), d(3)],
            n_daily: vec![1, 2, 3, 9],
            k_daily: vec![0, 1, 1, 4],
            lag: LagStats::default(),
        };
        merge_fetched(&mut store, SliceKind::Window, range(1, 3), series, &sig("A"), t0()).unwrap();
        let e = &store.entries[0];
        assert_eq!(e.dates, vec![d(1), d(2), d(3)]);
        assert_eq!(e.n_daily, vec![2, 3, 9]);
        assert_eq!(e.n_total, 14);
        assert_eq!(e.k_total, 6);
    }

    #[test]
    fn misaligned_payload_leaves_store_untouched() {
        let mut store = ParameterStore::new("p");
        merge_uniform(&mut store, SliceKind::Window, (1, 5), (10, 1), "A").unwrap();
        let before = store.clone();

        let bad = FetchedSeries {
            dates: vec![d(2), d(3)],
            n_daily: vec![1],
            k_daily: vec![0, 0],
            lag: LagStats::default(),
        };
        let err = merge_fetched(&mut store, SliceKind::Window, range(2, 3), bad, &sig("A"), t0())
            .unwrap_err();
        assert!(matches!(err, FunnelError::InvalidSeries(_)));
        assert_eq!(store, before);
    }

    #[test]
    fn rows_outside_the_gap_are_rejected() {
        let mut store = ParameterStore::new("p");
        let overhanging = fetched(1, 3, 1, 0);
        let err = merge_fetched(
            &mut store,
            SliceKind::Window,
            range(1, 2),
            overhanging,
            &sig("A"),
            t0(),
        )
        .unwrap_err();
        assert!(matches!(err, FunnelError::InvalidSeries(_)));
        assert!(store.entries.is_empty());
    }

    #[test]
    fn sum_invariant_holds_across_a_merge_sequence() {
        let mut store = ParameterStore::new("p");
        let plan = [
            (1, 10, 5, 1),
            (5, 12, 7, 2),
            (3, 4, 9, 9),
            (11, 20, 1, 0),
            (1, 20, 2, 1),
            (8, 8, 100, 50),
        ];
        for (from, to, n, k) in plan {
            merge_uniform(&mut store, SliceKind::Window, (from, to), (n, k), "A").unwrap();
            assert_store_invariants(&store);
            composite(&store, SliceKind::Window, &sig("A")).unwrap();
        }
        let series = composite(&store, SliceKind::Window, &sig("A")).unwrap();
        assert_eq!(series.n, 19 * 2 + 100);
    }

    #[test]
    fn duplicated_dates_in_store_are_reported_not_repaired() {
        let mut store = ParameterStore::new("p");
        merge_uniform(&mut store, SliceKind::Window, (1, 5), (10, 1), "A").unwrap();
        // Simulate a buggy writer that bypassed the merge engine.
        let dup = store.entries[0].clone();
        store.entries.push(dup);
        let err = composite(&store, SliceKind::Window, &sig("A")).unwrap_err();
        assert!(err.is_invariant_violation());
    }
}
