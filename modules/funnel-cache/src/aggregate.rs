//! Collapse stored entries overlapping a window or cohort range into one
//! summary, without ever pooling rows fetched under different query
//! definitions.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::NaiveDate;
use funnel_common::{
    DateRange, FunnelError, LagStats, ParameterStore, QuerySignature, Result, SliceKind,
    TimeSeriesEntry,
};
use serde::Serialize;
use tracing::warn;

/// Entries overlapping the range under a signature other than the preferred
/// one. Reported, never aggregated.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SignatureMismatch {
    pub signature: QuerySignature,
    pub preferred: QuerySignature,
    pub ranges: Vec<DateRange>,
}

impl fmt::Display for SignatureMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ranges: Vec<String> = self.ranges.iter().map(|r| r.to_string()).collect();
        write!(
            f,
            "{} entr{} under signature {} ignored in favour of {} ({})",
            self.ranges.len(),
            if self.ranges.len() == 1 { "y" } else { "ies" },
            self.signature.short(),
            self.preferred.short(),
            ranges.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DailyPoint {
    pub date: NaiveDate,
    pub n: u64,
    pub k: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregate {
    pub kind: SliceKind,
    pub range: DateRange,
    /// Signature the totals were drawn from; `None` when nothing overlapped.
    pub signature: Option<QuerySignature>,
    pub n: u64,
    pub k: u64,
    pub mean: f64,
    /// Binomial standard error of `mean`.
    pub stdev: f64,
    pub missing_dates: Vec<NaiveDate>,
    pub warnings: Vec<SignatureMismatch>,
    pub daily: Vec<DailyPoint>,
    /// Lag statistics pooled over the entries used, weighted by `n`.
    pub lag: LagStats,
    /// Converters behind the pooled median: `k` over whole entries that
    /// report one, not just the days inside the range.
    pub lag_converters: u64,
}

/// Aggregate every entry of `kind` overlapping `range`.
///
/// The preferred signature is `current` when given, otherwise that of the
/// most recently retrieved overlapping entry. Any structural invariant
/// violation in an overlapping entry halts aggregation.
pub fn aggregate(
    store: &ParameterStore,
    kind: SliceKind,
    range: &DateRange,
    current: Option<&QuerySignature>,
) -> Result<Aggregate> {
    let overlapping: Vec<&TimeSeriesEntry> = store.overlapping(kind, range).collect();
    for entry in &overlapping {
        entry.validate(&store.parameter_id)?;
    }

    let preferred = current.cloned().or_else(|| {
        overlapping
            .iter()
            .max_by_key(|e| e.retrieved_at)
            .map(|e| e.query_signature.clone())
    });

    let (used, others): (Vec<&TimeSeriesEntry>, Vec<&TimeSeriesEntry>) = overlapping
        .into_iter()
        .partition(|e| Some(&e.query_signature) == preferred.as_ref());

    let warnings = mismatch_warnings(&store.parameter_id, preferred.as_ref(), &others);

    let mut rows: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
    let mut covered: BTreeSet<NaiveDate> = BTreeSet::new();
    for entry in &used {
        if let Some(span) = entry.range.intersect(range) {
            covered.extend(span.days());
        }
        for (date, n, k) in entry.points().filter(|(d, _, _)| range.contains(*d)) {
            if rows.insert(date, (n, k)).is_some() {
                return Err(FunnelError::invariant(
                    &store.parameter_id,
                    format!("{kind} date {date} stored twice under one signature"),
                ));
            }
        }
    }

    let n: u64 = rows.values().map(|(n, _)| *n).sum();
    let k: u64 = rows.values().map(|(_, k)| *k).sum();
    let (mean, stdev) = binomial_summary(n, k);

    Ok(Aggregate {
        kind,
        range: *range,
        signature: preferred,
        n,
        k,
        mean,
        stdev,
        missing_dates: range.days().filter(|d| !covered.contains(d)).collect(),
        warnings,
        daily: rows
            .into_iter()
            .map(|(date, (n, k))| DailyPoint { date, n, k })
            .collect(),
        lag: pool_lag_stats(&used),
        lag_converters: used
            .iter()
            .filter(|e| e.lag.median_lag_days.is_some())
            .map(|e| e.k_total)
            .sum(),
    })
}

fn mismatch_warnings(
    parameter: &str,
    preferred: Option<&QuerySignature>,
    others: &[&TimeSeriesEntry],
) -> Vec<SignatureMismatch> {
    let Some(preferred) = preferred else {
        return Vec::new();
    };

    let mut grouped: BTreeMap<&QuerySignature, Vec<DateRange>> = BTreeMap::new();
    for entry in others {
        grouped
            .entry(&entry.query_signature)
            .or_default()
            .push(entry.range);
    }

    grouped
        .into_iter()
        .map(|(signature, ranges)| {
            let mismatch = SignatureMismatch {
                signature: signature.clone(),
                preferred: preferred.clone(),
                ranges,
            };
            warn!(parameter, warning = %mismatch, "Signature mismatch while aggregating");
            mismatch
        })
        .collect()
}

/// `(k/n, sqrt(p(1-p)/n))`, or zeros when there is no population.
pub fn binomial_summary(n: u64, k: u64) -> (f64, f64) {
    if n == 0 {
        return (0.0, 0.0);
    }
    let n = n as f64;
    let p = k as f64 / n;
    let variance = (p * (1.0 - p) / n).max(0.0);
    (p, variance.sqrt())
}

/// n-weighted mean of each lag field over the entries that report it.
fn pool_lag_stats(entries: &[&TimeSeriesEntry]) -> LagStats {
    let pool = |field: fn(&LagStats) -> Option<f64>| -> Option<f64> {
        let mut weighted = 0.0;
        let mut weight = 0.0;
        let mut plain = Vec::new();
        for entry in entries {
            if let Some(value) = field(&entry.lag).filter(|v| v.is_finite()) {
                weighted += value * entry.n_total as f64;
                weight += entry.n_total as f64;
                plain.push(value);
            }
        }
        if weight > 0.0 {
            Some(weighted / weight)
        } else if !plain.is_empty() {
            Some(plain.iter().sum::<f64>() / plain.len() as f64)
        } else {
            None
        }
    };

    LagStats {
        median_lag_days: pool(|l| l.median_lag_days),
        mean_lag_days: pool(|l| l.mean_lag_days),
        anchor_median_lag_days: pool(|l| l.anchor_median_lag_days),
        t95: pool(|l| l.t95),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn range(from: u32, to: u32) -> DateRange {
        DateRange::new(d(from), d(to)).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, 0, 0, 0).unwrap()
    }

    fn entry(
        kind: SliceKind,
        r: DateRange,
        sig: &str,
        n: u64,
        k: u64,
        retrieved: DateTime<Utc>,
    ) -> TimeSeriesEntry {
        let dates: Vec<_> = r.days().collect();
        TimeSeriesEntry::new(
            kind,
            r,
            dates.clone(),
            vec![n; dates.len()],
            vec![k; dates.len()],
            QuerySignature::new(sig),
            retrieved,
            LagStats::default(),
        )
    }

    fn under(
        store: &ParameterStore,
        kind: SliceKind,
        r: DateRange,
        sig: &str,
    ) -> Result<Aggregate> {
        aggregate(store, kind, &r, Some(&QuerySignature::new(sig)))
    }

    #[test]
    fn sums_days_inside_the_range_only() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 10), "A", 100, 10, at(1)));
        let agg = under(&store, SliceKind::Window, range(3, 6), "A").unwrap();
        assert_eq!(agg.n, 400);
        assert_eq!(agg.k, 40);
        assert!((agg.mean - 0.1).abs() < 1e-12);
        let expected_sd = (0.1f64 * 0.9 / 400.0).sqrt();
        assert!((agg.stdev - expected_sd).abs() < 1e-12);
        assert!(agg.missing_dates.is_empty());
        assert_eq!(agg.daily.len(), 4);
    }

    #[test]
    fn reports_missing_days() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "A", 10, 1, at(1)));
        let agg = under(&store, SliceKind::Window, range(1, 8), "A").unwrap();
        assert_eq!(agg.missing_dates, vec![d(6), d(7), d(8)]);
    }

    #[test]
    fn conflicting_signatures_warn_and_prefer_current() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "old", 1000, 500, at(1)));
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "new", 10, 1, at(2)));
        let agg = under(&store, SliceKind::Window, range(1, 5), "new").unwrap();
        assert_eq!(agg.n, 50);
        assert_eq!(agg.warnings.len(), 1);
        assert_eq!(agg.warnings[0].signature, QuerySignature::new("old"));
        assert_eq!(agg.warnings[0].ranges, vec![range(1, 5)]);
    }

    #[test]
    fn without_current_signature_latest_retrieval_wins() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "old", 1000, 500, at(1)));
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "new", 10, 1, at(2)));
        let agg = aggregate(&store, SliceKind::Window, &range(1, 5), None).unwrap();
        assert_eq!(agg.signature, Some(QuerySignature::new("new")));
        assert_eq!(agg.n, 50);
    }

    #[test]
    fn only_stale_rows_means_everything_is_missing() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 3), "old", 10, 1, at(1)));
        let agg = under(&store, SliceKind::Window, range(1, 3), "new").unwrap();
        assert_eq!(agg.n, 0);
        assert_eq!(agg.mean, 0.0);
        assert_eq!(agg.missing_dates.len(), 3);
        assert_eq!(agg.warnings.len(), 1);
    }

    #[test]
    fn cohort_rows_do_not_leak_into_window_totals() {
        let mut store = ParameterStore::new("p");
        store
            .entries
            .push(entry(SliceKind::Window, range(1, 5), "A", 10, 1, at(1)));
        store
            .entries
            .push(entry(SliceKind::Cohort, range(1, 5), "A", 99, 9, at(1)));
        let agg = under(&store, SliceKind::Window, range(1, 5), "A").unwrap();
        assert_eq!(agg.n, 50);
        assert!(agg.warnings.is_empty());
    }

    #[test]
    fn invariant_violation_halts_aggregation() {
        let mut store = ParameterStore::new("p");
        let mut broken = entry(SliceKind::Window, range(1, 5), "A", 10, 1, at(1));
        broken.k_total += 1;
        store.entries.push(broken);
        let err = under(&store, SliceKind::Window, range(1, 5), "A").unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn lag_stats_pool_by_population() {
        let mut store = ParameterStore::new("p");
        let mut a = entry(SliceKind::Cohort, range(1, 1), "A", 100, 10, at(1));
        a.lag.median_lag_days = Some(2.0);
        let mut b = entry(SliceKind::Cohort, range(2, 2), "A", 300, 10, at(1));
        b.lag.median_lag_days = Some(4.0);
        store.entries.push(a);
        store.entries.push(b);
        let agg = under(&store, SliceKind::Cohort, range(1, 2), "A").unwrap();
        assert!((agg.lag.median_lag_days.unwrap() - 3.5).abs() < 1e-12);
        assert_eq!(agg.lag.mean_lag_days, None);
    }

    #[test]
    fn lag_converters_count_whole_entries_behind_the_median() {
        let mut store = ParameterStore::new("p");
        let mut with_median = entry(SliceKind::Cohort, range(1, 20), "A", 100, 8, at(1));
        with_median.lag.median_lag_days = Some(2.0);
        store.entries.push(with_median);
        store
            .entries
            .push(entry(SliceKind::Cohort, range(21, 25), "A", 100, 50, at(1)));

        let agg = under(&store, SliceKind::Cohort, range(20, 21), "A").unwrap();
        assert_eq!(agg.k, 58);
        assert_eq!(agg.lag_converters, 160);
    }
}
