use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FunnelError, Result};

// --- Slice kinds and ranges ---

/// How a slice's dates are keyed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SliceKind {
    /// Keyed by absolute calendar date of the event.
    Window,
    /// Keyed by the date a user entered the funnel. Outcomes keep
    /// changing after the cohort closes.
    Cohort,
}

impl SliceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SliceKind::Window => "window",
            SliceKind::Cohort => "cohort",
        }
    }
}

impl fmt::Display for SliceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SliceKind {
    type Err = FunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "window" => Ok(SliceKind::Window),
            "cohort" => Ok(SliceKind::Cohort),
            other => Err(FunnelError::Validation(format!(
                "unknown slice kind '{other}' (expected window or cohort)"
            ))),
        }
    }
}

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Result<Self> {
        if from > to {
            return Err(FunnelError::Validation(format!(
                "date range starts after it ends: {from}..{to}"
            )));
        }
        Ok(Self { from, to })
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { from: day, to: day }
    }

    /// Number of days in the range, both ends included.
    pub fn len_days(&self) -> i64 {
        (self.to - self.from).num_days() + 1
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        self.from <= day && day <= self.to
    }

    pub fn overlaps(&self, other: &DateRange) -> bool {
        self.from <= other.to && other.from <= self.to
    }

    pub fn intersect(&self, other: &DateRange) -> Option<DateRange> {
        let from = self.from.max(other.from);
        let to = self.to.min(other.to);
        (from <= to).then_some(DateRange { from, to })
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let to = self.to;
        self.from.iter_days().take_while(move |d| *d <= to)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

// --- Query identity ---

/// Stable fingerprint of a query's shape. Two entries with different
/// signatures describe different questions, even for the same dates.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QuerySignature(pub String);

impl QuerySignature {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First 12 characters, for log lines.
    pub fn short(&self) -> &str {
        let end = self.0.char_indices().nth(12).map(|(i, _)| i).unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl fmt::Display for QuerySignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// --- Stored series ---

/// Lag statistics reported alongside a fetched slice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LagStats {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub median_lag_days: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_lag_days: Option<f64>,
    /// Median time from the analysis anchor event to this slice's source
    /// node. Not the slice's own internal lag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anchor_median_lag_days: Option<f64>,
    /// 95th-percentile delay, when fitted independently.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub t95: Option<f64>,
}

impl LagStats {
    pub fn is_empty(&self) -> bool {
        self.median_lag_days.is_none()
            && self.mean_lag_days.is_none()
            && self.anchor_median_lag_days.is_none()
            && self.t95.is_none()
    }
}

/// Daily rows returned by one fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchedSeries {
    pub dates: Vec<NaiveDate>,
    pub n_daily: Vec<u64>,
    pub k_daily: Vec<u64>,
    #[serde(flatten)]
    pub lag: LagStats,
}

impl FetchedSeries {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }
}

/// One fetched/stored slice of daily trial (`n`) and success (`k`) counts.
///
/// Once written an entry is only replaced by the merge engine; callers never
/// edit the daily arrays in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesEntry {
    pub slice_kind: SliceKind,
    pub range: DateRange,
    pub dates: Vec<NaiveDate>,
    pub n_daily: Vec<u64>,
    pub k_daily: Vec<u64>,
    pub n_total: u64,
    pub k_total: u64,
    pub query_signature: QuerySignature,
    pub retrieved_at: DateTime<Utc>,
    #[serde(flatten)]
    pub lag: LagStats,
}

impl TimeSeriesEntry {
    /// Build an entry from already-aligned daily arrays. Totals are derived
    /// from the arrays.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        slice_kind: SliceKind,
        range: DateRange,
        dates: Vec<NaiveDate>,
        n_daily: Vec<u64>,
        k_daily: Vec<u64>,
        query_signature: QuerySignature,
        retrieved_at: DateTime<Utc>,
        lag: LagStats,
    ) -> Self {
        let n_total = n_daily.iter().sum();
        let k_total = k_daily.iter().sum();
        Self {
            slice_kind,
            range,
            dates,
            n_daily,
            k_daily,
            n_total,
            k_total,
            query_signature,
            retrieved_at,
            lag,
        }
    }

    /// `(date, n, k)` triples in date order.
    pub fn points(&self) -> impl Iterator<Item = (NaiveDate, u64, u64)> + '_ {
        self.dates
            .iter()
            .zip(self.n_daily.iter())
            .zip(self.k_daily.iter())
            .map(|((d, n), k)| (*d, *n, *k))
    }

    /// A new entry holding only the part of this one inside `sub`.
    /// Returns `None` when the ranges do not intersect.
    pub fn restricted_to(&self, sub: &DateRange) -> Option<TimeSeriesEntry> {
        let range = self.range.intersect(sub)?;
        let mut dates = Vec::new();
        let mut n_daily = Vec::new();
        let mut k_daily = Vec::new();
        for (d, n, k) in self.points().filter(|(d, _, _)| range.contains(*d)) {
            dates.push(d);
            n_daily.push(n);
            k_daily.push(k);
        }
        Some(TimeSeriesEntry::new(
            self.slice_kind,
            range,
            dates,
            n_daily,
            k_daily,
            self.query_signature.clone(),
            self.retrieved_at,
            self.lag,
        ))
    }

    /// A stored day is settled when it was at least `maturity_days` old at
    /// the moment it was retrieved.
    pub fn is_settled(&self, day: NaiveDate, maturity_days: i64) -> bool {
        (self.retrieved_at.date_naive() - day).num_days() >= maturity_days
    }

    /// Check the structural invariants. Violations are reported, never fixed.
    pub fn validate(&self, parameter: &str) -> Result<()> {
        let len = self.dates.len();
        if self.n_daily.len() != len || self.k_daily.len() != len {
            return Err(FunnelError::invariant(
                parameter,
                format!(
                    "{} entry {}: misaligned arrays (dates={}, n={}, k={})",
                    self.slice_kind,
                    self.range,
                    len,
                    self.n_daily.len(),
                    self.k_daily.len()
                ),
            ));
        }
        if let Some(pair) = self.dates.windows(2).find(|w| w[0] >= w[1]) {
            return Err(FunnelError::invariant(
                parameter,
                format!(
                    "{} entry {}: dates not strictly ascending at {} -> {}",
                    self.slice_kind, self.range, pair[0], pair[1]
                ),
            ));
        }
        if let Some(outside) = self.dates.iter().find(|d| !self.range.contains(**d)) {
            return Err(FunnelError::invariant(
                parameter,
                format!(
                    "{} entry {}: date {} outside entry range",
                    self.slice_kind, self.range, outside
                ),
            ));
        }
        let n_sum: u64 = self.n_daily.iter().sum();
        let k_sum: u64 = self.k_daily.iter().sum();
        if n_sum != self.n_total || k_sum != self.k_total {
            return Err(FunnelError::invariant(
                parameter,
                format!(
                    "{} entry {}: totals drifted (sum n={} vs n={}, sum k={} vs k={})",
                    self.slice_kind, self.range, n_sum, self.n_total, k_sum, self.k_total
                ),
            ));
        }
        Ok(())
    }
}

/// All stored entries for one logical query target (an edge/parameter).
/// Entries under older query signatures are kept as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterStore {
    pub parameter_id: String,
    #[serde(default)]
    pub entries: Vec<TimeSeriesEntry>,
}

impl ParameterStore {
    pub fn new(parameter_id: impl Into<String>) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            entries: Vec::new(),
        }
    }

    pub fn entries_of(&self, kind: SliceKind) -> impl Iterator<Item = &TimeSeriesEntry> {
        self.entries.iter().filter(move |e| e.slice_kind == kind)
    }

    /// Entries of `kind` whose range overlaps `range`.
    pub fn overlapping(
        &self,
        kind: SliceKind,
        range: &DateRange,
    ) -> impl Iterator<Item = &TimeSeriesEntry> {
        let range = *range;
        self.entries_of(kind).filter(move |e| e.range.overlaps(&range))
    }

    pub fn validate(&self) -> Result<()> {
        for entry in &self.entries {
            entry.validate(&self.parameter_id)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn entry(dates: Vec<NaiveDate>, n: Vec<u64>, k: Vec<u64>) -> TimeSeriesEntry {
        TimeSeriesEntry::new(
            SliceKind::Window,
            DateRange::new(d(1), d(10)).unwrap(),
            dates,
            n,
            k,
            QuerySignature::new("sig-a"),
            Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap(),
            LagStats::default(),
        )
    }

    #[test]
    fn range_rejects_inverted_bounds() {
        assert!(DateRange::new(d(5), d(4)).is_err());
        assert_eq!(DateRange::new(d(4), d(4)).unwrap().len_days(), 1);
    }

    #[test]
    fn range_days_are_inclusive() {
        let r = DateRange::new(d(1), d(3)).unwrap();
        assert_eq!(r.days().collect::<Vec<_>>(), vec![d(1), d(2), d(3)]);
    }

    #[test]
    fn intersect_and_overlap_agree() {
        let a = DateRange::new(d(1), d(5)).unwrap();
        let b = DateRange::new(d(5), d(9)).unwrap();
        let c = DateRange::new(d(6), d(9)).unwrap();
        assert!(a.overlaps(&b));
        assert_eq!(a.intersect(&b), Some(DateRange::single(d(5))));
        assert!(!a.overlaps(&c));
        assert_eq!(a.intersect(&c), None);
    }

    #[test]
    fn totals_follow_daily_arrays() {
        let e = entry(vec![d(1), d(2)], vec![10, 20], vec![1, 3]);
        assert_eq!(e.n_total, 30);
        assert_eq!(e.k_total, 4);
        assert!(e.validate("p").is_ok());
    }

    #[test]
    fn drifted_totals_are_an_invariant_violation() {
        let mut e = entry(vec![d(1), d(2)], vec![10, 20], vec![1, 3]);
        e.n_total = 31;
        let err = e.validate("p").unwrap_err();
        assert!(err.is_invariant_violation());
    }

    #[test]
    fn unsorted_dates_are_an_invariant_violation() {
        let e = entry(vec![d(2), d(1)], vec![1, 1], vec![0, 0]);
        assert!(e.validate("p").unwrap_err().is_invariant_violation());

        let dup = entry(vec![d(2), d(2)], vec![1, 1], vec![0, 0]);
        assert!(dup.validate("p").unwrap_err().is_invariant_violation());
    }

    #[test]
    fn restricted_entry_keeps_only_inner_days() {
        let e = entry(vec![d(1), d(4), d(8)], vec![5, 6, 7], vec![1, 2, 3]);
        let sub = e.restricted_to(&DateRange::new(d(3), d(20)).unwrap()).unwrap();
        assert_eq!(sub.range, DateRange::new(d(3), d(10)).unwrap());
        assert_eq!(sub.dates, vec![d(4), d(8)]);
        assert_eq!(sub.n_total, 13);
        assert_eq!(sub.k_total, 5);
    }

    #[test]
    fn settled_is_judged_at_retrieval_time() {
        let e = entry(vec![d(1)], vec![1], vec![1]);
        // Retrieved 2025-03-01: January days are weeks old.
        assert!(e.is_settled(d(10), 7));
        assert!(!e.is_settled(NaiveDate::from_ymd_opt(2025, 2, 26).unwrap(), 7));
    }

    #[test]
    fn slice_kind_parses_case_insensitively() {
        assert_eq!("Cohort".parse::<SliceKind>().unwrap(), SliceKind::Cohort);
        assert!("funnel".parse::<SliceKind>().is_err());
    }

    #[test]
    fn entry_serializes_lag_fields_flat() {
        let mut e = entry(vec![d(1)], vec![1], vec![1]);
        e.lag.median_lag_days = Some(3.0);
        let json = serde_json::to_value(&e).unwrap();
        assert_eq!(json["median_lag_days"], 3.0);
        assert_eq!(json["slice_kind"], "window");
        let back: TimeSeriesEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back, e);
    }
}
