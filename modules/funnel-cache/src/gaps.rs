//! Gap planning: turn "what's missing" into the fewest contiguous fetch
//! windows. External APIs are billed per call, so every already-stored day
//! is left out of the plan.

use std::collections::BTreeSet;

use chrono::NaiveDate;
use funnel_common::{DateRange, ParameterStore, QuerySignature, SliceKind};
use serde::{Deserialize, Serialize};

/// Where a gap sits inside the requested range, for "N days missing at the
/// start/middle/end" style hints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GapPosition {
    Start,
    Middle,
    End,
    /// The gap spans the whole request.
    Whole,
}

/// Days inside `within` covered by entries of `kind` stored under
/// `signature`. Rows under any other signature do not count as coverage.
pub fn covered_dates(
    store: &ParameterStore,
    kind: SliceKind,
    signature: &QuerySignature,
    within: &DateRange,
) -> BTreeSet<NaiveDate> {
    store
        .overlapping(kind, within)
        .filter(|e| &e.query_signature == signature)
        .filter_map(|e| e.range.intersect(within))
        .flat_map(|r| r.days())
        .collect()
}

/// Requested days with no coverage, ascending.
pub fn missing_dates(requested: &DateRange, covered: &BTreeSet<NaiveDate>) -> Vec<NaiveDate> {
    requested.days().filter(|d| !covered.contains(d)).collect()
}

/// `requested − covered`, grouped into maximal contiguous runs.
pub fn plan_gaps(requested: &DateRange, covered: &BTreeSet<NaiveDate>) -> Vec<DateRange> {
    group_contiguous(missing_dates(requested, covered))
}

/// Group days into maximal runs of consecutive dates.
pub fn group_contiguous(days: impl IntoIterator<Item = NaiveDate>) -> Vec<DateRange> {
    let sorted: BTreeSet<NaiveDate> = days.into_iter().collect();
    let mut runs: Vec<DateRange> = Vec::new();

    for day in sorted {
        match runs.last_mut() {
            Some(run) if run.to.succ_opt() == Some(day) => run.to = day,
            _ => runs.push(DateRange::single(day)),
        }
    }
    runs
}

pub fn gap_position(requested: &DateRange, gap: &DateRange) -> GapPosition {
    match (gap.from <= requested.from, gap.to >= requested.to) {
        (true, true) => GapPosition::Whole,
        (true, false) => GapPosition::Start,
        (false, true) => GapPosition::End,
        (false, false) => GapPosition::Middle,
    }
}
