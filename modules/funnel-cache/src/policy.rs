//! Refetch decisions: given what is stored and how mature it is, decide
//! whether to hit the external service and for which days.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use funnel_common::{Config, DateRange, ParameterStore, QuerySignature, SliceKind};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::gaps::{covered_dates, group_contiguous, missing_dates};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefetchAction {
    /// Fully covered under the current signature and settled. No fetch.
    UseCache,
    /// Some requested days have no current-signature coverage.
    GapsOnly,
    /// Covered, but the recent tail was still settling when fetched.
    Partial,
    /// Cohort slice retrieved too long ago; refetch it whole.
    ReplaceSlice,
    /// Caller asked to ignore the cache.
    BustCache,
}

impl RefetchAction {
    pub fn needs_fetch(&self) -> bool {
        !matches!(self, RefetchAction::UseCache)
    }
}

/// Maturity input. `t95` wins when present and positive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Maturity {
    pub maturity_days: Option<u32>,
    pub t95: Option<f64>,
}

impl Maturity {
    pub fn effective_days(&self, fallback_days: u32) -> i64 {
        match self.t95 {
            Some(t95) if t95.is_finite() && t95 > 0.0 => t95.ceil() as i64,
            _ => i64::from(self.maturity_days.unwrap_or(fallback_days)),
        }
    }
}

pub struct RefetchRequest<'a> {
    pub store: &'a ParameterStore,
    pub kind: SliceKind,
    pub range: DateRange,
    pub signature: &'a QuerySignature,
    pub maturity: Maturity,
    pub bust_cache: bool,
    pub now: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RefetchDecision {
    pub action: RefetchAction,
    /// Contiguous windows to fetch, in ascending order.
    pub fetch_windows: Vec<DateRange>,
    /// Requested days with no current-signature coverage.
    pub missing_dates: Vec<NaiveDate>,
    /// Earliest covered day that was still settling when it was fetched.
    pub immature_from: Option<NaiveDate>,
    pub maturity_days: i64,
}

/// Decides one of the five refetch actions.
///
/// Precedence: bust_cache, replace_slice, partial, gaps_only, use_cache.
pub struct RefetchPolicy {
    default_maturity_days: u32,
    cohort_freshness: Duration,
}

impl RefetchPolicy {
    pub fn new(config: &Config) -> Self {
        Self {
            default_maturity_days: config.default_maturity_days,
            cohort_freshness: Duration::hours(config.cohort_freshness_hours),
        }
    }

    pub fn decide(&self, req: &RefetchRequest<'_>) -> RefetchDecision {
        let maturity_days = req.maturity.effective_days(self.default_maturity_days);
        let covered = covered_dates(req.store, req.kind, req.signature, &req.range);
        let missing = missing_dates(&req.range, &covered);

        let decision = if req.bust_cache {
            RefetchDecision {
                action: RefetchAction::BustCache,
                fetch_windows: vec![req.range],
                missing_dates: req.range.days().collect(),
                immature_from: None,
                maturity_days,
            }
        } else {
            match req.kind {
                SliceKind::Cohort => self.decide_cohort(req, missing, maturity_days),
                SliceKind::Window => self.decide_window(req, missing, maturity_days),
            }
        };

        debug!(
            parameter = %req.store.parameter_id,
            kind = %req.kind,
            range = %req.range,
            action = ?decision.action,
            windows = decision.fetch_windows.len(),
            missing = decision.missing_dates.len(),
            "Refetch decision"
        );
        decision
    }

    /// Cohort freshness is judged by retrieval age, not cohort age: cohort
    /// outcomes keep moving after the cohort closes, so patching is unsafe.
    fn decide_cohort(
        &self,
        req: &RefetchRequest<'_>,
        missing: Vec<NaiveDate>,
        maturity_days: i64,
    ) -> RefetchDecision {
        let stale = req
            .store
            .overlapping(SliceKind::Cohort, &req.range)
            .filter(|e| &e.query_signature == req.signature)
            .any(|e| req.now - e.retrieved_at > self.cohort_freshness);

        let (action, fetch_windows) = if stale {
            (RefetchAction::ReplaceSlice, vec![req.range])
        } else if !missing.is_empty() {
            (RefetchAction::GapsOnly, group_contiguous(missing.iter().copied()))
        } else {
            (RefetchAction::UseCache, Vec::new())
        };

        RefetchDecision {
            action,
            fetch_windows,
            missing_dates: missing,
            immature_from: None,
            maturity_days,
        }
    }

    fn decide_window(
        &self,
        req: &RefetchRequest<'_>,
        missing: Vec<NaiveDate>,
        maturity_days: i64,
    ) -> RefetchDecision {
        let immature_from = req
            .store
            .overlapping(SliceKind::Window, &req.range)
            .filter(|e| &e.query_signature == req.signature)
            .filter_map(|e| {
                let span = e.range.intersect(&req.range)?;
                span.days().find(|d| !e.is_settled(*d, maturity_days))
            })
            .min();

        let (action, fetch_windows) = match immature_from {
            Some(first) => {
                // Re-fetch the settling tail and any holes in one plan.
                let tail = DateRange {
                    from: first,
                    to: req.range.to,
                };
                let mut days: BTreeSet<NaiveDate> = missing.iter().copied().collect();
                days.extend(tail.days());
                (RefetchAction::Partial, group_contiguous(days))
            }
            None if !missing.is_empty() => {
                (RefetchAction::GapsOnly, group_contiguous(missing.iter().copied()))
            }
            None => (RefetchAction::UseCache, Vec::new()),
        };

        RefetchDecision {
            action,
            fetch_windows,
            missing_dates: missing,
            immature_from,
            maturity_days,
        }
    }
}
