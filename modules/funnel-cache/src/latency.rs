//! Per-edge conversion delay model.
//!
//! Conversion delay is modelled as log-normal. From the fitted distribution
//! we derive how complete each cohort's observed conversions are at its
//! current age, and a long-run rate (`p_infinity`) from cohorts old enough
//! to have settled. Everything here is a pure function of the store
//! snapshot, the analysis date, and the scenario view; nothing is cached.

use std::f64::consts::SQRT_2;
use std::sync::Arc;

use chrono::NaiveDate;
use funnel_common::{Config, LagStats};
use serde::Serialize;

/// z-score of the 95th percentile of a standard normal.
const Z_95: f64 = 1.644_853_626_951_472_2;
pub const DEFAULT_SIGMA: f64 = 0.5;
pub const MIN_SIGMA: f64 = 0.1;
pub const MAX_SIGMA: f64 = 3.0;

/// How to derive the log-normal spread from observed lag statistics.
///
/// The ratio heuristic below is the default; swap it out to tune.
pub trait SigmaStrategy: Send + Sync {
    fn sigma(&self, median: f64, mean: Option<f64>, converters: u64) -> f64;

    /// Spread used when the median itself could not be trusted.
    fn fallback(&self) -> f64 {
        DEFAULT_SIGMA
    }
}

/// For a log-normal, `mean / median = exp(sigma² / 2)`, so
/// `sigma = sqrt(2 · ln(mean / median))`.
#[derive(Debug, Clone, Copy)]
pub struct MeanMedianRatio {
    pub min_converters: u64,
    pub default_sigma: f64,
}

impl Default for MeanMedianRatio {
    fn default() -> Self {
        Self {
            min_converters: Config::default().min_fit_converters,
            default_sigma: DEFAULT_SIGMA,
        }
    }
}

impl SigmaStrategy for MeanMedianRatio {
    fn sigma(&self, median: f64, mean: Option<f64>, converters: u64) -> f64 {
        if converters < self.min_converters || !(median.is_finite() && median > 0.0) {
            return self.default_sigma;
        }
        match mean {
            Some(mean) if mean.is_finite() && mean > median => {
                (2.0 * (mean / median).ln()).sqrt().clamp(MIN_SIGMA, MAX_SIGMA)
            }
            _ => self.default_sigma,
        }
    }

    fn fallback(&self) -> f64 {
        self.default_sigma
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LagFit {
    pub mu: f64,
    pub sigma: f64,
    pub t95: f64,
    /// The median was unusable and `mu` came from the maturity window.
    pub used_fallback: bool,
}

/// Fit `(mu, sigma)` from lag statistics.
///
/// `mu = ln(median)` when the median is present and backed by at least
/// `min_converters`; otherwise `mu = ln(maturity_days / 2)`. A positive
/// independently fitted `t95` is kept as-is, otherwise it is read off the
/// fitted distribution.
pub fn fit_lag(
    lag: &LagStats,
    converters: u64,
    maturity_days: f64,
    min_converters: u64,
    strategy: &dyn SigmaStrategy,
) -> LagFit {
    let usable_median = lag
        .median_lag_days
        .filter(|m| m.is_finite() && *m > 0.0)
        .filter(|_| converters >= min_converters);

    let (mu, sigma, used_fallback) = match usable_median {
        Some(median) => (
            median.ln(),
            strategy.sigma(median, lag.mean_lag_days, converters),
            false,
        ),
        None => {
            let half_window = (maturity_days / 2.0).max(0.5);
            (half_window.ln(), strategy.fallback(), true)
        }
    };

    let t95 = lag
        .t95
        .filter(|t| t.is_finite() && *t > 0.0)
        .unwrap_or_else(|| (mu + Z_95 * sigma).exp());

    LagFit {
        mu,
        sigma,
        t95,
        used_fallback,
    }
}

/// P(delay ≤ age) under a log-normal(mu, sigma).
pub fn lognormal_cdf(age_days: f64, mu: f64, sigma: f64) -> f64 {
    if age_days.is_nan() || age_days <= 0.0 {
        return 0.0;
    }
    if sigma <= 0.0 {
        return if age_days.ln() >= mu { 1.0 } else { 0.0 };
    }
    let z = (age_days.ln() - mu) / (sigma * SQRT_2);
    (0.5 * (1.0 + erf(z))).clamp(0.0, 1.0)
}

/// Abramowitz & Stegun 7.1.26; absolute error below 1.5e-7.
fn erf(x: f64) -> f64 {
    const P: f64 = 0.327_591_1;
    const A: [f64; 5] = [
        0.254_829_592,
        -0.284_496_736,
        1.421_413_741,
        -1.453_152_027,
        1.061_405_429,
    ];
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();
    let t = 1.0 / (1.0 + P * x);
    let poly = A.iter().rev().fold(0.0, |acc, a| acc * t + a) * t;
    sign * (1.0 - poly * (-x * x).exp())
}

/// Age of a cohort as seen by a downstream edge: days since the cohort
/// entered, minus the median time it takes to reach this edge's source.
///
/// Always the median, never t95: subtracting the worst-case delay clamps
/// young cohorts to zero age and collapses completeness.
pub fn effective_age(today: NaiveDate, cohort_date: NaiveDate, anchor_median_lag: f64) -> f64 {
    let raw = (today - cohort_date).num_days() as f64;
    (raw - anchor_median_lag.max(0.0)).max(0.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CohortPoint {
    pub date: NaiveDate,
    pub n: u64,
    pub k: u64,
}

pub struct LatencyInputs<'a> {
    /// Cohorts inside the requested range; completeness is computed here.
    pub cohorts: &'a [CohortPoint],
    /// All stored cohorts for the edge; mature ones feed `p_infinity`.
    pub history: &'a [CohortPoint],
    pub lag: LagStats,
    /// Converters backing the lag statistics.
    pub converters: u64,
    pub maturity_days: f64,
    /// The real analysis date, not the end of the requested range.
    pub today: NaiveDate,
}

/// Derived per query, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EdgeLatencyStats {
    pub mu: f64,
    pub sigma: f64,
    pub t95: f64,
    pub completeness: f64,
    pub p_infinity: Option<f64>,
    pub forecast_available: bool,
    pub n_baseline: u64,
    pub fallback_fit: bool,
}

pub struct LatencyModel {
    min_fit_converters: u64,
    min_baseline_n: u64,
    recency_half_life_days: f64,
    strategy: Arc<dyn SigmaStrategy>,
}

impl LatencyModel {
    pub fn new(config: &Config) -> Self {
        Self {
            min_fit_converters: config.min_fit_converters,
            min_baseline_n: config.min_baseline_n,
            recency_half_life_days: config.recency_half_life_days,
            strategy: Arc::new(MeanMedianRatio {
                min_converters: config.min_fit_converters,
                default_sigma: DEFAULT_SIGMA,
            }),
        }
    }

    pub fn with_strategy(mut self, strategy: Arc<dyn SigmaStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn evaluate(&self, inputs: &LatencyInputs<'_>) -> EdgeLatencyStats {
        let fit = fit_lag(
            &inputs.lag,
            inputs.converters,
            inputs.maturity_days,
            self.min_fit_converters,
            self.strategy.as_ref(),
        );
        let anchor = inputs.lag.anchor_median_lag_days.unwrap_or(0.0);

        let completeness = completeness(inputs.cohorts, inputs.today, anchor, &fit);
        let (p_infinity, n_baseline) =
            self.long_run_rate(inputs.history, inputs.today, anchor, &fit);
        let forecast_available = p_infinity.is_some() && n_baseline >= self.min_baseline_n;

        EdgeLatencyStats {
            mu: fit.mu,
            sigma: fit.sigma,
            t95: fit.t95,
            completeness,
            p_infinity,
            forecast_available,
            n_baseline,
            fallback_fit: fit.used_fallback,
        }
    }

    /// Recency-weighted rate over mature cohorts (effective age > t95),
    /// weight `exp(-age / half_life)` so the estimate tracks drift.
    fn long_run_rate(
        &self,
        history: &[CohortPoint],
        today: NaiveDate,
        anchor: f64,
        fit: &LagFit,
    ) -> (Option<f64>, u64) {
        let mut weighted_k = 0.0;
        let mut weighted_n = 0.0;
        let mut n_baseline = 0u64;

        for cohort in history {
            let age = effective_age(today, cohort.date, anchor);
            if age <= fit.t95 {
                continue;
            }
            let w = (-age / self.recency_half_life_days).exp();
            weighted_k += w * cohort.k as f64;
            weighted_n += w * cohort.n as f64;
            n_baseline += cohort.n;
        }

        let rate = (weighted_n > 0.0).then(|| (weighted_k / weighted_n).clamp(0.0, 1.0));
        (rate, n_baseline)
    }
}

/// `Σ nᵢ·CDF(ageᵢ) / Σ nᵢ` over the cohorts feeding the edge.
pub fn completeness(cohorts: &[CohortPoint], today: NaiveDate, anchor: f64, fit: &LagFit) -> f64 {
    let total: f64 = cohorts.iter().map(|c| c.n as f64).sum();
    if total <= 0.0 {
        return 0.0;
    }
    let observed: f64 = cohorts
        .iter()
        .map(|c| {
            let age = effective_age(today, c.date, anchor);
            c.n as f64 * lognormal_cdf(age, fit.mu, fit.sigma)
        })
        .sum();
    (observed / total).clamp(0.0, 1.0)
}
