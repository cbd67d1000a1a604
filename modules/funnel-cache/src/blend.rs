//! Blend observed evidence with a long-run forecast.
//!
//! Evidence weight is `n_evidence · completeness`; baseline weight is
//! `n_baseline · (1 − completeness)`. Fully matured evidence stands on its
//! own, and evidence with nothing landed yet defers to the baseline.

use serde::{Deserialize, Serialize};

use crate::latency::EdgeLatencyStats;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForecastBaseline {
    pub mean: f64,
    pub n: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    /// Supplied by the caller, e.g. from a wider aggregation window.
    Supplied,
    /// The latency model's `p_infinity` over mature cohorts.
    LatencyModel,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BlendResult {
    pub blended_mean: f64,
    pub evidence_weight: f64,
    pub baseline_weight: f64,
    pub baseline: Option<ForecastBaseline>,
    pub source: Option<BaselineSource>,
}

/// Pick the forecast baseline. A caller-supplied baseline wins; otherwise
/// an available `p_infinity` is adopted so an edge is never left without a
/// forecast just because no wide-window data was passed in.
pub fn resolve_baseline(
    supplied: Option<ForecastBaseline>,
    stats: Option<&EdgeLatencyStats>,
) -> Option<(ForecastBaseline, BaselineSource)> {
    if let Some(baseline) = supplied.filter(|b| b.n > 0 && b.mean.is_finite()) {
        return Some((baseline, BaselineSource::Supplied));
    }
    let stats = stats.filter(|s| s.forecast_available)?;
    let mean = stats.p_infinity?;
    Some((
        ForecastBaseline {
            mean,
            n: stats.n_baseline,
        },
        BaselineSource::LatencyModel,
    ))
}

pub fn blend(
    evidence_mean: f64,
    n_evidence: f64,
    completeness: f64,
    baseline: Option<(ForecastBaseline, BaselineSource)>,
) -> BlendResult {
    let c = if completeness.is_finite() {
        completeness.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let evidence_weight = n_evidence.max(0.0) * c;

    let Some((baseline, source)) = baseline else {
        return BlendResult {
            blended_mean: evidence_mean,
            evidence_weight,
            baseline_weight: 0.0,
            baseline: None,
            source: None,
        };
    };

    let baseline_weight = baseline.n as f64 * (1.0 - c);
    let total = evidence_weight + baseline_weight;
    let blended_mean = if total > 0.0 {
        (evidence_weight * evidence_mean + baseline_weight * baseline.mean) / total
    } else {
        baseline.mean
    };

    BlendResult {
        blended_mean,
        evidence_weight,
        baseline_weight,
        baseline: Some(baseline),
        source: Some(source),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(p_infinity: Option<f64>, n_baseline: u64, available: bool) -> EdgeLatencyStats {
        EdgeLatencyStats {
            mu: 1.0,
            sigma: 0.5,
            t95: 6.0,
            completeness: 0.5,
            p_infinity,
            forecast_available: available,
            n_baseline,
            fallback_fit: false,
        }
    }

    fn baseline(mean: f64, n: u64) -> Option<(ForecastBaseline, BaselineSource)> {
        Some((ForecastBaseline { mean, n }, BaselineSource::Supplied))
    }

    #[test]
    fn complete_evidence_stands_alone() {
        let result = blend(0.2, 1_000.0, 1.0, baseline(0.5, 10_000));
        assert!((result.blended_mean - 0.2).abs() < 1e-12);
        assert_eq!(result.baseline_weight, 0.0);
    }

    #[test]
    fn immature_evidence_defers_to_baseline() {
        let result = blend(0.01, 1_000.0, 0.0, baseline(0.3, 500));
        assert!((result.blended_mean - 0.3).abs() < 1e-12);
    }

    #[test]
    fn half_complete_pools_by_weight() {
        // evidence weight 1000*0.5 = 500, baseline weight 500*0.5 = 250
        let result = blend(0.1, 1_000.0, 0.5, baseline(0.4, 500));
        let expected = (500.0 * 0.1 + 250.0 * 0.4) / 750.0;
        assert!((result.blended_mean - expected).abs() < 1e-12);
    }

    #[test]
    fn no_baseline_returns_evidence() {
        let result = blend(0.15, 100.0, 0.2, None);
        assert_eq!(result.blended_mean, 0.15);
        assert_eq!(result.source, None);
    }

    #[test]
    fn supplied_baseline_wins_over_model() {
        let s = stats(Some(0.3), 5_000, true);
        let supplied = ForecastBaseline { mean: 0.2, n: 80 };
        let (b, source) = resolve_baseline(Some(supplied), Some(&s)).unwrap();
        assert_eq!(source, BaselineSource::Supplied);
        assert_eq!(b.n, 80);
    }

    #[test]
    fn model_forecast_fills_in_when_nothing_supplied() {
        let s = stats(Some(0.3), 5_000, true);
        let (b, source) = resolve_baseline(None, Some(&s)).unwrap();
        assert_eq!(source, BaselineSource::LatencyModel);
        assert_eq!(b.mean, 0.3);
        assert_eq!(b.n, 5_000);
    }

    #[test]
    fn unavailable_forecast_is_not_adopted() {
        let s = stats(Some(0.3), 5, false);
        assert!(resolve_baseline(None, Some(&s)).is_none());
        assert!(resolve_baseline(Some(ForecastBaseline { mean: 0.2, n: 0 }), None).is_none());
    }
}
