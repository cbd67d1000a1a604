use std::env;
use std::str::FromStr;

use tracing::info;

use crate::error::{FunnelError, Result};

/// Tuning knobs for the cache policy and the latency model.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maturity used when a slice carries no usable t95.
    pub default_maturity_days: u32,
    /// Cohort slices retrieved longer ago than this are replaced wholesale.
    pub cohort_freshness_hours: i64,
    /// Decay scale for recency-weighting mature cohorts in p_infinity.
    pub recency_half_life_days: f64,
    /// Converters needed before the observed median lag is trusted.
    pub min_fit_converters: u64,
    /// Mature-cohort sample size needed before a forecast is offered.
    pub min_baseline_n: u64,
    /// Attempts per gap before the gap is reported as failed.
    pub fetch_attempts: u32,
    /// Scenario weights at or below this count as inactive.
    pub scenario_epsilon: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_maturity_days: 7,
            cohort_freshness_hours: 24,
            recency_half_life_days: 30.0,
            min_fit_converters: 30,
            min_baseline_n: 100,
            fetch_attempts: 2,
            scenario_epsilon: 1e-9,
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            default_maturity_days: optional_env(
                "FUNNEL_MATURITY_DAYS",
                defaults.default_maturity_days,
            )?,
            cohort_freshness_hours: optional_env(
                "FUNNEL_COHORT_FRESHNESS_HOURS",
                defaults.cohort_freshness_hours,
            )?,
            recency_half_life_days: optional_env(
                "FUNNEL_RECENCY_HALF_LIFE_DAYS",
                defaults.recency_half_life_days,
            )?,
            min_fit_converters: optional_env(
                "FUNNEL_MIN_FIT_CONVERTERS",
                defaults.min_fit_converters,
            )?,
            min_baseline_n: optional_env("FUNNEL_MIN_BASELINE_N", defaults.min_baseline_n)?,
            fetch_attempts: optional_env("FUNNEL_FETCH_ATTEMPTS", defaults.fetch_attempts)?,
            scenario_epsilon: optional_env(
                "FUNNEL_SCENARIO_EPSILON",
                defaults.scenario_epsilon,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_maturity_days == 0 {
            return Err(FunnelError::Config(
                "FUNNEL_MATURITY_DAYS must be at least 1".into(),
            ));
        }
        if self.recency_half_life_days.is_nan() || self.recency_half_life_days <= 0.0 {
            return Err(FunnelError::Config(
                "FUNNEL_RECENCY_HALF_LIFE_DAYS must be positive".into(),
            ));
        }
        if self.fetch_attempts == 0 {
            return Err(FunnelError::Config(
                "FUNNEL_FETCH_ATTEMPTS must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_redacted(&self) {
        info!(
            maturity_days = self.default_maturity_days,
            cohort_freshness_hours = self.cohort_freshness_hours,
            recency_half_life_days = self.recency_half_life_days,
            min_fit_converters = self.min_fit_converters,
            min_baseline_n = self.min_baseline_n,
            fetch_attempts = self.fetch_attempts,
            "Funnel cache config"
        );
    }
}

fn optional_env<T: FromStr>(key: &str, default: T) -> Result<T> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| FunnelError::Config(format!("{key} has an invalid value: '{raw}'"))),
        Err(_) => Ok(default),
    }
}
