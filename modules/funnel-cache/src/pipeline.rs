//! Pipeline orchestrator. The only component that talks to the fetch and
//! persistence collaborators.
//!
//! Gaps are fetched one at a time in planner order. Each completed gap is
//! merged into a copy of the store, saved, and only then adopted, so a
//! cancelled or failed gap leaves the store exactly as it was and never
//! rolls back gaps merged before it.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use funnel_common::{
    Config, DateRange, FetchedSeries, FunnelError, ParameterStore, QuerySignature, Result,
    SliceKind,
};

use crate::aggregate::{aggregate, Aggregate, SignatureMismatch};
use crate::blend::{blend, resolve_baseline, BaselineSource, ForecastBaseline};
use crate::fetch::{FetchQuery, SeriesFetcher};
use crate::latency::{CohortPoint, EdgeLatencyStats, LatencyInputs, LatencyModel, SigmaStrategy};
use crate::merge::{composite, merge_fetched};
use crate::policy::{Maturity, RefetchDecision, RefetchPolicy, RefetchRequest};
use crate::scenario::{
    inbound_population, path_anchor_lag, path_t95, EdgeLag, InboundEdge, ScenarioView,
};
use crate::signature::QueryShape;
use crate::store::ParameterRepository;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveOptions {
    #[serde(default)]
    pub bust_cache: bool,
    /// Overrides the configured maturity.
    #[serde(default)]
    pub maturity_days: Option<u32>,
    /// Overrides any t95 stored with the series.
    #[serde(default)]
    pub t95: Option<f64>,
    /// Baseline from a wider aggregation window, if the caller has one.
    #[serde(default)]
    pub forecast_baseline: Option<ForecastBaseline>,
}

impl ResolveOptions {
    /// The caller's t95, if it is usable. Applies to both the refetch
    /// decision and the latency fit.
    fn override_t95(&self) -> Option<f64> {
        self.t95.filter(|t| t.is_finite() && *t > 0.0)
    }
}

/// Present when the edge participates in a latency chain.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyContext {
    pub edge_id: String,
    /// Edges feeding population into this edge.
    #[serde(default)]
    pub inbound: Vec<InboundEdge>,
    /// Alternative upstream paths from the anchor to this edge's source.
    #[serde(default)]
    pub upstream_paths: Vec<Vec<EdgeLag>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolveRequest {
    pub parameter_id: String,
    pub query: QueryShape,
    pub range: DateRange,
    pub slice_kind: SliceKind,
    pub options: ResolveOptions,
    pub latency: Option<LatencyContext>,
}

impl ResolveRequest {
    pub fn new(
        parameter_id: impl Into<String>,
        query: QueryShape,
        range: DateRange,
        slice_kind: SliceKind,
    ) -> Self {
        Self {
            parameter_id: parameter_id.into(),
            query,
            range,
            slice_kind,
            options: ResolveOptions::default(),
            latency: None,
        }
    }

    pub fn with_options(mut self, options: ResolveOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_latency(mut self, latency: LatencyContext) -> Self {
        self.latency = Some(latency);
        self
    }
}

/// A gap that could not be fetched or merged. Other gaps are unaffected.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchFailure {
    pub range: DateRange,
    pub attempts: u32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveResult {
    pub parameter_id: String,
    pub signature: QuerySignature,
    pub decision: RefetchDecision,
    /// Gaps fetched and merged during this call.
    pub fetched: Vec<DateRange>,
    pub fetch_failures: Vec<FetchFailure>,
    pub mean: f64,
    pub stdev: f64,
    pub n: u64,
    pub k: u64,
    pub missing_dates: Vec<NaiveDate>,
    pub warnings: Vec<SignatureMismatch>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_active: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completeness: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast: Option<ForecastBaseline>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forecast_source: Option<BaselineSource>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blended_mean: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub population: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path_t95: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latency: Option<EdgeLatencyStats>,
}

impl ResolveResult {
    fn from_aggregate(
        req: &ResolveRequest,
        signature: QuerySignature,
        decision: RefetchDecision,
        fetched: Vec<DateRange>,
        fetch_failures: Vec<FetchFailure>,
        agg: Aggregate,
    ) -> Self {
        Self {
            parameter_id: req.parameter_id.clone(),
            signature,
            decision,
            fetched,
            fetch_failures,
            mean: agg.mean,
            stdev: agg.stdev,
            n: agg.n,
            k: agg.k,
            missing_dates: agg.missing_dates,
            warnings: agg.warnings,
            edge_active: None,
            completeness: None,
            forecast: None,
            forecast_source: None,
            blended_mean: None,
            population: None,
            path_t95: None,
            latency: None,
        }
    }
}

pub struct Pipeline {
    config: Config,
    fetcher: Arc<dyn SeriesFetcher>,
    repository: Arc<dyn ParameterRepository>,
    scenario: Arc<dyn ScenarioView>,
    policy: RefetchPolicy,
    latency: LatencyModel,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Pipeline {
    pub fn new(
        config: Config,
        fetcher: Arc<dyn SeriesFetcher>,
        repository: Arc<dyn ParameterRepository>,
        scenario: Arc<dyn ScenarioView>,
    ) -> Self {
        Self {
            policy: RefetchPolicy::new(&config),
            latency: LatencyModel::new(&config),
            config,
            fetcher,
            repository,
            scenario,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_sigma_strategy(mut self, strategy: Arc<dyn SigmaStrategy>) -> Self {
        self.latency = self.latency.with_strategy(strategy);
        self
    }

    async fn parameter_lock(&self, parameter_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(parameter_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop lock entries no resolve holds. Clones are only taken under the
    /// map lock, so a count of one means the map owns the last handle.
    /// Entries left behind by a cancelled resolve go on the next call.
    async fn prune_locks(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Parameters with a resolve in flight or waiting.
    pub async fn tracked_locks(&self) -> usize {
        self.locks.lock().await.len()
    }

    /// Resolve one query against the cache, fetching whatever the refetch
    /// policy asks for. `now` is the analysis clock: it stamps merged
    /// entries and ages cohorts.
    pub async fn resolve(&self, req: &ResolveRequest, now: DateTime<Utc>) -> Result<ResolveResult> {
        let lock = self.parameter_lock(&req.parameter_id).await;
        let result = {
            let _guard = lock.lock().await;
            self.resolve_locked(req, now).await
        };
        drop(lock);
        self.prune_locks().await;
        result
    }

    async fn resolve_locked(
        &self,
        req: &ResolveRequest,
        now: DateTime<Utc>,
    ) -> Result<ResolveResult> {
        let signature = req.query.signature();
        let mut store = self
            .repository
            .load(&req.parameter_id)
            .await?
            .unwrap_or_else(|| ParameterStore::new(&req.parameter_id));
        if let Err(e) = store.validate() {
            error!(parameter = %req.parameter_id, error = %e, "Stored series failed validation");
            return Err(e);
        }

        let maturity = Maturity {
            maturity_days: req.options.maturity_days,
            t95: req
                .options
                .override_t95()
                .or_else(|| stored_t95(&store, req.slice_kind, &signature)),
        };
        let decision = self.policy.decide(&RefetchRequest {
            store: &store,
            kind: req.slice_kind,
            range: req.range,
            signature: &signature,
            maturity,
            bust_cache: req.options.bust_cache,
            now,
        });

        let query = FetchQuery {
            parameter_id: req.parameter_id.clone(),
            shape: req.query.clone(),
            slice_kind: req.slice_kind,
            signature: signature.clone(),
        };

        let mut fetched = Vec::new();
        let mut failures = Vec::new();
        for window in &decision.fetch_windows {
            let (series, attempts) = match self.fetch_with_retry(&query, *window).await {
                Ok(ok) => ok,
                Err(failure) => {
                    failures.push(failure);
                    continue;
                }
            };

            let mut next = store.clone();
            match merge_fetched(&mut next, req.slice_kind, *window, series, &signature, now) {
                Ok(outcome) => {
                    self.repository.save(&next).await?;
                    store = next;
                    fetched.push(*window);
                    info!(
                        parameter = %req.parameter_id,
                        gap = %window,
                        inserted = outcome.inserted_days,
                        replaced = outcome.replaced_days,
                        "Merged gap"
                    );
                }
                Err(FunnelError::InvalidSeries(message)) => {
                    warn!(
                        parameter = %req.parameter_id,
                        gap = %window,
                        %message,
                        "Rejected fetched series"
                    );
                    failures.push(FetchFailure {
                        range: *window,
                        attempts,
                        message,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let agg = aggregate(&store, req.slice_kind, &req.range, Some(&signature))?;
        let mut result = ResolveResult::from_aggregate(
            req,
            signature.clone(),
            decision,
            fetched,
            failures,
            agg.clone(),
        );

        if let Some(ctx) = &req.latency {
            self.apply_latency(req, ctx, &store, &signature, &agg, now, &mut result)?;
        }

        info!(
            parameter = %req.parameter_id,
            signature = signature.short(),
            action = ?result.decision.action,
            n = result.n,
            k = result.k,
            missing = result.missing_dates.len(),
            failures = result.fetch_failures.len(),
            "Resolved"
        );
        Ok(result)
    }

    /// Fetch one gap, retrying up to the configured attempts. Returns the
    /// series and how many attempts it took.
    async fn fetch_with_retry(
        &self,
        query: &FetchQuery,
        range: DateRange,
    ) -> std::result::Result<(FetchedSeries, u32), FetchFailure> {
        let attempts = self.config.fetch_attempts.max(1);
        let mut last_error = None;
        for attempt in 1..=attempts {
            match self.fetcher.fetch(query, range).await {
                Ok(series) => return Ok((series, attempt)),
                Err(e) => {
                    warn!(
                        parameter = %query.parameter_id,
                        gap = %range,
                        attempt,
                        error = %e,
                        "Fetch attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        let message = last_error
            .map(|e| format!("{e:#}"))
            .unwrap_or_else(|| "no attempt made".to_string());
        let err = FunnelError::FetchFailed {
            range,
            message: message.clone(),
        };
        error!(parameter = %query.parameter_id, error = %err, attempts, "Giving up on gap");
        Err(FetchFailure {
            range,
            attempts,
            message,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_latency(
        &self,
        req: &ResolveRequest,
        ctx: &LatencyContext,
        store: &ParameterStore,
        signature: &QuerySignature,
        agg: &Aggregate,
        now: DateTime<Utc>,
        result: &mut ResolveResult,
    ) -> Result<()> {
        let epsilon = self.config.scenario_epsilon;
        let scenario = self.scenario.as_ref();

        if !scenario
            .edge_activity(&ctx.edge_id)
            .is_effectively_active(epsilon)
        {
            info!(
                parameter = %req.parameter_id,
                edge = %ctx.edge_id,
                "Edge inactive under scenario"
            );
            result.edge_active = Some(false);
            result.population = Some(0.0);
            return Ok(());
        }
        result.edge_active = Some(true);

        let mut lag = agg.lag;
        match req.slice_kind {
            SliceKind::Window => lag.anchor_median_lag_days = Some(0.0),
            SliceKind::Cohort => {
                if let Some(anchor) = path_anchor_lag(&ctx.upstream_paths, scenario, epsilon) {
                    lag.anchor_median_lag_days = Some(anchor);
                }
            }
        }
        if let Some(t95) = req.options.override_t95() {
            lag.t95 = Some(t95);
        }
        result.path_t95 = path_t95(&ctx.upstream_paths, scenario, epsilon);

        let history: Vec<CohortPoint> = {
            let series = composite(store, req.slice_kind, signature)?;
            series
                .dates
                .iter()
                .zip(&series.n_daily)
                .zip(&series.k_daily)
                .map(|((date, n), k)| CohortPoint {
                    date: *date,
                    n: *n,
                    k: *k,
                })
                .collect()
        };
        let cohorts: Vec<CohortPoint> = agg
            .daily
            .iter()
            .map(|p| CohortPoint {
                date: p.date,
                n: p.n,
                k: p.k,
            })
            .collect();

        let maturity_days = req
            .options
            .maturity_days
            .unwrap_or(self.config.default_maturity_days);
        let stats = self.latency.evaluate(&LatencyInputs {
            cohorts: &cohorts,
            history: &history,
            lag,
            converters: agg.lag_converters,
            maturity_days: f64::from(maturity_days),
            today: now.date_naive(),
        });

        let n_evidence = if ctx.inbound.is_empty() {
            agg.n as f64
        } else {
            inbound_population(&ctx.inbound, scenario, epsilon)
        };
        let baseline = resolve_baseline(req.options.forecast_baseline, Some(&stats));
        let blended = blend(agg.mean, n_evidence, stats.completeness, baseline);

        result.completeness = Some(stats.completeness);
        result.forecast = blended.baseline;
        result.forecast_source = blended.source;
        result.blended_mean = Some(blended.blended_mean);
        result.population = Some(n_evidence);
        result.latency = Some(stats);
        Ok(())
    }
}

/// The most recently retrieved t95 stored under the current signature.
fn stored_t95(store: &ParameterStore, kind: SliceKind, signature: &QuerySignature) -> Option<f64> {
    store
        .entries_of(kind)
        .filter(|e| &e.query_signature == signature && e.lag.t95.is_some())
        .max_by_key(|e| e.retrieved_at)
        .and_then(|e| e.lag.t95)
}
