//! Incremental cache of daily conversion counts with a latency-aware
//! forecast layered on top.
//!
//! Callers go through [`Pipeline::resolve`]. Everything below it is pure and
//! synchronous: the refetch policy decides what to fetch, the gap planner
//! turns that into fetch windows, the merge engine folds results into the
//! [`ParameterStore`], the aggregator summarizes a range, and the latency
//! model plus blender correct for conversions that have not landed yet.

pub mod aggregate;
pub mod blend;
pub mod fetch;
pub mod gaps;
pub mod latency;
pub mod merge;
pub mod pipeline;
pub mod policy;
pub mod scenario;
pub mod signature;
pub mod store;

pub use aggregate::{aggregate, Aggregate, SignatureMismatch};
pub use blend::{blend, resolve_baseline, BaselineSource, BlendResult, ForecastBaseline};
pub use fetch::{FetchQuery, Recording, ReplayFetcher, SeriesFetcher};
pub use funnel_common::{
    Config, DateRange, FetchedSeries, FunnelError, LagStats, ParameterStore, QuerySignature,
    Result, SliceKind, TimeSeriesEntry,
};
pub use gaps::{covered_dates, plan_gaps, GapPosition};
pub use latency::{
    CohortPoint, EdgeLatencyStats, LatencyInputs, LatencyModel, MeanMedianRatio, SigmaStrategy,
};
pub use merge::{composite, merge_fetched, CompositeSeries, MergeOutcome};
pub use pipeline::{
    FetchFailure, LatencyContext, Pipeline, ResolveOptions, ResolveRequest, ResolveResult,
};
pub use policy::{Maturity, RefetchAction, RefetchDecision, RefetchPolicy, RefetchRequest};
pub use scenario::{
    inbound_population, path_anchor_lag, path_t95, ActiveEdgeSet, AllEdgesActive, EdgeActivity,
    EdgeLag, InboundEdge, ScenarioView, StaticScenario,
};
pub use signature::{compute_signature, QueryShape};
pub use store::{JsonFileRepository, MemoryParameterRepository, ParameterRepository};
