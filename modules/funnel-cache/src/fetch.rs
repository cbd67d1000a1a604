//! Source-system fetch seam.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::debug;

use funnel_common::{DateRange, FetchedSeries, LagStats, QuerySignature, SliceKind};

use crate::signature::QueryShape;

/// Everything a source needs to answer one gap.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchQuery {
    pub parameter_id: String,
    pub shape: QueryShape,
    pub slice_kind: SliceKind,
    pub signature: QuerySignature,
}

/// Retrieves daily `n`/`k` rows for one date range from the source system.
/// May be slow and may fail; the pipeline retries and records failures.
#[async_trait]
pub trait SeriesFetcher: Send + Sync {
    async fn fetch(&self, query: &FetchQuery, range: DateRange) -> Result<FetchedSeries>;
}

// ---------------------------------------------------------------------------
// ReplayFetcher (offline runs and tests — answers from recorded fixtures)
// ---------------------------------------------------------------------------

/// One recorded source response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Restrict to one parameter; `None` matches all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slice_kind: Option<SliceKind>,
    pub range: DateRange,
    #[serde(flatten)]
    pub series: FetchedSeries,
}

impl Recording {
    fn matches(&self, query: &FetchQuery, range: &DateRange) -> bool {
        self.parameter_id
            .as_deref()
            .map_or(true, |id| id == query.parameter_id)
            && self.slice_kind.map_or(true, |kind| kind == query.slice_kind)
            && self.range.overlaps(range)
    }
}

/// Serves fetches from recorded responses. Later recordings win on
/// overlapping days.
pub struct ReplayFetcher {
    recordings: Vec<Recording>,
}

impl ReplayFetcher {
    pub fn new(recordings: Vec<Recording>) -> Self {
        Self { recordings }
    }

    /// Load a JSON array of recordings.
    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading fixture {}", path.display()))?;
        let recordings: Vec<Recording> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing fixture {}", path.display()))?;
        debug!(path = %path.display(), recordings = recordings.len(), "Loaded replay fixture");
        Ok(Self::new(recordings))
    }

    pub fn len(&self) -> usize {
        self.recordings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.recordings.is_empty()
    }
}

#[async_trait]
impl SeriesFetcher for ReplayFetcher {
    async fn fetch(&self, query: &FetchQuery, range: DateRange) -> Result<FetchedSeries> {
        let matching: Vec<&Recording> = self
            .recordings
            .iter()
            .filter(|r| r.matches(query, &range))
            .collect();
        if matching.is_empty() {
            bail!(
                "no recording for {} ({}) covering {range}",
                query.parameter_id,
                query.slice_kind
            );
        }

        let mut rows: BTreeMap<NaiveDate, (u64, u64)> = BTreeMap::new();
        let mut lag = LagStats::default();
        for recording in &matching {
            let series = &recording.series;
            for ((date, n), k) in series.dates.iter().zip(&series.n_daily).zip(&series.k_daily) {
                if range.contains(*date) {
                    rows.insert(*date, (*n, *k));
                }
            }
            if !series.lag.is_empty() {
                lag = series.lag;
            }
        }

        let mut out = FetchedSeries {
            lag,
            ..FetchedSeries::empty()
        };
        for (date, (n, k)) in rows {
            out.dates.push(date);
            out.n_daily.push(n);
            out.k_daily.push(k);
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// Arc<F> blanket — lets tests keep a handle on a recording fetcher
// ---------------------------------------------------------------------------

#[async_trait]
impl<F: SeriesFetcher + ?Sized> SeriesFetcher for Arc<F> {
    async fn fetch(&self, query: &FetchQuery, range: DateRange) -> Result<FetchedSeries> {
        (**self).fetch(query, range).await
    }
}
