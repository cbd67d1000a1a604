//! What-if scenario resolution.
//!
//! The scenario collaborator hands us a resolved view: for each edge, its
//! effective weight under the selected case variants and conditional
//! branches. Edges with ~0 weight are inactive and must contribute neither
//! population nor delay. The active set is recomputed on every query.

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EdgeActivity {
    pub weight: f64,
    pub active: bool,
}

impl EdgeActivity {
    pub fn is_effectively_active(&self, epsilon: f64) -> bool {
        self.active && self.weight.is_finite() && self.weight.abs() > epsilon
    }
}

/// Resolved, read-only scenario view.
pub trait ScenarioView: Send + Sync {
    fn edge_activity(&self, edge_id: &str) -> EdgeActivity;
}

/// No what-if selection: every edge at full weight.
pub struct AllEdgesActive;

impl ScenarioView for AllEdgesActive {
    fn edge_activity(&self, _edge_id: &str) -> EdgeActivity {
        EdgeActivity {
            weight: 1.0,
            active: true,
        }
    }
}

/// Fixed per-edge weights, e.g. loaded from a scenario file. Edges not
/// listed take `default_weight`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticScenario {
    #[serde(default)]
    pub weights: HashMap<String, f64>,
    #[serde(default = "full_weight")]
    pub default_weight: f64,
}

fn full_weight() -> f64 {
    1.0
}

impl Default for StaticScenario {
    fn default() -> Self {
        Self {
            weights: HashMap::new(),
            default_weight: full_weight(),
        }
    }
}

impl StaticScenario {
    pub fn with_weight(mut self, edge_id: impl Into<String>, weight: f64) -> Self {
        self.weights.insert(edge_id.into(), weight);
        self
    }
}

impl ScenarioView for StaticScenario {
    fn edge_activity(&self, edge_id: &str) -> EdgeActivity {
        let weight = self
            .weights
            .get(edge_id)
            .copied()
            .unwrap_or(self.default_weight);
        EdgeActivity {
            weight,
            active: weight > 0.0,
        }
    }
}

/// Edges active under the current view.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ActiveEdgeSet {
    edges: BTreeSet<String>,
}

impl ActiveEdgeSet {
    pub fn resolve<'a>(
        view: &dyn ScenarioView,
        edges: impl IntoIterator<Item = &'a str>,
        epsilon: f64,
    ) -> Self {
        let edges = edges
            .into_iter()
            .filter(|edge| view.edge_activity(edge).is_effectively_active(epsilon))
            .map(str::to_string)
            .collect();
        Self { edges }
    }

    pub fn contains(&self, edge_id: &str) -> bool {
        self.edges.contains(edge_id)
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.edges.iter().map(String::as_str)
    }
}

/// Population arriving over one inbound edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundEdge {
    pub edge_id: String,
    pub n: u64,
}

/// Scenario-weighted population over active inbound edges.
pub fn inbound_population(inbound: &[InboundEdge], view: &dyn ScenarioView, epsilon: f64) -> f64 {
    inbound
        .iter()
        .filter_map(|edge| {
            let activity = view.edge_activity(&edge.edge_id);
            activity
                .is_effectively_active(epsilon)
                .then(|| edge.n as f64 * activity.weight)
        })
        .sum()
}

/// Delay summary of one edge on an upstream path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeLag {
    pub edge_id: String,
    pub median_lag_days: f64,
    pub t95: f64,
}

/// Paths whose every edge is active, each with its product weight.
fn active_paths<'a>(
    paths: &'a [Vec<EdgeLag>],
    view: &dyn ScenarioView,
    epsilon: f64,
) -> Vec<(&'a [EdgeLag], f64)> {
    paths
        .iter()
        .filter(|path| !path.is_empty())
        .filter_map(|path| {
            let mut weight = 1.0;
            for edge in path {
                let activity = view.edge_activity(&edge.edge_id);
                if !activity.is_effectively_active(epsilon) {
                    return None;
                }
                weight *= activity.weight;
            }
            Some((path.as_slice(), weight))
        })
        .collect()
}

/// Worst-case cumulative delay: the largest `Σ t95` over active paths.
pub fn path_t95(paths: &[Vec<EdgeLag>], view: &dyn ScenarioView, epsilon: f64) -> Option<f64> {
    active_paths(paths, view, epsilon)
        .into_iter()
        .map(|(path, _)| path.iter().map(|e| e.t95.max(0.0)).sum::<f64>())
        .reduce(f64::max)
}

/// Typical time from the anchor to the end of the paths: the
/// scenario-weighted mean of `Σ median` over active paths.
pub fn path_anchor_lag(
    paths: &[Vec<EdgeLag>],
    view: &dyn ScenarioView,
    epsilon: f64,
) -> Option<f64> {
    let active = active_paths(paths, view, epsilon);
    let total_weight: f64 = active.iter().map(|(_, w)| *w).sum();
    if total_weight <= 0.0 {
        return None;
    }
    let weighted: f64 = active
        .iter()
        .map(|(path, w)| w * path.iter().map(|e| e.median_lag_days.max(0.0)).sum::<f64>())
        .sum();
    Some(weighted / total_weight)
}
