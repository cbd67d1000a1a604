//! Query fingerprints.
//!
//! A signature identifies the *shape* of a query: source/target nodes,
//! visited and excluded constraints, and context filters. Stored entries
//! carry the signature they were fetched under so a changed query definition
//! can be told apart from "the same slice, refreshed".

use std::collections::BTreeMap;

use funnel_common::QuerySignature;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Bumped whenever the canonical form below changes.
const SIGNATURE_VERSION: u32 = 1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryShape {
    pub from_node: String,
    pub to_node: String,
    #[serde(default)]
    pub visited: Vec<String>,
    #[serde(default)]
    pub excluded: Vec<String>,
    #[serde(default)]
    pub context_filters: BTreeMap<String, String>,
}

impl QueryShape {
    pub fn new(from_node: impl Into<String>, to_node: impl Into<String>) -> Self {
        Self {
            from_node: from_node.into(),
            to_node: to_node.into(),
            ..Default::default()
        }
    }

    pub fn visiting(mut self, node: impl Into<String>) -> Self {
        self.visited.push(node.into());
        self
    }

    pub fn excluding(mut self, node: impl Into<String>) -> Self {
        self.excluded.push(node.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context_filters.insert(key.into(), value.into());
        self
    }

    pub fn signature(&self) -> QuerySignature {
        compute_signature(self)
    }
}

/// SHA-256 over a canonical JSON rendering of the shape.
///
/// Constraint lists are order-insensitive and whitespace around names is
/// ignored, so cosmetic edits to a query do not invalidate its cache.
pub fn compute_signature(shape: &QueryShape) -> QuerySignature {
    let context: BTreeMap<&str, &str> = shape
        .context_filters
        .iter()
        .map(|(k, v)| (k.trim(), v.trim()))
        .collect();

    let canonical = serde_json::json!({
        "v": SIGNATURE_VERSION,
        "from": shape.from_node.trim(),
        "to": shape.to_node.trim(),
        "visited": canonical_set(&shape.visited),
        "excluded": canonical_set(&shape.excluded),
        "context": context,
    });

    let digest = Sha256::digest(canonical.to_string().as_bytes());
    QuerySignature(hex::encode(digest))
}

fn canonical_set(items: &[String]) -> Vec<&str> {
    let mut out: Vec<&str> = items
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}
