use thiserror::Error;

use crate::types::DateRange;

/// Result type alias for cache and model operations.
pub type Result<T> = std::result::Result<T, FunnelError>;

#[derive(Error, Debug)]
pub enum FunnelError {
    /// Stored data broke a structural invariant. Indicates a merge bug;
    /// never corrected silently.
    #[error("Invariant violation in parameter {parameter}: {detail}")]
    InvariantViolation { parameter: String, detail: String },

    #[error("Fetch failed for {range}: {message}")]
    FetchFailed { range: DateRange, message: String },

    #[error("Invalid fetched series: {0}")]
    InvalidSeries(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl FunnelError {
    pub fn invariant(parameter: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::InvariantViolation {
            parameter: parameter.into(),
            detail: detail.into(),
        }
    }

    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, Self::InvariantViolation { .. })
    }
}
