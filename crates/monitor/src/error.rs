use std::time::Duration;
use thiserror::Error;

/// Why a gateway could not be fetched this cycle. Always non-fatal: the
/// gateway is skipped and retried on the next cycle.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("fetch timed out after {}s", .0.as_secs())]
    Timeout(Duration),
    #[error("gateway '{0}' not found")]
    NotFound(String),
    #[error("data source request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("data source returned errors: {0}")]
    Api(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("threshold must be between {min} and {max} minutes, got {got}")]
    ThresholdOutOfRange { got: i64, min: i64, max: i64 },
}
