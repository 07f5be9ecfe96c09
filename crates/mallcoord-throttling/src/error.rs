use mallcoord_store::StoreError;
use thiserror::Error;

/// Throttling errors
///
/// A rate-limit denial is not an error: it is reported as a
/// [`RateDecision`](crate::RateDecision) with `allowed == false`.
#[derive(Debug, Error)]
pub enum ThrottleError {
	#[error("Invalid key: {0}")]
	InvalidKey(String),
	#[error("Invalid rule: {0}")]
	InvalidRule(String),
	#[error("Invalid limiter configuration: {0}")]
	InvalidConfig(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Result type for throttling operations
pub type ThrottleResult<T> = Result<T, ThrottleError>;
