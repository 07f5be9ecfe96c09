use mallcoord_store::StoreError;
use thiserror::Error;

/// Why an acquisition attempt gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AcquireFailure {
	/// The wait budget elapsed while another owner held the lock.
	#[error("wait time elapsed")]
	Timeout,
	/// The caller cancelled the wait.
	#[error("interrupted while waiting")]
	Interrupted,
	/// The store could not be reached; mutual exclusion must not be assumed.
	#[error("store unavailable")]
	StoreUnavailable,
}

/// Lock errors
#[derive(Debug, Error)]
pub enum LockError {
	#[error("could not acquire lock `{key}`: {reason}")]
	AcquisitionFailed { key: String, reason: AcquireFailure },
	#[error("invalid lock configuration: {0}")]
	InvalidConfig(String),
	#[error(transparent)]
	Store(#[from] StoreError),
}

impl LockError {
	pub(crate) fn acquisition(key: &str, reason: AcquireFailure) -> Self {
		Self::AcquisitionFailed {
			key: key.to_string(),
			reason,
		}
	}

	/// Returns `true` when the enclosing operation may reasonably retry.
	pub fn is_retryable(&self) -> bool {
		match self {
			Self::AcquisitionFailed { reason, .. } => !matches!(reason, AcquireFailure::Interrupted),
			Self::InvalidConfig(_) => false,
			Self::Store(e) => e.is_retryable(),
		}
	}
}

/// Result type for lock operations
pub type LockResult<T> = Result<T, LockError>;
