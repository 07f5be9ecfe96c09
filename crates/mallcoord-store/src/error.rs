use thiserror::Error;

/// Errors raised while executing an atomic script against the store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
	/// The store could not be reached or rejected the script at runtime.
	///
	/// This is the only retryable kind; callers decide between fail-open and
	/// fail-closed handling.
	#[error("store unavailable while running `{script}`: {message}")]
	Unavailable {
		script: &'static str,
		message: String,
	},
	/// The call does not match the declared shape of the script.
	#[error("invalid call to `{script}`: {message}")]
	InvalidCall {
		script: &'static str,
		message: String,
	},
	/// The script returned a value of an unexpected type.
	#[error("unexpected reply from `{script}`: {reply}")]
	UnexpectedReply { script: &'static str, reply: String },
}

impl StoreError {
	pub fn unavailable(script: &'static str, message: impl Into<String>) -> Self {
		Self::Unavailable {
			script,
			message: message.into(),
		}
	}

	/// Returns `true` when retrying the same call may succeed.
	///
	/// # Examples
	///
	/// ```
	/// use mallcoord_store::StoreError;
	///
	/// let err = StoreError::unavailable("lock.release", "connection refused");
	/// assert!(err.is_retryable());
	/// ```
	pub fn is_retryable(&self) -> bool {
		matches!(self, Self::Unavailable { .. })
	}
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;
