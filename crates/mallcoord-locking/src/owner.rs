use std::fmt;

/// Identity of an advanced-lock holder: one process instance plus one
/// logical session (a task, request or worker) within it.
///
/// Reentrancy is per owner. Two sessions of the same instance are distinct
/// owners and exclude each other.
///
/// # Examples
///
/// ```
/// use mallcoord_locking::LockOwner;
///
/// let owner = LockOwner::new("node-a", "worker-3");
/// assert_eq!(owner.id(), "node-a:worker-3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
	instance: String,
	session: String,
}

impl LockOwner {
	pub fn new(instance: impl Into<String>, session: impl Into<String>) -> Self {
		Self {
			instance: instance.into(),
			session: session.into(),
		}
	}

	pub fn instance(&self) -> &str {
		&self.instance
	}

	pub fn session(&self) -> &str {
		&self.session
	}

	/// Hash field identifying this owner in the store
	pub fn id(&self) -> String {
		format!("{}:{}", self.instance, self.session)
	}
}

impl fmt::Display for LockOwner {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.instance, self.session)
	}
}
