use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall clock time in milliseconds since the UNIX epoch.
///
/// Rate-limit timestamps are written into the shared store, so every
/// process must agree on the epoch. This allows for time mocking in tests.
pub trait Clock: Send + Sync {
	fn now_millis(&self) -> u64;
}

/// Clock backed by the system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
	pub fn new() -> Self {
		Self
	}
}

impl Clock for SystemClock {
	fn now_millis(&self) -> u64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
			.unwrap_or(0)
	}
}

/// Mock clock for testing that allows manual time control.
///
/// Clones share the same underlying time.
///
/// # Examples
///
/// ```
/// use mallcoord_store::{Clock, MockClock};
/// use std::time::Duration;
///
/// let clock = MockClock::new(1_000);
/// clock.advance(Duration::from_secs(61));
/// assert_eq!(clock.now_millis(), 62_000);
/// ```
#[derive(Debug, Clone)]
pub struct MockClock {
	current_millis: Arc<RwLock<u64>>,
}

impl MockClock {
	pub fn new(start_millis: u64) -> Self {
		Self {
			current_millis: Arc::new(RwLock::new(start_millis)),
		}
	}

	pub fn advance(&self, duration: Duration) {
		let mut current = self.current_millis.write();
		*current = current.saturating_add(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX));
	}

	pub fn set_millis(&self, millis: u64) {
		*self.current_millis.write() = millis;
	}
}

impl Default for MockClock {
	fn default() -> Self {
		Self::new(SystemClock.now_millis())
	}
}

impl Clock for MockClock {
	fn now_millis(&self) -> u64 {
		*self.current_millis.read()
	}
}
