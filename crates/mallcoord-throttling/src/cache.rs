//! Process-local cache of known-denied window keys.
//!
//! Entries only ever short-circuit to "denied" and vanish once their reset
//! time passes, so the cache can be stale in the deny direction by at most
//! one window boundary and never in the allow direction. Losing the cache
//! costs store round trips, not correctness.

use parking_lot::RwLock;
use std::collections::HashMap;

/// Bounded map of `window key -> reset_at_ms`.
#[derive(Debug)]
pub struct NegativeCache {
	entries: RwLock<HashMap<String, u64>>,
	capacity: usize,
}

impl NegativeCache {
	/// A zero `capacity` disables caching.
	pub fn new(capacity: usize) -> Self {
		Self {
			entries: RwLock::new(HashMap::new()),
			capacity,
		}
	}

	pub fn capacity(&self) -> usize {
		self.capacity
	}

	/// Reset time of a still-active denial for `key`.
	pub fn denied_until(&self, key: &str, now_ms: u64) -> Option<u64> {
		let reset_at = *self.entries.read().get(key)?;
		if reset_at > now_ms {
			return Some(reset_at);
		}
		let mut entries = self.entries.write();
		if entries.get(key).is_some_and(|&stored| stored <= now_ms) {
			entries.remove(key);
		}
		None
	}

	/// Remember that `key` is denied until `reset_at_ms`.
	///
	/// When full, expired entries are purged first; if the cache is still
	/// full the entry expiring soonest is evicted.
	pub fn record(&self, key: &str, reset_at_ms: u64, now_ms: u64) {
		if self.capacity == 0 || reset_at_ms <= now_ms {
			return;
		}
		let mut entries = self.entries.write();
		if !entries.contains_key(key) && entries.len() >= self.capacity {
			entries.retain(|_, &mut reset_at| reset_at > now_ms);
			if entries.len() >= self.capacity {
				let soonest = entries
					.iter()
					.min_by_key(|(_, reset_at)| **reset_at)
					.map(|(key, _)| key.clone());
				if let Some(soonest) = soonest {
					entries.remove(&soonest);
				}
			}
		}
		entries.insert(key.to_string(), reset_at_ms);
	}

	pub fn invalidate(&self, key: &str) {
		self.entries.write().remove(key);
	}

	pub fn purge_expired(&self, now_ms: u64) {
		self.entries.write().retain(|_, &mut reset_at| reset_at > now_ms);
	}

	pub fn len(&self) -> usize {
		self.entries.read().len()
	}

	pub fn is_empty(&self) -> bool {
		self.entries.read().is_empty()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_entry_expires_at_reset_time() {
		// Arrange
		let cache = NegativeCache::new(8);
		cache.record("login:1.2.3.4", 2_000, 1_000);

		// Act & Assert
		assert_eq!(cache.denied_until("login:1.2.3.4", 1_999), Some(2_000));
		assert_eq!(cache.denied_until("login:1.2.3.4", 2_000), None);
		assert!(cache.is_empty());
	}

	#[rstest]
	fn test_full_cache_evicts_soonest_expiring() {
		// Arrange
		let cache = NegativeCache::new(2);
		cache.record("a", 5_000, 0);
		cache.record("b", 3_000, 0);

		// Act
		cache.record("c", 9_000, 0);

		// Assert
		assert_eq!(cache.len(), 2);
		assert_eq!(cache.denied_until("b", 0), None);
		assert_eq!(cache.denied_until("a", 0), Some(5_000));
		assert_eq!(cache.denied_until("c", 0), Some(9_000));
	}

	#[rstest]
	fn test_full_cache_prefers_purging_expired() {
		// Arrange
		let cache = NegativeCache::new(2);
		cache.record("stale", 1_000, 0);
		cache.record("live", 9_000, 0);

		// Act
		cache.record("new", 4_000, 2_000);

		// Assert
		assert_eq!(cache.denied_until("live", 2_000), Some(9_000));
		assert_eq!(cache.denied_until("new", 2_000), Some(4_000));
	}

	#[rstest]
	fn test_zero_capacity_disables_cache() {
		let cache = NegativeCache::new(0);
		cache.record("a", 5_000, 0);
		assert!(cache.is_empty());
	}

	#[rstest]
	fn test_invalidate_and_purge() {
		// Arrange
		let cache = NegativeCache::new(4);
		cache.record("a", 5_000, 0);
		cache.record("b", 1_000, 0);

		// Act
		cache.invalidate("a");
		cache.purge_expired(1_000);

		// Assert
		assert!(cache.is_empty());
	}
}
