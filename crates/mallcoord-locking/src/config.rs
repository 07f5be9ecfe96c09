//! Lock configuration
//!
//! Durations are written as integer milliseconds (`*_ms` keys) so the same
//! structs load unchanged from TOML settings files.

use crate::{LockError, LockResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

pub(crate) mod duration_ms {
	use serde::{Deserialize, Deserializer, Serializer};
	use std::time::Duration;

	pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
		serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
		u64::deserialize(deserializer).map(Duration::from_millis)
	}
}

/// Clamp a duration to a positive millisecond count for store arguments.
pub(crate) fn lease_millis(value: Duration) -> i64 {
	i64::try_from(value.as_millis()).unwrap_or(i64::MAX).max(1)
}

/// Waits longer than this are treated as unbounded.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365 * 30);

/// Deadline `wait` from now, saturating instead of overflowing the clock.
pub(crate) fn deadline_after(wait: Duration) -> Instant {
	let now = Instant::now();
	now.checked_add(wait).unwrap_or_else(|| now + FAR_FUTURE)
}

fn random_instance_id() -> String {
	uuid::Uuid::new_v4().simple().to_string()
}

fn check_positive(name: &str, value: Duration) -> LockResult<()> {
	if value.is_zero() {
		return Err(LockError::InvalidConfig(format!("{name} must be positive")));
	}
	Ok(())
}

/// Settings for [`SimpleLock`](crate::SimpleLock).
///
/// # Examples
///
/// ```
/// use mallcoord_locking::LockConfig;
/// use std::time::Duration;
///
/// let config = LockConfig::default();
/// assert_eq!(config.key_prefix, "mallcoord:lock:");
/// assert_eq!(config.retry_interval, Duration::from_millis(50));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
	/// Namespace prepended to every business key
	pub key_prefix: String,
	#[serde(rename = "default_lease_ms", with = "duration_ms")]
	pub default_lease: Duration,
	#[serde(rename = "default_wait_ms", with = "duration_ms")]
	pub default_wait: Duration,
	/// Pause between acquisition attempts
	#[serde(rename = "retry_interval_ms", with = "duration_ms")]
	pub retry_interval: Duration,
	/// Caller identity embedded in every owner token
	pub instance_id: String,
}

impl Default for LockConfig {
	fn default() -> Self {
		Self {
			key_prefix: "mallcoord:lock:".to_string(),
			default_lease: Duration::from_secs(10),
			default_wait: Duration::from_secs(3),
			retry_interval: Duration::from_millis(50),
			instance_id: random_instance_id(),
		}
	}
}

impl LockConfig {
	/// # Errors
	///
	/// Returns [`LockError::InvalidConfig`] for zero durations or an empty
	/// instance id.
	pub fn validate(&self) -> LockResult<()> {
		check_positive("default_lease_ms", self.default_lease)?;
		check_positive("retry_interval_ms", self.retry_interval)?;
		if self.instance_id.is_empty() {
			return Err(LockError::InvalidConfig(
				"instance_id must not be empty".to_string(),
			));
		}
		Ok(())
	}
}

/// Settings for [`AdvancedLockManager`](crate::AdvancedLockManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedLockConfig {
	pub key_prefix: String,
	/// Lease used when the caller does not pick one; renewed every third of it
	#[serde(rename = "watchdog_timeout_ms", with = "duration_ms")]
	pub watchdog_timeout: Duration,
	#[serde(rename = "default_wait_ms", with = "duration_ms")]
	pub default_wait: Duration,
	#[serde(rename = "retry_interval_ms", with = "duration_ms")]
	pub retry_interval: Duration,
	/// How long a fair-lock waiter keeps its queue slot without polling
	#[serde(rename = "fair_waiter_timeout_ms", with = "duration_ms")]
	pub fair_waiter_timeout: Duration,
	pub instance_id: String,
}

impl Default for AdvancedLockConfig {
	fn default() -> Self {
		Self {
			key_prefix: "mallcoord:rlock:".to_string(),
			watchdog_timeout: Duration::from_secs(30),
			default_wait: Duration::from_secs(3),
			retry_interval: Duration::from_millis(100),
			fair_waiter_timeout: Duration::from_secs(5),
			instance_id: random_instance_id(),
		}
	}
}

impl AdvancedLockConfig {
	/// # Errors
	///
	/// Returns [`LockError::InvalidConfig`] for zero durations, an empty
	/// instance id, or a fair waiter timeout that would lapse between polls.
	pub fn validate(&self) -> LockResult<()> {
		check_positive("watchdog_timeout_ms", self.watchdog_timeout)?;
		check_positive("retry_interval_ms", self.retry_interval)?;
		check_positive("fair_waiter_timeout_ms", self.fair_waiter_timeout)?;
		if self.fair_waiter_timeout <= self.retry_interval {
			return Err(LockError::InvalidConfig(
				"fair_waiter_timeout_ms must exceed retry_interval_ms".to_string(),
			));
		}
		if self.instance_id.is_empty() || self.instance_id.contains(':') {
			return Err(LockError::InvalidConfig(
				"instance_id must be non-empty and must not contain ':'".to_string(),
			));
		}
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use rstest::rstest;

	#[rstest]
	fn test_lock_config_loads_millisecond_fields() {
		// Arrange
		let raw = r#"
			key_prefix = "shop:lock:"
			default_lease_ms = 2500
			retry_interval_ms = 20
			instance_id = "node-a"
		"#;

		// Act
		let config: LockConfig = toml::from_str(raw).unwrap();

		// Assert
		assert_eq!(config.key_prefix, "shop:lock:");
		assert_eq!(config.default_lease, Duration::from_millis(2500));
		assert_eq!(config.retry_interval, Duration::from_millis(20));
		assert_eq!(config.default_wait, Duration::from_secs(3));
		assert!(config.validate().is_ok());
	}

	#[rstest]
	fn test_default_instance_ids_are_unique() {
		assert_ne!(
			LockConfig::default().instance_id,
			LockConfig::default().instance_id
		);
	}

	#[rstest]
	fn test_zero_lease_is_rejected() {
		// Arrange
		let config = LockConfig {
			default_lease: Duration::ZERO,
			..LockConfig::default()
		};

		// Act & Assert
		assert!(matches!(config.validate(), Err(LockError::InvalidConfig(_))));
	}

	#[rstest]
	fn test_fair_waiter_timeout_must_outlast_polling() {
		// Arrange
		let config = AdvancedLockConfig {
			fair_waiter_timeout: Duration::from_millis(50),
			retry_interval: Duration::from_millis(100),
			..AdvancedLockConfig::default()
		};

		// Act & Assert
		assert!(config.validate().is_err());
		assert!(AdvancedLockConfig::default().validate().is_ok());
	}

	#[rstest]
	#[case(Duration::ZERO, 1)]
	#[case(Duration::from_millis(1500), 1500)]
	#[case(Duration::from_secs(10), 10_000)]
	fn test_lease_millis(#[case] input: Duration, #[case] expected: i64) {
		assert_eq!(lease_millis(input), expected);
	}
}
