use mallcoord_conf::{CoordinationSettings, SettingsError};
use mallcoord_locking::{AdvancedLockManager, LockTemplate, SimpleLock};
use mallcoord_store::AtomicScriptRunner;
use mallcoord_throttling::SlidingWindowLimiter;
use std::sync::Arc;

/// Every coordination service wired to one shared script runner.
///
/// Cloning is cheap; clones share the runner, the watchdog registry and the
/// limiter's local cache.
///
/// # Examples
///
/// ```
/// use mallcoord::Coordinator;
/// use mallcoord::conf::CoordinationSettings;
/// use mallcoord::store::MemoryScriptRunner;
/// use std::sync::Arc;
///
/// let coordinator = Coordinator::with_runner(
///     Arc::new(MemoryScriptRunner::new()),
///     &CoordinationSettings::default(),
/// )
/// .unwrap();
/// assert_eq!(coordinator.simple_lock().full_key("order:42"), "mallcoord:lock:order:42");
/// ```
#[derive(Clone)]
pub struct Coordinator {
	runner: Arc<dyn AtomicScriptRunner>,
	simple_lock: SimpleLock,
	template: LockTemplate,
	advanced: AdvancedLockManager,
	limiter: Arc<SlidingWindowLimiter>,
}

impl Coordinator {
	/// Build every service on top of `runner`.
	///
	/// # Errors
	///
	/// Returns [`SettingsError::ValidationError`] when `settings` are invalid.
	pub fn with_runner(
		runner: Arc<dyn AtomicScriptRunner>,
		settings: &CoordinationSettings,
	) -> Result<Self, SettingsError> {
		settings.validate()?;
		let simple_lock = SimpleLock::new(runner.clone(), settings.lock_config());
		let template = LockTemplate::new(simple_lock.clone());
		let advanced = AdvancedLockManager::new(runner.clone(), settings.advanced_lock_config());
		let limiter = SlidingWindowLimiter::new(
			runner.clone(),
			settings.rate_limit.rules.clone(),
			settings.limiter_config(),
		);
		Ok(Self {
			runner,
			simple_lock,
			template,
			advanced,
			limiter: Arc::new(limiter),
		})
	}

	/// Connect to the configured Redis server and build every service.
	///
	/// # Errors
	///
	/// Returns [`SettingsError::ValidationError`] for invalid settings and
	/// [`SettingsError::ConnectionError`] when Redis cannot be reached.
	#[cfg(feature = "redis-backend")]
	pub async fn connect(settings: &CoordinationSettings) -> Result<Self, SettingsError> {
		settings.validate()?;
		let runner = settings.redis.connect().await?;
		tracing::info!("Coordinator connected to coordination store");
		Self::with_runner(Arc::new(runner), settings)
	}

	pub fn runner(&self) -> &Arc<dyn AtomicScriptRunner> {
		&self.runner
	}

	pub fn simple_lock(&self) -> &SimpleLock {
		&self.simple_lock
	}

	pub fn template(&self) -> &LockTemplate {
		&self.template
	}

	pub fn advanced(&self) -> &AdvancedLockManager {
		&self.advanced
	}

	pub fn limiter(&self) -> &SlidingWindowLimiter {
		&self.limiter
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use mallcoord_locking::CoordinatedLock;
	use mallcoord_store::MemoryScriptRunner;
	use rstest::rstest;
	use std::time::Duration;

	fn settings() -> CoordinationSettings {
		CoordinationSettings::default().with_overrides(|name| {
			(name == mallcoord_conf::KEY_PREFIX_ENV).then(|| "shop:".to_string())
		})
	}

	#[rstest]
	#[tokio::test]
	async fn test_services_share_one_store() {
		// Arrange
		let runner = MemoryScriptRunner::new();
		let coordinator = Coordinator::with_runner(Arc::new(runner.clone()), &settings()).unwrap();
		let owner = coordinator.advanced().owner("worker");

		// Act
		let handle = coordinator
			.simple_lock()
			.try_acquire("order:42", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();
		coordinator
			.advanced()
			.reentrant("order:42", &owner)
			.acquire(Duration::ZERO, Some(Duration::from_secs(10)))
			.await
			.unwrap();
		let decision = coordinator
			.limiter()
			.check("/api/auth/login", "203.0.113.9")
			.await
			.unwrap();

		// Assert
		assert_eq!(handle.full_key(), "shop:lock:order:42");
		assert!(runner.contains_key("shop:lock:order:42"));
		assert!(runner.contains_key("shop:rlock:order:42"));
		assert!(runner.contains_key("shop:rate:login:203.0.113.9"));
		assert!(decision.allowed);
	}

	#[rstest]
	#[tokio::test]
	async fn test_template_uses_shared_lock() {
		// Arrange
		let coordinator =
			Coordinator::with_runner(Arc::new(MemoryScriptRunner::new()), &settings()).unwrap();
		let clone = coordinator.clone();
		let _held = coordinator
			.simple_lock()
			.try_acquire("sku:1", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();

		// Act
		let result = clone
			.template()
			.try_execute("sku:1", Duration::from_secs(10), Duration::ZERO, || async {})
			.await;

		// Assert
		assert!(result.is_none());
	}

	#[rstest]
	fn test_invalid_settings_are_rejected() {
		// Arrange
		let mut settings = CoordinationSettings::default();
		settings.redis.url = "memcached://localhost".to_string();

		// Act
		let result = Coordinator::with_runner(Arc::new(MemoryScriptRunner::new()), &settings);

		// Assert
		assert!(matches!(result, Err(SettingsError::ValidationError(_))));
	}
}
