//! Run a critical section under a [`SimpleLock`] with guaranteed release.

use crate::{LockError, LockHandle, LockResult, SimpleLock};
use futures::FutureExt;
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Releases a held lock when dropped.
///
/// The happy path releases explicitly through [`ReleaseGuard::release`]. The
/// drop path only runs when the surrounding future is cancelled mid-section,
/// in which case the release is spawned onto the current runtime.
struct ReleaseGuard {
	lock: SimpleLock,
	handle: Option<LockHandle>,
}

impl ReleaseGuard {
	fn new(lock: SimpleLock, handle: LockHandle) -> Self {
		Self {
			lock,
			handle: Some(handle),
		}
	}

	async fn release(mut self) -> bool {
		match self.handle.take() {
			Some(handle) => self.lock.release(&handle).await,
			None => false,
		}
	}
}

impl Drop for ReleaseGuard {
	fn drop(&mut self) {
		let Some(handle) = self.handle.take() else {
			return;
		};
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				let lock = self.lock.clone();
				runtime.spawn(async move {
					lock.release(&handle).await;
				});
			}
			Err(_) => {
				tracing::warn!(
					key = %handle.full_key(),
					"No runtime to release abandoned lock; it will lapse with its lease"
				);
			}
		}
	}
}

/// Acquire, run, release.
///
/// The lock is released after the action completes, whether it returned a
/// value, returned an error value, or panicked. A panic is re-raised after
/// the release.
///
/// # Examples
///
/// ```
/// use mallcoord_locking::{LockConfig, LockTemplate, SimpleLock};
/// use mallcoord_store::MemoryScriptRunner;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let lock = SimpleLock::new(Arc::new(MemoryScriptRunner::new()), LockConfig::default());
/// let template = LockTemplate::new(lock);
///
/// let stock = template
///     .execute("sku:7", Duration::from_secs(10), Duration::from_millis(200), || async {
///         41 + 1
///     })
///     .await
///     .unwrap();
/// assert_eq!(stock, 42);
/// # });
/// ```
#[derive(Clone)]
pub struct LockTemplate {
	lock: SimpleLock,
}

impl LockTemplate {
	pub fn new(lock: SimpleLock) -> Self {
		Self { lock }
	}

	pub fn lock(&self) -> &SimpleLock {
		&self.lock
	}

	/// Run `action` while holding `key`.
	///
	/// # Errors
	///
	/// Returns [`LockError::AcquisitionFailed`] without running `action` when
	/// the lock cannot be acquired within `max_wait` or the store is
	/// unavailable.
	pub async fn execute<T, F, Fut>(
		&self,
		key: &str,
		lease: Duration,
		max_wait: Duration,
		action: F,
	) -> LockResult<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let handle = self
			.lock
			.acquire(key, lease, max_wait, None)
			.await
			.map_err(|reason| {
				tracing::warn!(key, %reason, "Critical section skipped");
				LockError::acquisition(key, reason)
			})?;

		let started = Instant::now();
		let guard = ReleaseGuard::new(self.lock.clone(), handle);
		let outcome = AssertUnwindSafe(async move { action().await })
			.catch_unwind()
			.await;
		guard.release().await;
		tracing::debug!(
			key,
			elapsed_ms = started.elapsed().as_millis() as u64,
			panicked = outcome.is_err(),
			"Critical section finished"
		);

		match outcome {
			Ok(value) => Ok(value),
			Err(payload) => panic::resume_unwind(payload),
		}
	}

	/// Like [`LockTemplate::execute`], collapsing acquisition failure to `None`.
	pub async fn try_execute<T, F, Fut>(
		&self,
		key: &str,
		lease: Duration,
		max_wait: Duration,
		action: F,
	) -> Option<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		self.execute(key, lease, max_wait, action).await.ok()
	}

	/// [`LockTemplate::execute`] with the configured default lease and wait.
	///
	/// # Errors
	///
	/// See [`LockTemplate::execute`].
	pub async fn execute_with_defaults<T, F, Fut>(&self, key: &str, action: F) -> LockResult<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let config = self.lock.config();
		let (lease, wait) = (config.default_lease, config.default_wait);
		self.execute(key, lease, wait, action).await
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{AcquireFailure, LockConfig};
	use mallcoord_store::MemoryScriptRunner;
	use rstest::rstest;
	use std::sync::Arc;
	use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

	const LEASE: Duration = Duration::from_secs(10);

	fn template() -> LockTemplate {
		let config = LockConfig {
			retry_interval: Duration::from_millis(5),
			..LockConfig::default()
		};
		LockTemplate::new(SimpleLock::new(Arc::new(MemoryScriptRunner::new()), config))
	}

	#[rstest]
	#[tokio::test]
	async fn test_releases_after_success() {
		// Arrange
		let template = template();

		// Act
		let result = template
			.execute("order:1", LEASE, Duration::ZERO, || async { "done" })
			.await
			.unwrap();

		// Assert
		assert_eq!(result, "done");
		assert!(!template.lock().is_locked("order:1").await.unwrap());
	}

	#[rstest]
	#[tokio::test]
	async fn test_releases_after_error_value() {
		// Arrange
		let template = template();

		// Act
		let result: Result<(), String> = template
			.execute("order:2", LEASE, Duration::ZERO, || async {
				Err("payment declined".to_string())
			})
			.await
			.unwrap();

		// Assert
		assert_eq!(result, Err("payment declined".to_string()));
		assert!(!template.lock().is_locked("order:2").await.unwrap());
	}

	#[rstest]
	#[tokio::test]
	async fn test_releases_after_panic_and_repanics() {
		// Arrange
		let template = template();

		// Act
		let outcome: Result<LockResult<()>, _> = AssertUnwindSafe(template.execute(
			"order:3",
			LEASE,
			Duration::ZERO,
			|| async { panic!("inventory underflow") },
		))
		.catch_unwind()
		.await;

		// Assert
		let payload = outcome.unwrap_err();
		assert_eq!(payload.downcast_ref::<&str>(), Some(&"inventory underflow"));
		assert!(!template.lock().is_locked("order:3").await.unwrap());
	}

	#[rstest]
	#[tokio::test]
	async fn test_action_not_run_when_lock_is_held() {
		// Arrange
		let template = template();
		let _held = template
			.lock()
			.try_acquire("order:4", LEASE, Duration::ZERO)
			.await
			.unwrap();
		let ran = AtomicBool::new(false);
		let flag = &ran;

		// Act
		let result = template
			.execute("order:4", LEASE, Duration::from_millis(30), move || async move {
				flag.store(true, Ordering::SeqCst);
			})
			.await;

		// Assert
		assert!(matches!(
			result,
			Err(LockError::AcquisitionFailed {
				reason: AcquireFailure::Timeout,
				..
			})
		));
		assert!(!ran.load(Ordering::SeqCst));
	}

	#[rstest]
	#[tokio::test]
	async fn test_unavailable_store_skips_action() {
		// Arrange
		let runner = MemoryScriptRunner::new();
		runner.set_unavailable(true);
		let template = LockTemplate::new(SimpleLock::new(Arc::new(runner), LockConfig::default()));

		// Act
		let result = template
			.try_execute("order:5", LEASE, Duration::from_secs(1), || async { 1 })
			.await;

		// Assert
		assert_eq!(result, None);
	}

	#[rstest]
	#[tokio::test]
	async fn test_cancelled_section_releases_in_background() {
		// Arrange
		let template = template();

		// Act
		let cancelled = tokio::time::timeout(
			Duration::from_millis(20),
			template.execute("order:6", LEASE, Duration::ZERO, || {
				tokio::time::sleep(Duration::from_secs(60))
			}),
		)
		.await;
		tokio::time::sleep(Duration::from_millis(20)).await;

		// Assert
		assert!(cancelled.is_err());
		assert!(!template.lock().is_locked("order:6").await.unwrap());
	}

	#[rstest]
	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_sections_never_overlap() {
		// Arrange
		let template = template();
		let inside = Arc::new(AtomicUsize::new(0));
		let overlaps = Arc::new(AtomicUsize::new(0));
		let completed = Arc::new(AtomicUsize::new(0));

		// Act
		let tasks: Vec<_> = (0..10)
			.map(|_| {
				let template = template.clone();
				let inside = inside.clone();
				let overlaps = overlaps.clone();
				let completed = completed.clone();
				tokio::spawn(async move {
					template
						.execute("sku:stock", LEASE, Duration::from_secs(10), move || async move {
							if inside.fetch_add(1, Ordering::SeqCst) > 0 {
								overlaps.fetch_add(1, Ordering::SeqCst);
							}
							tokio::time::sleep(Duration::from_millis(5)).await;
							inside.fetch_sub(1, Ordering::SeqCst);
							completed.fetch_add(1, Ordering::SeqCst);
						})
						.await
				})
			})
			.collect();
		for task in tasks {
			task.await.unwrap().unwrap();
		}

		// Assert
		assert_eq!(overlaps.load(Ordering::SeqCst), 0);
		assert_eq!(completed.load(Ordering::SeqCst), 10);
	}
}
