//! Single-owner lease lock
//!
//! `SET key token NX PX lease` to acquire, token-guarded scripts to release
//! and renew.
//!
//! Mutual exclusion holds only while the lease has not expired. No fencing
//! token is forwarded to protected resources, so a holder whose lease lapsed
//! mid-section can overlap with the next holder. Sections that cannot
//! tolerate that must make their writes idempotent or append-only.

use crate::config::{deadline_after, lease_millis};
use crate::{AcquireFailure, LockConfig, LockResult};
use chrono::{DateTime, Utc};
use mallcoord_store::{AtomicScript, AtomicScriptRunner, ScriptCall};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Proof of a successful acquisition.
///
/// Only the holder of the exact `owner_token` stored under `full_key` may
/// release or renew the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
	full_key: String,
	owner_token: String,
	lease: Duration,
	acquired_at: DateTime<Utc>,
}

impl LockHandle {
	pub fn full_key(&self) -> &str {
		&self.full_key
	}

	pub fn owner_token(&self) -> &str {
		&self.owner_token
	}

	/// Lease granted by the most recent acquire or renew
	pub fn lease(&self) -> Duration {
		self.lease
	}

	pub fn acquired_at(&self) -> DateTime<Utc> {
		self.acquired_at
	}
}

/// Distributed lock with a unique owner token per acquisition.
///
/// # Examples
///
/// ```
/// use mallcoord_locking::{LockConfig, SimpleLock};
/// use mallcoord_store::MemoryScriptRunner;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # async fn example() {
/// let lock = SimpleLock::new(Arc::new(MemoryScriptRunner::new()), LockConfig::default());
///
/// if let Some(handle) = lock
///     .try_acquire("order:42", Duration::from_secs(10), Duration::from_millis(200))
///     .await
/// {
///     // critical section
///     lock.release(&handle).await;
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct SimpleLock {
	runner: Arc<dyn AtomicScriptRunner>,
	config: Arc<LockConfig>,
}

impl SimpleLock {
	pub fn new(runner: Arc<dyn AtomicScriptRunner>, config: LockConfig) -> Self {
		Self {
			runner,
			config: Arc::new(config),
		}
	}

	pub fn config(&self) -> &LockConfig {
		&self.config
	}

	/// Namespace-prefixed store key for a business key
	pub fn full_key(&self, key: &str) -> String {
		format!("{}{}", self.config.key_prefix, key)
	}

	fn new_token(&self) -> String {
		format!("{}:{}", uuid::Uuid::new_v4(), self.config.instance_id)
	}

	/// Try to acquire `key`, polling until `max_wait` elapses.
	///
	/// Returns `None` on timeout or when the store is unavailable (fail-closed).
	pub async fn try_acquire(
		&self,
		key: &str,
		lease: Duration,
		max_wait: Duration,
	) -> Option<LockHandle> {
		self.acquire(key, lease, max_wait, None).await.ok()
	}

	/// Like [`SimpleLock::try_acquire`], but gives up as soon as `cancel` fires.
	pub async fn try_acquire_with_cancel(
		&self,
		key: &str,
		lease: Duration,
		max_wait: Duration,
		cancel: &CancellationToken,
	) -> Option<LockHandle> {
		self.acquire(key, lease, max_wait, Some(cancel)).await.ok()
	}

	pub(crate) async fn acquire(
		&self,
		key: &str,
		lease: Duration,
		max_wait: Duration,
		cancel: Option<&CancellationToken>,
	) -> Result<LockHandle, AcquireFailure> {
		let full_key = self.full_key(key);
		let token = self.new_token();
		let deadline = deadline_after(max_wait);
		let call = ScriptCall::new(AtomicScript::LockAcquire)
			.key(full_key.as_str())
			.arg(token.as_str())
			.arg(lease_millis(lease));

		loop {
			if cancel.is_some_and(CancellationToken::is_cancelled) {
				tracing::debug!(key = %full_key, "Lock wait interrupted");
				return Err(AcquireFailure::Interrupted);
			}

			let acquired = self
				.runner
				.run(&call)
				.await
				.and_then(|reply| reply.into_int(AtomicScript::LockAcquire));
			match acquired {
				Ok(1) => {
					tracing::debug!(key = %full_key, lease_ms = lease_millis(lease), "Lock acquired");
					return Ok(LockHandle {
						full_key,
						owner_token: token,
						lease,
						acquired_at: Utc::now(),
					});
				}
				Ok(_) => {}
				Err(e) => {
					tracing::error!(error = %e, key = %full_key, "Lock store unavailable; treating as not acquired");
					return Err(AcquireFailure::StoreUnavailable);
				}
			}

			let now = Instant::now();
			if now >= deadline {
				tracing::debug!(key = %full_key, wait_ms = max_wait.as_millis() as u64, "Lock wait timed out");
				return Err(AcquireFailure::Timeout);
			}
			let pause = self.config.retry_interval.min(deadline - now);
			match cancel {
				Some(token) => {
					tokio::select! {
						_ = token.cancelled() => {
							tracing::debug!(key = %full_key, "Lock wait interrupted");
							return Err(AcquireFailure::Interrupted);
						}
						_ = tokio::time::sleep(pause) => {}
					}
				}
				None => tokio::time::sleep(pause).await,
			}
		}
	}

	/// Release the lock if `handle` still owns it.
	///
	/// Returns `false` when the lease already expired or was reassigned. That
	/// race is expected under lease expiry and is logged as a warning only.
	pub async fn release(&self, handle: &LockHandle) -> bool {
		let call = ScriptCall::new(AtomicScript::LockRelease)
			.key(handle.full_key.as_str())
			.arg(handle.owner_token.as_str());
		match self
			.runner
			.run(&call)
			.await
			.and_then(|reply| reply.into_int(AtomicScript::LockRelease))
		{
			Ok(1) => {
				tracing::debug!(key = %handle.full_key, "Lock released");
				true
			}
			Ok(_) => {
				tracing::warn!(
					key = %handle.full_key,
					"Lock release skipped: lease expired or owned by another holder"
				);
				false
			}
			Err(e) => {
				tracing::error!(error = %e, key = %handle.full_key, "Lock release failed");
				false
			}
		}
	}

	/// Extend the lease to `new_lease` from now if `handle` still owns it.
	pub async fn renew(&self, handle: &mut LockHandle, new_lease: Duration) -> bool {
		let call = ScriptCall::new(AtomicScript::LockRenew)
			.key(handle.full_key.as_str())
			.arg(handle.owner_token.as_str())
			.arg(lease_millis(new_lease));
		match self
			.runner
			.run(&call)
			.await
			.and_then(|reply| reply.into_int(AtomicScript::LockRenew))
		{
			Ok(1) => {
				handle.lease = new_lease;
				tracing::debug!(key = %handle.full_key, lease_ms = lease_millis(new_lease), "Lock renewed");
				true
			}
			Ok(_) => {
				tracing::warn!(key = %handle.full_key, "Lock renewal rejected: not the current owner");
				false
			}
			Err(e) => {
				tracing::error!(error = %e, key = %handle.full_key, "Lock renewal failed");
				false
			}
		}
	}

	/// Whether `handle` still owns its key.
	///
	/// # Errors
	///
	/// Returns the store error when the store is unavailable.
	pub async fn is_held(&self, handle: &LockHandle) -> LockResult<bool> {
		let call = ScriptCall::new(AtomicScript::LockOwnedBy)
			.key(handle.full_key.as_str())
			.arg(handle.owner_token.as_str());
		let held = self
			.runner
			.run(&call)
			.await?
			.into_int(AtomicScript::LockOwnedBy)?;
		Ok(held == 1)
	}

	/// Whether anyone currently holds `key`.
	///
	/// # Errors
	///
	/// Returns the store error when the store is unavailable.
	pub async fn is_locked(&self, key: &str) -> LockResult<bool> {
		Ok(self.remaining_lease(key).await?.is_some())
	}

	/// Remaining lease on `key`, or `None` when it is free.
	///
	/// # Errors
	///
	/// Returns the store error when the store is unavailable.
	pub async fn remaining_lease(&self, key: &str) -> LockResult<Option<Duration>> {
		let call = ScriptCall::new(AtomicScript::KeyTtl).key(self.full_key(key));
		let ttl = self
			.runner
			.run(&call)
			.await?
			.into_int(AtomicScript::KeyTtl)?;
		Ok(match ttl {
			-2 => None,
			-1 => Some(Duration::MAX),
			millis => Some(Duration::from_millis(millis.unsigned_abs())),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use mallcoord_store::{MemoryScriptRunner, MockClock};
	use rstest::{fixture, rstest};
	use std::sync::atomic::{AtomicUsize, Ordering};

	#[fixture]
	fn clock() -> Arc<MockClock> {
		Arc::new(MockClock::new(1_700_000_000_000))
	}

	fn config() -> LockConfig {
		LockConfig {
			instance_id: "node-a".to_string(),
			retry_interval: Duration::from_millis(10),
			..LockConfig::default()
		}
	}

	fn lock_with(runner: MemoryScriptRunner<MockClock>) -> SimpleLock {
		SimpleLock::new(Arc::new(runner), config())
	}

	#[rstest]
	#[tokio::test]
	async fn test_acquire_sets_prefixed_key_with_lease(clock: Arc<MockClock>) {
		// Arrange
		let runner = MemoryScriptRunner::with_clock(clock);
		let lock = lock_with(runner.clone());

		// Act
		let handle = lock
			.try_acquire("order:42", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();

		// Assert
		assert_eq!(handle.full_key(), "mallcoord:lock:order:42");
		assert!(handle.owner_token().ends_with(":node-a"));
		assert_eq!(handle.lease(), Duration::from_secs(10));
		assert_eq!(runner.pttl("mallcoord:lock:order:42"), 10_000);
	}

	#[rstest]
	#[tokio::test]
	async fn test_second_caller_times_out_while_held(clock: Arc<MockClock>) {
		// Arrange
		let lock = lock_with(MemoryScriptRunner::with_clock(clock));
		let _held = lock
			.try_acquire("order:42", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();

		// Act
		let started = std::time::Instant::now();
		let second = lock
			.try_acquire("order:42", Duration::from_secs(10), Duration::from_millis(200))
			.await;

		// Assert
		assert!(second.is_none());
		assert!(started.elapsed() >= Duration::from_millis(200));
	}

	#[rstest]
	#[tokio::test]
	async fn test_waiter_acquires_after_release() {
		// Arrange
		let lock = SimpleLock::new(Arc::new(MemoryScriptRunner::new()), config());
		let first = lock
			.try_acquire("sku:7", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();
		let waiter = {
			let lock = lock.clone();
			tokio::spawn(async move {
				lock.try_acquire("sku:7", Duration::from_secs(10), Duration::from_secs(2))
					.await
			})
		};

		// Act
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert!(lock.release(&first).await);
		let second = waiter.await.unwrap();

		// Assert
		let second = second.expect("waiter should acquire after release");
		assert_ne!(second.owner_token(), first.owner_token());
	}

	#[rstest]
	#[tokio::test]
	async fn test_release_with_foreign_token_leaves_lock_intact(clock: Arc<MockClock>) {
		// Arrange
		let runner = MemoryScriptRunner::with_clock(clock);
		let lock = lock_with(runner.clone());
		let handle = lock
			.try_acquire("order:1", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();
		let mut forged = handle.clone();
		forged.owner_token = "someone-else".to_string();

		// Act
		let released = lock.release(&forged).await;
		let renewed = lock.renew(&mut forged, Duration::from_secs(60)).await;

		// Assert
		assert!(!released);
		assert!(!renewed);
		assert_eq!(forged.lease(), Duration::from_secs(10));
		assert_eq!(runner.pttl("mallcoord:lock:order:1"), 10_000);
		assert!(lock.is_held(&handle).await.unwrap());
	}

	#[rstest]
	#[tokio::test]
	async fn test_lock_is_reacquirable_after_lease_expiry(clock: Arc<MockClock>) {
		// Arrange
		let lock = lock_with(MemoryScriptRunner::with_clock(clock.clone()));
		let stale = lock
			.try_acquire("order:9", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();

		// Act
		clock.advance(Duration::from_secs(10));
		let fresh = lock
			.try_acquire("order:9", Duration::from_secs(10), Duration::ZERO)
			.await;

		// Assert
		assert!(fresh.is_some());
		assert!(!lock.release(&stale).await);
		assert!(lock.is_locked("order:9").await.unwrap());
	}

	#[rstest]
	#[tokio::test]
	async fn test_renew_extends_lease(clock: Arc<MockClock>) {
		// Arrange
		let lock = lock_with(MemoryScriptRunner::with_clock(clock.clone()));
		let mut handle = lock
			.try_acquire("cart:3", Duration::from_secs(5), Duration::ZERO)
			.await
			.unwrap();

		// Act
		clock.advance(Duration::from_secs(4));
		let renewed = lock.renew(&mut handle, Duration::from_secs(30)).await;
		clock.advance(Duration::from_secs(10));

		// Assert
		assert!(renewed);
		assert_eq!(handle.lease(), Duration::from_secs(30));
		assert_eq!(
			lock.remaining_lease("cart:3").await.unwrap(),
			Some(Duration::from_secs(20))
		);
	}

	#[rstest]
	#[tokio::test]
	async fn test_store_failure_is_fail_closed() {
		// Arrange
		let runner = MemoryScriptRunner::new();
		runner.set_unavailable(true);
		let lock = SimpleLock::new(Arc::new(runner), config());

		// Act
		let started = std::time::Instant::now();
		let handle = lock
			.try_acquire("order:42", Duration::from_secs(10), Duration::from_secs(5))
			.await;

		// Assert - gives up immediately instead of waiting out the budget
		assert!(handle.is_none());
		assert!(started.elapsed() < Duration::from_secs(1));
		assert!(lock.is_locked("order:42").await.is_err());
	}

	#[rstest]
	#[tokio::test]
	async fn test_cancellation_returns_not_acquired(clock: Arc<MockClock>) {
		// Arrange
		let lock = lock_with(MemoryScriptRunner::with_clock(clock));
		let _held = lock
			.try_acquire("order:42", Duration::from_secs(10), Duration::ZERO)
			.await
			.unwrap();
		let cancel = CancellationToken::new();
		let trigger = cancel.clone();
		tokio::spawn(async move {
			tokio::time::sleep(Duration::from_millis(30)).await;
			trigger.cancel();
		});

		// Act
		let started = std::time::Instant::now();
		let result = lock
			.acquire(
				"order:42",
				Duration::from_secs(10),
				Duration::from_secs(5),
				Some(&cancel),
			)
			.await;

		// Assert
		assert_eq!(result, Err(AcquireFailure::Interrupted));
		assert!(started.elapsed() < Duration::from_secs(5));
	}

	#[rstest]
	#[tokio::test]
	async fn test_unbounded_wait_is_accepted(clock: Arc<MockClock>) {
		// Arrange
		let lock = lock_with(MemoryScriptRunner::with_clock(clock));
		let cancel = CancellationToken::new();
		cancel.cancel();

		// Act
		let free = lock
			.try_acquire("order:1", Duration::from_secs(1), Duration::MAX)
			.await;
		let contended = lock
			.try_acquire_with_cancel("order:1", Duration::from_secs(1), Duration::MAX, &cancel)
			.await;

		// Assert
		assert!(free.is_some());
		assert!(contended.is_none());
	}

	#[rstest]
	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_concurrent_callers_exactly_one_wins() {
		// Arrange
		let lock = SimpleLock::new(Arc::new(MemoryScriptRunner::new()), config());
		let winners = Arc::new(AtomicUsize::new(0));

		// Act
		let tasks: Vec<_> = (0..8)
			.map(|_| {
				let lock = lock.clone();
				let winners = winners.clone();
				tokio::spawn(async move {
					if lock
						.try_acquire("order:42", Duration::from_secs(10), Duration::from_millis(200))
						.await
						.is_some()
					{
						winners.fetch_add(1, Ordering::SeqCst);
					}
				})
			})
			.collect();
		for task in tasks {
			task.await.unwrap();
		}

		// Assert
		assert_eq!(winners.load(Ordering::SeqCst), 1);
	}
}
