//! Reentrant, fair and read/write locks with watchdog lease renewal.
//!
//! All flavors store holds in a hash of `owner -> hold count`, so the same
//! [`LockOwner`] may re-acquire without blocking itself. The flavor is picked
//! with [`LockKind`] and every flavor exposes the same [`CoordinatedLock`]
//! contract.
//!
//! Store layout for a business key `k` under prefix `p`:
//!
//! | Kind | Keys |
//! |------|------|
//! | `Reentrant` | `p k` (hash) |
//! | `Fair` | `p k` (hash), `p k:queue` (list), `p k:timeouts` (sorted set) |
//! | `Read` / `Write` | `p k:rw` (hash with a `mode` field) |
//!
//! Read and write holds are stored under `read:{owner}` and `write:{owner}`
//! fields, so no session name can stand in for another owner's writer.

use crate::config::{deadline_after, lease_millis};
use crate::watchdog::Watchdog;
use crate::{AcquireFailure, AdvancedLockConfig, LockError, LockOwner, LockResult};
use async_trait::async_trait;
use futures::FutureExt;
use mallcoord_store::{AtomicScript, AtomicScriptRunner, Clock, ScriptCall, SystemClock};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Lock flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockKind {
	/// Exclusive, reentrant per owner.
	Reentrant,
	/// Exclusive, reentrant, granted to waiters in arrival order.
	Fair,
	/// Shared with other readers; excluded by a writer of another owner.
	Read,
	/// Exclusive against readers and writers of other owners.
	Write,
}

impl LockKind {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Reentrant => "reentrant",
			Self::Fair => "fair",
			Self::Read => "read",
			Self::Write => "write",
		}
	}
}

/// Acquire/release/renew contract shared by every lock flavor.
#[async_trait]
pub trait CoordinatedLock: Send + Sync {
	/// Wait up to `wait` for the lock.
	///
	/// With `lease = None` the lock is held for the configured watchdog
	/// timeout and renewed in the background until fully released.
	async fn acquire(&self, wait: Duration, lease: Option<Duration>) -> LockResult<()>;

	/// Drop one hold. Returns `false` when the owner held nothing.
	async fn release(&self) -> bool;

	/// Reset the lease to `lease` from now. Returns `false` when not held.
	async fn renew(&self, lease: Duration) -> bool;

	async fn is_held_by_current_owner(&self) -> bool;
}

/// One lock flavor on one business key, bound to one owner.
#[derive(Clone)]
pub struct ManagedLock {
	kind: LockKind,
	key: String,
	owner: LockOwner,
	runner: Arc<dyn AtomicScriptRunner>,
	config: Arc<AdvancedLockConfig>,
	watchdog: Watchdog,
	clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for ManagedLock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ManagedLock")
			.field("kind", &self.kind)
			.field("key", &self.key)
			.field("owner", &self.owner)
			.finish_non_exhaustive()
	}
}

impl ManagedLock {
	pub fn kind(&self) -> LockKind {
		self.kind
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	pub fn owner(&self) -> &LockOwner {
		&self.owner
	}

	/// Hash key holding this lock's owners
	pub fn store_key(&self) -> String {
		match self.kind {
			LockKind::Reentrant | LockKind::Fair => {
				format!("{}{}", self.config.key_prefix, self.key)
			}
			LockKind::Read | LockKind::Write => {
				format!("{}{}:rw", self.config.key_prefix, self.key)
			}
		}
	}

	fn queue_keys(&self) -> (String, String) {
		let base = format!("{}{}", self.config.key_prefix, self.key);
		(format!("{base}:queue"), format!("{base}:timeouts"))
	}

	fn writer_field(&self) -> String {
		format!("write:{}", self.owner.id())
	}

	fn field(&self) -> String {
		match self.kind {
			LockKind::Read => format!("read:{}", self.owner.id()),
			LockKind::Write => self.writer_field(),
			LockKind::Reentrant | LockKind::Fair => self.owner.id(),
		}
	}

	/// Readers share one key-wide lease, so their renewal may only extend it.
	fn renew_script(&self) -> AtomicScript {
		match self.kind {
			LockKind::Read => AtomicScript::ReadRenew,
			LockKind::Reentrant | LockKind::Fair | LockKind::Write => AtomicScript::HashRenew,
		}
	}

	fn stop_watchdog(&self) {
		self.watchdog.stop(&self.store_key(), &self.field());
	}

	/// Release only while the owner still holds the lock.
	async fn release_if_held(&self) -> bool {
		if self.is_held_by_current_owner().await {
			return self.release().await;
		}
		self.stop_watchdog();
		tracing::warn!(
			key = %self.key,
			owner = %self.owner,
			"Lock no longer held by owner after critical section; release skipped"
		);
		false
	}

	fn acquire_call(&self, lease_ms: i64) -> ScriptCall {
		let store_key = self.store_key();
		match self.kind {
			LockKind::Reentrant => ScriptCall::new(AtomicScript::HashAcquire)
				.key(store_key)
				.arg(lease_ms)
				.arg(self.field()),
			LockKind::Fair => {
				let (queue, timeouts) = self.queue_keys();
				ScriptCall::new(AtomicScript::FairAcquire)
					.key(store_key)
					.key(queue)
					.key(timeouts)
					.arg(lease_ms)
					.arg(self.field())
					.arg(lease_millis(self.config.fair_waiter_timeout))
					.arg(self.clock.now_millis())
			}
			LockKind::Read => ScriptCall::new(AtomicScript::ReadAcquire)
				.key(store_key)
				.arg(lease_ms)
				.arg(self.field())
				.arg(self.writer_field()),
			LockKind::Write => ScriptCall::new(AtomicScript::WriteAcquire)
				.key(store_key)
				.arg(lease_ms)
				.arg(self.field()),
		}
	}

	/// Leave the fair queue after giving up.
	async fn abandon_queue(&self) {
		if self.kind != LockKind::Fair {
			return;
		}
		let (queue, timeouts) = self.queue_keys();
		let call = ScriptCall::new(AtomicScript::FairCancel)
			.key(queue)
			.key(timeouts)
			.arg(self.field());
		if let Err(e) = self.runner.run(&call).await {
			tracing::warn!(error = %e, key = %self.key, "Could not leave fair lock queue; entry will lapse");
		}
	}

	fn failed(&self, reason: AcquireFailure) -> LockError {
		LockError::acquisition(&self.key, reason)
	}

	/// Like [`CoordinatedLock::acquire`], but gives up as soon as `cancel`
	/// fires with [`AcquireFailure::Interrupted`].
	///
	/// # Errors
	///
	/// Returns [`LockError::AcquisitionFailed`] on timeout, interruption or an
	/// unavailable store.
	pub async fn acquire_with_cancel(
		&self,
		wait: Duration,
		lease: Option<Duration>,
		cancel: &CancellationToken,
	) -> LockResult<()> {
		self.acquire_until(wait, lease, Some(cancel)).await
	}

	async fn acquire_until(
		&self,
		wait: Duration,
		lease: Option<Duration>,
		cancel: Option<&CancellationToken>,
	) -> LockResult<()> {
		let effective = lease.unwrap_or(self.config.watchdog_timeout);
		let lease_ms = lease_millis(effective);
		let script = self.acquire_call(lease_ms).script();
		let deadline = deadline_after(wait);

		loop {
			if cancel.is_some_and(CancellationToken::is_cancelled) {
				self.abandon_queue().await;
				return Err(self.failed(AcquireFailure::Interrupted));
			}

			let attempt = self
				.runner
				.run(&self.acquire_call(lease_ms))
				.await
				.and_then(|reply| reply.into_opt_int(script));
			match attempt {
				Ok(None) => {
					if lease.is_none() {
						self.watchdog.start(
							self.runner.clone(),
							self.renew_script(),
							&self.store_key(),
							&self.field(),
							effective,
						);
					}
					tracing::debug!(
						key = %self.key,
						kind = self.kind.as_str(),
						owner = %self.owner,
						lease_ms,
						watchdog = lease.is_none(),
						"Lock acquired"
					);
					return Ok(());
				}
				Ok(Some(_)) => {}
				Err(e) => {
					tracing::error!(error = %e, key = %self.key, kind = self.kind.as_str(), "Lock store unavailable; treating as not acquired");
					self.abandon_queue().await;
					return Err(self.failed(AcquireFailure::StoreUnavailable));
				}
			}

			let now = Instant::now();
			if now >= deadline {
				tracing::debug!(key = %self.key, kind = self.kind.as_str(), "Lock wait timed out");
				self.abandon_queue().await;
				return Err(self.failed(AcquireFailure::Timeout));
			}
			let pause = self.config.retry_interval.min(deadline - now);
			match cancel {
				Some(token) => {
					tokio::select! {
						_ = token.cancelled() => {
							tracing::debug!(key = %self.key, "Lock wait interrupted");
							self.abandon_queue().await;
							return Err(self.failed(AcquireFailure::Interrupted));
						}
						_ = tokio::time::sleep(pause) => {}
					}
				}
				None => tokio::time::sleep(pause).await,
			}
		}
	}

	/// Whether a watchdog is currently renewing this lock
	pub fn has_watchdog(&self) -> bool {
		self.watchdog.is_active(&self.store_key(), &self.field())
	}
}

#[async_trait]
impl CoordinatedLock for ManagedLock {
	async fn acquire(&self, wait: Duration, lease: Option<Duration>) -> LockResult<()> {
		self.acquire_until(wait, lease, None).await
	}

	async fn release(&self) -> bool {
		let store_key = self.store_key();
		let field = self.field();
		let (script, call) = match self.kind {
			LockKind::Reentrant | LockKind::Fair => (
				AtomicScript::HashRelease,
				ScriptCall::new(AtomicScript::HashRelease)
					.key(store_key.as_str())
					.arg(field.as_str()),
			),
			LockKind::Read | LockKind::Write => (
				AtomicScript::ReadWriteRelease,
				ScriptCall::new(AtomicScript::ReadWriteRelease)
					.key(store_key.as_str())
					.arg(field.as_str())
					.arg(self.kind.as_str()),
			),
		};
		match self
			.runner
			.run(&call)
			.await
			.and_then(|reply| reply.into_opt_int(script))
		{
			Ok(Some(0)) => {
				tracing::debug!(key = %self.key, owner = %self.owner, "Reentrant hold released");
				true
			}
			Ok(Some(_)) => {
				self.watchdog.stop(&store_key, &field);
				tracing::debug!(key = %self.key, kind = self.kind.as_str(), "Lock released");
				true
			}
			Ok(None) => {
				self.watchdog.stop(&store_key, &field);
				tracing::warn!(
					key = %self.key,
					owner = %self.owner,
					"Lock release skipped: not held by this owner"
				);
				false
			}
			Err(e) => {
				self.watchdog.stop(&store_key, &field);
				tracing::error!(error = %e, key = %self.key, "Lock release failed; lock will lapse with its lease");
				false
			}
		}
	}

	async fn renew(&self, lease: Duration) -> bool {
		let script = self.renew_script();
		let call = ScriptCall::new(script)
			.key(self.store_key())
			.arg(lease_millis(lease))
			.arg(self.field());
		match self
			.runner
			.run(&call)
			.await
			.and_then(|reply| reply.into_int(script))
		{
			Ok(1) => true,
			Ok(_) => {
				tracing::warn!(key = %self.key, owner = %self.owner, "Lock renewal rejected: not held");
				false
			}
			Err(e) => {
				tracing::error!(error = %e, key = %self.key, "Lock renewal failed");
				false
			}
		}
	}

	async fn is_held_by_current_owner(&self) -> bool {
		let call = ScriptCall::new(AtomicScript::HashFieldHeld)
			.key(self.store_key())
			.arg(self.field());
		match self
			.runner
			.run(&call)
			.await
			.and_then(|reply| reply.into_int(AtomicScript::HashFieldHeld))
		{
			Ok(held) => held == 1,
			Err(e) => {
				tracing::error!(error = %e, key = %self.key, "Lock ownership check failed");
				false
			}
		}
	}
}

/// Gives up a hold taken by [`AdvancedLockManager::execute_with_lock`].
///
/// Dropped without [`HoldGuard::finish`] only when the enclosing future is
/// cancelled mid-section; the ownership-checked release is then spawned.
struct HoldGuard {
	lock: Option<ManagedLock>,
}

impl HoldGuard {
	async fn finish(mut self) {
		if let Some(lock) = self.lock.take() {
			lock.release_if_held().await;
		}
	}
}

impl Drop for HoldGuard {
	fn drop(&mut self) {
		let Some(lock) = self.lock.take() else {
			return;
		};
		match tokio::runtime::Handle::try_current() {
			Ok(runtime) => {
				runtime.spawn(async move {
					lock.release_if_held().await;
				});
			}
			Err(_) => {
				lock.stop_watchdog();
				tracing::warn!(
					key = %lock.key,
					"No runtime to release abandoned lock; it will lapse with its lease"
				);
			}
		}
	}
}

/// Read and write views of one read/write lock.
///
/// Both views share one store key, so exclusion between them is enforced by
/// the store rather than by the caller.
#[derive(Debug, Clone)]
pub struct ReadWriteLock {
	read: ManagedLock,
	write: ManagedLock,
}

impl ReadWriteLock {
	pub fn read(&self) -> &ManagedLock {
		&self.read
	}

	pub fn write(&self) -> &ManagedLock {
		&self.write
	}
}

/// Factory for advanced locks sharing one runner and one watchdog registry.
///
/// # Examples
///
/// ```
/// use mallcoord_locking::{AdvancedLockConfig, AdvancedLockManager, CoordinatedLock, LockKind};
/// use mallcoord_store::MemoryScriptRunner;
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let manager = AdvancedLockManager::new(
///     Arc::new(MemoryScriptRunner::new()),
///     AdvancedLockConfig::default(),
/// );
/// let owner = manager.owner("checkout-worker");
/// let lock = manager.lock(LockKind::Reentrant, "order:42", &owner);
///
/// lock.acquire(Duration::from_millis(200), Some(Duration::from_secs(10))).await.unwrap();
/// lock.acquire(Duration::ZERO, Some(Duration::from_secs(10))).await.unwrap();
/// assert!(lock.release().await);
/// assert!(lock.is_held_by_current_owner().await);
/// assert!(lock.release().await);
/// # });
/// ```
#[derive(Clone)]
pub struct AdvancedLockManager {
	runner: Arc<dyn AtomicScriptRunner>,
	config: Arc<AdvancedLockConfig>,
	watchdog: Watchdog,
	clock: Arc<dyn Clock>,
}

impl AdvancedLockManager {
	pub fn new(runner: Arc<dyn AtomicScriptRunner>, config: AdvancedLockConfig) -> Self {
		Self::with_clock(runner, config, Arc::new(SystemClock::new()))
	}

	/// Use `clock` for fair-queue waiter deadlines.
	pub fn with_clock(
		runner: Arc<dyn AtomicScriptRunner>,
		config: AdvancedLockConfig,
		clock: Arc<dyn Clock>,
	) -> Self {
		Self {
			runner,
			config: Arc::new(config),
			watchdog: Watchdog::default(),
			clock,
		}
	}

	pub fn config(&self) -> &AdvancedLockConfig {
		&self.config
	}

	/// Owner for `session` on this instance
	pub fn owner(&self, session: impl Into<String>) -> LockOwner {
		LockOwner::new(self.config.instance_id.clone(), session)
	}

	pub fn lock(&self, kind: LockKind, key: &str, owner: &LockOwner) -> ManagedLock {
		ManagedLock {
			kind,
			key: key.to_string(),
			owner: owner.clone(),
			runner: self.runner.clone(),
			config: self.config.clone(),
			watchdog: self.watchdog.clone(),
			clock: self.clock.clone(),
		}
	}

	pub fn reentrant(&self, key: &str, owner: &LockOwner) -> ManagedLock {
		self.lock(LockKind::Reentrant, key, owner)
	}

	pub fn fair(&self, key: &str, owner: &LockOwner) -> ManagedLock {
		self.lock(LockKind::Fair, key, owner)
	}

	pub fn read_write(&self, key: &str, owner: &LockOwner) -> ReadWriteLock {
		ReadWriteLock {
			read: self.lock(LockKind::Read, key, owner),
			write: self.lock(LockKind::Write, key, owner),
		}
	}

	/// Acquire, run `action`, release.
	///
	/// The release only happens if the owner still holds the lock when the
	/// action finishes; a lease that lapsed unnoticed may already belong to
	/// someone else. Panics in `action` are re-raised after the release. If
	/// the returned future is dropped mid-section the release is spawned onto
	/// the current runtime.
	///
	/// # Errors
	///
	/// Returns [`LockError::AcquisitionFailed`] without running `action` when
	/// the lock cannot be acquired within `wait`.
	pub async fn execute_with_lock<T, F, Fut>(
		&self,
		kind: LockKind,
		key: &str,
		owner: &LockOwner,
		wait: Duration,
		lease: Option<Duration>,
		action: F,
	) -> LockResult<T>
	where
		F: FnOnce() -> Fut,
		Fut: Future<Output = T>,
	{
		let lock = self.lock(kind, key, owner);
		lock.acquire(wait, lease).await?;
		let guard = HoldGuard { lock: Some(lock) };

		let started = std::time::Instant::now();
		let outcome = AssertUnwindSafe(async move { action().await })
			.catch_unwind()
			.await;
		guard.finish().await;
		tracing::debug!(
			key,
			kind = kind.as_str(),
			elapsed_ms = started.elapsed().as_millis() as u64,
			"Critical section finished"
		);

		match outcome {
			Ok(value) => Ok(value),
			Err(payload) => panic::resume_unwind(payload),
		}
	}

	/// Number of locks currently kept alive by a watchdog
	pub fn active_watchdogs(&self) -> usize {
		self.watchdog.active_count()
	}

	/// Stop every watchdog. Held locks then lapse with their last lease.
	pub fn shutdown(&self) {
		self.watchdog.shutdown();
	}
}
