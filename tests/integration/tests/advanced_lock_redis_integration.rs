//! AdvancedLockManager against a real Redis server.

#![cfg(feature = "redis-backend")]

use mallcoord::locking::{
	AcquireFailure, AdvancedLockConfig, AdvancedLockManager, CoordinatedLock, LockError, LockKind,
};
use mallcoord_integration_tests::redis_fixture::RedisFixture;
use serial_test::serial;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const LEASE: Option<Duration> = Some(Duration::from_secs(10));

async fn manager(redis: &RedisFixture, config: AdvancedLockConfig) -> AdvancedLockManager {
	AdvancedLockManager::new(redis.runner().await, config)
}

fn config() -> AdvancedLockConfig {
	AdvancedLockConfig {
		instance_id: "node-a".to_string(),
		retry_interval: Duration::from_millis(20),
		..AdvancedLockConfig::default()
	}
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_reentrant_lock() {
	let redis = RedisFixture::start().await;
	let manager = manager(&redis, config()).await;
	let lock = manager.reentrant("order:1", &manager.owner("1"));
	let rival = manager.reentrant("order:1", &manager.owner("2"));

	lock.acquire(Duration::ZERO, LEASE).await.unwrap();
	lock.acquire(Duration::ZERO, LEASE).await.unwrap();
	let blocked = rival.acquire(Duration::from_millis(50), LEASE).await;
	assert!(matches!(
		blocked,
		Err(LockError::AcquisitionFailed {
			reason: AcquireFailure::Timeout,
			..
		})
	));

	assert!(lock.release().await);
	assert!(lock.is_held_by_current_owner().await);
	assert!(lock.release().await);
	assert!(rival.acquire(Duration::ZERO, LEASE).await.is_ok());
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_fair_lock_order() {
	let redis = RedisFixture::start().await;
	let manager = manager(&redis, config()).await;
	let holder = manager.fair("stock:1", &manager.owner("holder"));
	holder.acquire(Duration::ZERO, LEASE).await.unwrap();

	let order = Arc::new(Mutex::new(Vec::new()));
	let mut tasks = Vec::new();
	for name in ["b", "c", "d"] {
		let lock = manager.fair("stock:1", &manager.owner(name));
		let order = order.clone();
		tasks.push(tokio::spawn(async move {
			lock.acquire(Duration::from_secs(10), LEASE).await.unwrap();
			order.lock().unwrap().push(name);
			tokio::time::sleep(Duration::from_millis(30)).await;
			lock.release().await;
		}));
		tokio::time::sleep(Duration::from_millis(60)).await;
	}

	holder.release().await;
	for task in tasks {
		task.await.unwrap();
	}

	assert_eq!(*order.lock().unwrap(), vec!["b", "c", "d"]);
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_read_write_lock() {
	let redis = RedisFixture::start().await;
	let manager = manager(&redis, config()).await;
	let alice = manager.read_write("catalog", &manager.owner("alice"));
	let bob = manager.read_write("catalog", &manager.owner("bob"));

	alice.read().acquire(Duration::ZERO, LEASE).await.unwrap();
	bob.read().acquire(Duration::ZERO, LEASE).await.unwrap();
	assert!(bob.write().acquire(Duration::ZERO, LEASE).await.is_err());

	alice.read().release().await;
	bob.read().release().await;
	bob.write().acquire(Duration::ZERO, LEASE).await.unwrap();
	assert!(alice.read().acquire(Duration::ZERO, LEASE).await.is_err());

	bob.read().acquire(Duration::ZERO, LEASE).await.unwrap();
	bob.write().release().await;
	assert!(alice.read().acquire(Duration::ZERO, LEASE).await.is_ok());
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_watchdog_outlives_lease() {
	let redis = RedisFixture::start().await;
	let manager = manager(
		&redis,
		AdvancedLockConfig {
			watchdog_timeout: Duration::from_millis(600),
			..config()
		},
	)
	.await;
	let lock = manager.lock(LockKind::Reentrant, "job:nightly", &manager.owner("1"));
	let rival = manager.lock(LockKind::Reentrant, "job:nightly", &manager.owner("2"));

	lock.acquire(Duration::ZERO, None).await.unwrap();
	tokio::time::sleep(Duration::from_millis(1_500)).await;

	assert!(lock.is_held_by_current_owner().await);
	assert!(rival.acquire(Duration::ZERO, LEASE).await.is_err());
	assert!(lock.release().await);
	assert_eq!(manager.active_watchdogs(), 0);
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_execute_with_lock() {
	let redis = RedisFixture::start().await;
	let manager = manager(&redis, config()).await;
	let owner = manager.owner("worker");

	let value = manager
		.execute_with_lock(LockKind::Write, "order:9", &owner, Duration::ZERO, LEASE, || async { 7 })
		.await
		.unwrap();

	assert_eq!(value, 7);
	let probe = manager.lock(LockKind::Write, "order:9", &manager.owner("probe"));
	assert!(probe.acquire(Duration::ZERO, LEASE).await.is_ok());
}
