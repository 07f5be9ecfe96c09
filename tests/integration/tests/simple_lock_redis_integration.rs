//! SimpleLock and LockTemplate against a real Redis server.

#![cfg(feature = "redis-backend")]

use mallcoord::locking::{LockConfig, LockError, LockTemplate, SimpleLock};
use mallcoord_integration_tests::redis_fixture::RedisFixture;
use serial_test::serial;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

fn config(instance: &str) -> LockConfig {
	LockConfig {
		instance_id: instance.to_string(),
		..LockConfig::default()
	}
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_lock_acquire_and_release() {
	let redis = RedisFixture::start().await;
	let lock = SimpleLock::new(redis.runner().await, config("node-a"));

	let handle = lock
		.try_acquire("order:1", Duration::from_secs(10), Duration::ZERO)
		.await
		.expect("lock should be free");

	assert!(lock.is_locked("order:1").await.unwrap());
	let remaining = lock.remaining_lease("order:1").await.unwrap().unwrap();
	assert!(remaining > Duration::from_secs(9));
	assert!(lock.release(&handle).await);
	assert!(!lock.is_locked("order:1").await.unwrap());
	assert!(!lock.release(&handle).await);
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_lock_two_nodes_one_winner() {
	let redis = RedisFixture::start().await;
	let node_a = SimpleLock::new(redis.runner().await, config("node-a"));
	let node_b = SimpleLock::new(redis.runner().await, config("node-b"));

	let (a, b) = tokio::join!(
		node_a.try_acquire("order:42", Duration::from_secs(10), Duration::from_millis(200)),
		node_b.try_acquire("order:42", Duration::from_secs(10), Duration::from_millis(200)),
	);

	assert!(a.is_some() ^ b.is_some());
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_lock_foreign_token_cannot_release() {
	let redis = RedisFixture::start().await;
	let node_a = SimpleLock::new(redis.runner().await, config("node-a"));
	let node_b = SimpleLock::new(redis.runner().await, config("node-b"));
	let handle = node_a
		.try_acquire("order:2", Duration::from_secs(10), Duration::ZERO)
		.await
		.unwrap();
	let stale = node_b
		.try_acquire("order:3", Duration::from_secs(10), Duration::ZERO)
		.await
		.unwrap();
	node_b.release(&stale).await;

	let mut replayed = node_b
		.try_acquire("order:3", Duration::from_secs(10), Duration::ZERO)
		.await
		.unwrap();
	assert!(node_b.renew(&mut replayed, Duration::from_secs(20)).await);
	assert!(!node_b.release(&stale).await);
	assert!(node_a.is_held(&handle).await.unwrap());
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_lock_lapses_after_lease() {
	let redis = RedisFixture::start().await;
	let lock = SimpleLock::new(redis.runner().await, config("node-a"));
	let abandoned = lock
		.try_acquire("order:4", Duration::from_millis(300), Duration::ZERO)
		.await
		.unwrap();

	let successor = lock
		.try_acquire("order:4", Duration::from_secs(10), Duration::from_secs(2))
		.await;

	assert!(successor.is_some());
	assert!(!lock.release(&abandoned).await);
}

#[tokio::test]
#[serial(redis_lock)]
async fn test_redis_template_releases_on_error_and_excludes() {
	let redis = RedisFixture::start().await;
	let runner = redis.runner().await;
	let template = LockTemplate::new(SimpleLock::new(runner, config("node-a")));
	let inside = Arc::new(AtomicUsize::new(0));
	let overlaps = Arc::new(AtomicUsize::new(0));

	let failed: Result<(), &str> = template
		.execute("stock:9", Duration::from_secs(10), Duration::ZERO, || async {
			Err("rejected")
		})
		.await
		.unwrap();
	assert!(failed.is_err());
	assert!(!template.lock().is_locked("stock:9").await.unwrap());

	let tasks: Vec<_> = (0..5)
		.map(|_| {
			let template = template.clone();
			let inside = inside.clone();
			let overlaps = overlaps.clone();
			tokio::spawn(async move {
				template
					.execute("stock:9", Duration::from_secs(10), Duration::from_secs(10), move || async move {
						if inside.fetch_add(1, Ordering::SeqCst) > 0 {
							overlaps.fetch_add(1, Ordering::SeqCst);
						}
						tokio::time::sleep(Duration::from_millis(20)).await;
						inside.fetch_sub(1, Ordering::SeqCst);
					})
					.await
			})
		})
		.collect();
	for task in tasks {
		let outcome: Result<(), LockError> = task.await.unwrap();
		outcome.unwrap();
	}
	assert_eq!(overlaps.load(Ordering::SeqCst), 0);
}
