//! SlidingWindowLimiter against a real Redis server.

#![cfg(feature = "redis-backend")]

use mallcoord::throttling::{
	DecisionSource, LimiterConfig, RateLimitRule, RuleTable, SlidingWindowLimiter,
};
use mallcoord_integration_tests::redis_fixture::RedisFixture;
use serial_test::serial;
use std::time::Duration;

fn rules() -> RuleTable {
	RuleTable::new(RateLimitRule::new("default", 100, 60))
		.bind("/login", RateLimitRule::new("login", 3, 1))
}

#[tokio::test]
#[serial(redis_rate)]
async fn test_redis_window_admits_denies_and_recovers() {
	let redis = RedisFixture::start().await;
	let limiter = SlidingWindowLimiter::new(redis.runner().await, rules(), LimiterConfig::default());

	let mut remaining = Vec::new();
	for _ in 0..3 {
		let decision = limiter.check("/login", "203.0.113.9").await.unwrap();
		assert!(decision.allowed);
		remaining.push(decision.remaining);
	}
	let denied = limiter.check("/login", "203.0.113.9").await.unwrap();
	tokio::time::sleep(Duration::from_millis(1_100)).await;
	let recovered = limiter.check("/login", "203.0.113.9").await.unwrap();

	assert_eq!(remaining, vec![2, 1, 0]);
	assert!(!denied.allowed);
	assert_eq!(denied.source, DecisionSource::Store);
	assert!(recovered.allowed);
	assert_eq!(recovered.source, DecisionSource::Store);
}

#[tokio::test]
#[serial(redis_rate)]
async fn test_redis_window_is_shared_between_instances() {
	let redis = RedisFixture::start().await;
	let node_a = SlidingWindowLimiter::new(redis.runner().await, rules(), LimiterConfig::default());
	let node_b = SlidingWindowLimiter::new(redis.runner().await, rules(), LimiterConfig::default());

	assert!(node_a.check("/login", "bot").await.unwrap().allowed);
	assert!(node_b.check("/login", "bot").await.unwrap().allowed);
	assert!(node_a.check("/login", "bot").await.unwrap().allowed);
	let denied = node_b.check("/login", "bot").await.unwrap();

	assert!(!denied.allowed);
	assert_eq!(node_b.check("/login", "bot").await.unwrap().source, DecisionSource::LocalCache);
}

#[tokio::test]
#[serial(redis_rate)]
async fn test_redis_reset_reopens_window() {
	let redis = RedisFixture::start().await;
	let limiter = SlidingWindowLimiter::new(redis.runner().await, rules(), LimiterConfig::default());
	for _ in 0..4 {
		limiter.check("/login", "user:1").await.unwrap();
	}

	limiter.reset("/login", "user:1").await.unwrap();

	let decision = limiter.check("/login", "user:1").await.unwrap();
	assert!(decision.allowed);
	assert_eq!(decision.remaining, 2);
}
