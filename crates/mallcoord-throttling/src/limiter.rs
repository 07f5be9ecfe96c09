//! Sliding-window admission control.

use crate::key_validation::validate_client_key;
use crate::{NegativeCache, RateLimitRule, RuleTable, ThrottleError, ThrottleResult};
use mallcoord_store::{
	AtomicScript, AtomicScriptRunner, Clock, ScriptCall, ScriptReply, StoreError, StoreResult,
	SystemClock,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Where a decision came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
	/// The store evaluated and recorded the request.
	Store,
	/// A cached denial answered without a store round trip.
	LocalCache,
	/// The store failed and the request was admitted unchecked.
	FailOpen,
}

/// Outcome of one admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
	pub allowed: bool,
	/// Permits left in the current window after this request
	pub remaining: u32,
	/// Epoch milliseconds at which the oldest recorded request leaves the window
	pub reset_at_ms: u64,
	pub source: DecisionSource,
}

impl RateDecision {
	/// How long a denied caller should wait, measured from `now_ms`.
	pub fn retry_after(&self, now_ms: u64) -> Duration {
		if self.allowed {
			Duration::ZERO
		} else {
			Duration::from_millis(self.reset_at_ms.saturating_sub(now_ms))
		}
	}
}

/// Limiter settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimiterConfig {
	/// Namespace prepended to every window key
	pub key_prefix: String,
	/// Extra seconds a window key outlives its window in the store
	pub ttl_buffer_seconds: u64,
	/// Maximum cached denials; 0 disables the local fast path
	pub negative_cache_capacity: usize,
}

impl Default for LimiterConfig {
	fn default() -> Self {
		Self {
			key_prefix: "mallcoord:rate:".to_string(),
			ttl_buffer_seconds: 5,
			negative_cache_capacity: 10_000,
		}
	}
}

impl LimiterConfig {
	/// # Errors
	///
	/// Returns [`ThrottleError::InvalidConfig`] for an empty key prefix.
	pub fn validate(&self) -> ThrottleResult<()> {
		if self.key_prefix.is_empty() {
			return Err(ThrottleError::InvalidConfig(
				"key_prefix must not be empty".to_string(),
			));
		}
		Ok(())
	}
}

fn window_reply(reply: ScriptReply) -> StoreResult<(bool, i64, i64)> {
	const SCRIPT: AtomicScript = AtomicScript::SlidingWindow;
	let mut values = reply
		.into_list(SCRIPT)?
		.into_iter()
		.map(|value| value.into_int(SCRIPT));
	match (values.next(), values.next(), values.next()) {
		(Some(allowed), Some(remaining), Some(reset_at)) => Ok((allowed? == 1, remaining?, reset_at?)),
		_ => Err(StoreError::UnexpectedReply {
			script: SCRIPT.name(),
			reply: "window reply shorter than three values".to_string(),
		}),
	}
}

/// Sliding-window rate limiter shared by every instance through the store.
///
/// Each `(rule, client)` pair owns one sorted set of request timestamps.
/// A check atomically drops timestamps older than the window, counts the
/// rest, and records the request if a permit is left.
///
/// Store failures fail open: the request is admitted and the error logged.
///
/// # Examples
///
/// ```
/// use mallcoord_store::MemoryScriptRunner;
/// use mallcoord_throttling::{LimiterConfig, RuleTable, SlidingWindowLimiter};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let limiter = SlidingWindowLimiter::new(
///     Arc::new(MemoryScriptRunner::new()),
///     RuleTable::storefront(),
///     LimiterConfig::default(),
/// );
///
/// let decision = limiter.check("/api/auth/login", "203.0.113.9").await.unwrap();
/// assert!(decision.allowed);
/// assert_eq!(decision.remaining, 4);
/// # });
/// ```
pub struct SlidingWindowLimiter<C: Clock = SystemClock> {
	runner: Arc<dyn AtomicScriptRunner>,
	rules: Arc<RuleTable>,
	config: LimiterConfig,
	cache: NegativeCache,
	clock: Arc<C>,
}

impl SlidingWindowLimiter<SystemClock> {
	pub fn new(runner: Arc<dyn AtomicScriptRunner>, rules: RuleTable, config: LimiterConfig) -> Self {
		Self::with_clock(runner, rules, config, Arc::new(SystemClock::new()))
	}
}

impl<C: Clock> SlidingWindowLimiter<C> {
	pub fn with_clock(
		runner: Arc<dyn AtomicScriptRunner>,
		rules: RuleTable,
		config: LimiterConfig,
		clock: Arc<C>,
	) -> Self {
		let cache = NegativeCache::new(config.negative_cache_capacity);
		Self {
			runner,
			rules: Arc::new(rules),
			config,
			cache,
			clock,
		}
	}

	pub fn rules(&self) -> &RuleTable {
		&self.rules
	}

	pub fn config(&self) -> &LimiterConfig {
		&self.config
	}

	pub fn negative_cache(&self) -> &NegativeCache {
		&self.cache
	}

	/// Store key of the window for `rule` and `client`
	pub fn window_key(&self, rule: &RateLimitRule, client: &str) -> String {
		format!("{}{}:{}", self.config.key_prefix, rule.key, client)
	}

	/// Check and record one request on `route` from `client`.
	///
	/// # Errors
	///
	/// Returns [`ThrottleError::InvalidKey`] for a malformed client identity.
	/// Store failures are not errors; they produce a fail-open decision.
	pub async fn check(&self, route: &str, client: &str) -> ThrottleResult<RateDecision> {
		self.check_rule(self.rules.resolve(route), client).await
	}

	/// Check and record one request against an explicit rule.
	///
	/// # Errors
	///
	/// See [`SlidingWindowLimiter::check`].
	pub async fn check_rule(
		&self,
		rule: &RateLimitRule,
		client: &str,
	) -> ThrottleResult<RateDecision> {
		validate_client_key(client)?;
		let key = self.window_key(rule, client);
		let now = self.clock.now_millis();

		if let Some(reset_at_ms) = self.cache.denied_until(&key, now) {
			tracing::trace!(key = %key, reset_at_ms, "Denied from local cache");
			return Ok(RateDecision {
				allowed: false,
				remaining: 0,
				reset_at_ms,
				source: DecisionSource::LocalCache,
			});
		}

		let call = ScriptCall::new(AtomicScript::SlidingWindow)
			.key(key.as_str())
			.arg(now)
			.arg(rule.window_millis())
			.arg(rule.permits_per_window)
			.arg(rule.window_seconds.saturating_add(self.config.ttl_buffer_seconds))
			.arg(format!("{now}-{}", uuid::Uuid::new_v4().simple()));
		let reply = self.runner.run(&call).await.and_then(window_reply);

		let (allowed, remaining, reset_at) = match reply {
			Ok(values) => values,
			Err(e) => {
				tracing::error!(
					error = %e,
					key = %key,
					rule = %rule.key,
					"Rate limit store unavailable; admitting request"
				);
				return Ok(RateDecision {
					allowed: true,
					remaining: rule.permits_per_window.saturating_sub(1),
					reset_at_ms: now.saturating_add(rule.window_seconds.saturating_mul(1000)),
					source: DecisionSource::FailOpen,
				});
			}
		};

		let decision = RateDecision {
			allowed,
			remaining: u32::try_from(remaining.max(0)).unwrap_or(u32::MAX),
			reset_at_ms: u64::try_from(reset_at.max(0)).unwrap_or(0),
			source: DecisionSource::Store,
		};
		if decision.allowed {
			tracing::debug!(key = %key, remaining = decision.remaining, "Request admitted");
		} else {
			self.cache.record(&key, decision.reset_at_ms, now);
			tracing::debug!(key = %key, reset_at_ms = decision.reset_at_ms, "Request denied");
		}
		Ok(decision)
	}

	/// Forget every recorded request of `client` on `route`.
	///
	/// # Errors
	///
	/// Returns [`ThrottleError::InvalidKey`] for a malformed client identity
	/// and [`ThrottleError::Store`] when the store cannot be reached.
	pub async fn reset(&self, route: &str, client: &str) -> ThrottleResult<()> {
		validate_client_key(client)?;
		let key = self.window_key(self.rules.resolve(route), client);
		self.cache.invalidate(&key);
		self.runner
			.run(&ScriptCall::new(AtomicScript::KeyDelete).key(key.as_str()))
			.await?;
		tracing::debug!(key = %key, "Rate limit window reset");
		Ok(())
	}
}
