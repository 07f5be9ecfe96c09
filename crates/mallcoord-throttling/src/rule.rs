//! Static rate-limit rules and route classification.

use crate::key_validation::validate_rule_key;
use crate::{ThrottleError, ThrottleResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Permits allowed per sliding window for one class of operation.
///
/// # Examples
///
/// ```
/// use mallcoord_throttling::RateLimitRule;
///
/// let login = RateLimitRule::new("login", 5, 60);
/// assert_eq!(login.window_millis(), 60_000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
	pub key: String,
	pub permits_per_window: u32,
	pub window_seconds: u64,
}

impl RateLimitRule {
	pub fn new(key: impl Into<String>, permits_per_window: u32, window_seconds: u64) -> Self {
		Self {
			key: key.into(),
			permits_per_window,
			window_seconds,
		}
	}

	pub fn window(&self) -> Duration {
		Duration::from_secs(self.window_seconds)
	}

	pub fn window_millis(&self) -> i64 {
		i64::try_from(self.window_seconds.saturating_mul(1000)).unwrap_or(i64::MAX)
	}

	/// # Errors
	///
	/// Returns [`ThrottleError::InvalidKey`] for a malformed key and
	/// [`ThrottleError::InvalidRule`] for a zero permit count or window.
	pub fn validate(&self) -> ThrottleResult<()> {
		validate_rule_key(&self.key)?;
		if self.permits_per_window == 0 {
			return Err(ThrottleError::InvalidRule(format!(
				"rule `{}` must allow at least one permit",
				self.key
			)));
		}
		if self.window_seconds == 0 {
			return Err(ThrottleError::InvalidRule(format!(
				"rule `{}` must have a positive window",
				self.key
			)));
		}
		Ok(())
	}
}

/// Binds every route starting with `prefix` to a rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
	pub prefix: String,
	#[serde(flatten)]
	pub rule: RateLimitRule,
}

/// Route classification table.
///
/// A route resolves to the rule bound to its longest matching prefix, or to
/// the default rule when nothing matches. The table is immutable once built
/// and shared read-only by every limiter.
///
/// # Examples
///
/// ```
/// use mallcoord_throttling::{RateLimitRule, RuleTable};
///
/// let table = RuleTable::new(RateLimitRule::new("default", 100, 60))
///     .bind("/api/auth/login", RateLimitRule::new("login", 5, 60));
///
/// assert_eq!(table.resolve("/api/auth/login?next=/cart").key, "login");
/// assert_eq!(table.resolve("/api/products").key, "default");
/// ```
///
/// A deserialized table holds exactly the routes it lists; only a missing
/// table falls back to [`RuleTable::storefront`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleTable {
	#[serde(default = "fallback_rule")]
	pub default_rule: RateLimitRule,
	#[serde(default)]
	pub routes: Vec<RouteBinding>,
}

fn fallback_rule() -> RateLimitRule {
	RateLimitRule::new("default", 60, 60)
}

impl Default for RuleTable {
	fn default() -> Self {
		Self::storefront()
	}
}

impl RuleTable {
	pub fn new(default_rule: RateLimitRule) -> Self {
		Self {
			default_rule,
			routes: Vec::new(),
		}
	}

	pub fn bind(mut self, prefix: impl Into<String>, rule: RateLimitRule) -> Self {
		self.routes.push(RouteBinding {
			prefix: prefix.into(),
			rule,
		});
		self
	}

	/// Rules for a typical storefront gateway.
	///
	/// | Route prefix | Rule | Permits | Window |
	/// |---|---|---|---|
	/// | `/api/auth/login` | `login` | 5 | 60s |
	/// | `/api/auth/register` | `register` | 3 | 3600s |
	/// | `/api/upload` | `upload` | 10 | 60s |
	/// | `/api/` | `api` | 100 | 60s |
	/// | anything else | `default` | 60 | 60s |
	pub fn storefront() -> Self {
		Self::new(fallback_rule())
			.bind("/api/auth/login", RateLimitRule::new("login", 5, 60))
			.bind("/api/auth/register", RateLimitRule::new("register", 3, 3600))
			.bind("/api/upload", RateLimitRule::new("upload", 10, 60))
			.bind("/api/", RateLimitRule::new("api", 100, 60))
	}

	pub fn resolve(&self, route: &str) -> &RateLimitRule {
		self.routes
			.iter()
			.filter(|binding| route.starts_with(binding.prefix.as_str()))
			.max_by_key(|binding| binding.prefix.len())
			.map_or(&self.default_rule, |binding| &binding.rule)
	}

	/// # Errors
	///
	/// Returns the first invalid rule, or [`ThrottleError::InvalidRule`] for
	/// an empty or duplicated route prefix.
	pub fn validate(&self) -> ThrottleResult<()> {
		self.default_rule.validate()?;
		for (index, binding) in self.routes.iter().enumerate() {
			binding.rule.validate()?;
			if binding.prefix.is_empty() {
				return Err(ThrottleError::InvalidRule(format!(
					"rule `{}` is bound to an empty prefix",
					binding.rule.key
				)));
			}
			if self.routes[..index]
				.iter()
				.any(|earlier| earlier.prefix == binding.prefix)
			{
				return Err(ThrottleError::InvalidRule(format!(
					"prefix `{}` is bound twice",
					binding.prefix
				)));
			}
		}
		Ok(())
	}
}
