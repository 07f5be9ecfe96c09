//! Aggregate settings for every coordination service.
//!
//! Settings are read once at startup, validated, and then handed to the
//! services by value. Nothing here is global.
//!
//! ```toml
//! key_prefix = "shop:"
//!
//! [redis]
//! url = "redis://cache.internal:6379/0"
//!
//! [lock]
//! default_lease_ms = 10000
//! retry_interval_ms = 50
//!
//! [advanced_lock]
//! watchdog_timeout_ms = 30000
//!
//! [rate_limit.limiter]
//! ttl_buffer_seconds = 5
//!
//! [rate_limit.rules.default_rule]
//! key = "default"
//! permits_per_window = 60
//! window_seconds = 60
//! ```

use crate::SettingsError;
use mallcoord_locking::{AdvancedLockConfig, LockConfig};
use mallcoord_throttling::{LimiterConfig, RuleTable};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Overrides `redis.url`
pub const REDIS_URL_ENV: &str = "MALLCOORD_REDIS_URL";
/// Overrides `key_prefix`
pub const KEY_PREFIX_ENV: &str = "MALLCOORD_KEY_PREFIX";

/// Store connection settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisSettings {
	pub url: String,
}

impl Default for RedisSettings {
	fn default() -> Self {
		Self {
			url: "redis://127.0.0.1:6379/".to_string(),
		}
	}
}

impl RedisSettings {
	fn validate(&self) -> Result<(), SettingsError> {
		let supported = ["redis://", "rediss://", "unix://", "redis+unix://"];
		if !supported.iter().any(|scheme| self.url.starts_with(scheme)) {
			return Err(SettingsError::ValidationError(format!(
				"redis.url `{}` must use one of {}",
				self.url,
				supported.join(", ")
			)));
		}
		Ok(())
	}

	/// Open a script runner on the configured server.
	///
	/// # Errors
	///
	/// Returns [`SettingsError::ConnectionError`] when the URL is rejected or
	/// the server cannot be reached.
	#[cfg(feature = "redis-backend")]
	pub async fn connect(&self) -> Result<mallcoord_store::RedisScriptRunner, SettingsError> {
		mallcoord_store::RedisScriptRunner::new(&self.url)
			.await
			.map_err(|e| SettingsError::ConnectionError(format!("{}: {e}", self.url)))
	}
}

/// Limiter settings and its rule table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RateLimitSettings {
	pub limiter: LimiterConfig,
	pub rules: RuleTable,
}

/// Settings for every coordination service.
///
/// When `key_prefix` is set it replaces the namespace of every service:
/// locks live under `{prefix}lock:`, advanced locks under `{prefix}rlock:`
/// and rate windows under `{prefix}rate:`.
///
/// # Examples
///
/// ```
/// use mallcoord_conf::CoordinationSettings;
///
/// let settings = CoordinationSettings::from_toml_str(r#"
///     key_prefix = "shop:"
///     [redis]
///     url = "redis://cache.internal:6379/0"
/// "#).unwrap();
///
/// assert_eq!(settings.lock_config().key_prefix, "shop:lock:");
/// assert_eq!(settings.limiter_config().key_prefix, "shop:rate:");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CoordinationSettings {
	pub redis: RedisSettings,
	pub key_prefix: Option<String>,
	pub lock: LockConfig,
	pub advanced_lock: AdvancedLockConfig,
	pub rate_limit: RateLimitSettings,
}

impl CoordinationSettings {
	/// # Errors
	///
	/// Returns [`SettingsError::ParseError`] for malformed TOML.
	pub fn from_toml_str(raw: &str) -> Result<Self, SettingsError> {
		toml::from_str(raw).map_err(|e| SettingsError::ParseError(format!("TOML parse error: {e}")))
	}

	/// Load settings from a TOML file.
	///
	/// # Errors
	///
	/// Returns [`SettingsError::FileError`] when the file cannot be read and
	/// [`SettingsError::ParseError`] for malformed TOML.
	pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, SettingsError> {
		let path = path.into();
		let contents = std::fs::read_to_string(&path).map_err(|e| {
			SettingsError::FileError(format!("Failed to read {}: {}", path.display(), e))
		})?;
		let settings = Self::from_toml_str(&contents)?;
		tracing::debug!(path = %path.display(), "Coordination settings loaded");
		Ok(settings)
	}

	/// Defaults with process environment overrides applied.
	pub fn from_env() -> Self {
		Self::default().with_env_overrides()
	}

	/// Apply `MALLCOORD_REDIS_URL` and `MALLCOORD_KEY_PREFIX`.
	pub fn with_env_overrides(self) -> Self {
		self.with_overrides(|name| std::env::var(name).ok())
	}

	/// Apply overrides from `lookup`, keyed by environment variable name.
	pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
		if let Some(url) = lookup(REDIS_URL_ENV) {
			self.redis.url = url;
		}
		if let Some(prefix) = lookup(KEY_PREFIX_ENV) {
			self.key_prefix = Some(prefix);
		}
		self
	}

	fn namespaced(&self, service: &str, fallback: &str) -> String {
		match &self.key_prefix {
			Some(prefix) => format!("{prefix}{service}:"),
			None => fallback.to_string(),
		}
	}

	/// Simple lock settings with the shared prefix applied
	pub fn lock_config(&self) -> LockConfig {
		LockConfig {
			key_prefix: self.namespaced("lock", &self.lock.key_prefix),
			..self.lock.clone()
		}
	}

	/// Advanced lock settings with the shared prefix applied
	pub fn advanced_lock_config(&self) -> AdvancedLockConfig {
		AdvancedLockConfig {
			key_prefix: self.namespaced("rlock", &self.advanced_lock.key_prefix),
			..self.advanced_lock.clone()
		}
	}

	/// Limiter settings with the shared prefix applied
	pub fn limiter_config(&self) -> LimiterConfig {
		LimiterConfig {
			key_prefix: self.namespaced("rate", &self.rate_limit.limiter.key_prefix),
			..self.rate_limit.limiter.clone()
		}
	}

	/// # Errors
	///
	/// Returns [`SettingsError::ValidationError`] describing the first
	/// invalid setting.
	pub fn validate(&self) -> Result<(), SettingsError> {
		let invalid = |e: &dyn std::fmt::Display| SettingsError::ValidationError(e.to_string());
		self.redis.validate()?;
		if self.key_prefix.as_deref().is_some_and(str::is_empty) {
			return Err(SettingsError::ValidationError(
				"key_prefix must not be empty when set".to_string(),
			));
		}
		self.lock.validate().map_err(|e| invalid(&e))?;
		self.advanced_lock.validate().map_err(|e| invalid(&e))?;
		self.rate_limit.limiter.validate().map_err(|e| invalid(&e))?;
		self.rate_limit.rules.validate().map_err(|e| invalid(&e))?;

		let prefixes = [
			self.lock_config().key_prefix,
			self.advanced_lock_config().key_prefix,
			self.limiter_config().key_prefix,
		];
		if prefixes[0] == prefixes[1] || prefixes[0] == prefixes[2] || prefixes[1] == prefixes[2] {
			return Err(SettingsError::ValidationError(
				"lock, advanced lock and rate limit key prefixes must differ".to_string(),
			));
		}
		Ok(())
	}
}
