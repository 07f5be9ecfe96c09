//! # mallcoord-conf
//!
//! TOML and environment settings for the mallcoord services.
//!
//! ```
//! use mallcoord_conf::CoordinationSettings;
//!
//! let settings = CoordinationSettings::default().with_env_overrides();
//! settings.validate().unwrap();
//! ```

pub mod error;
pub mod settings;

pub use error::SettingsError;
pub use settings::{
	CoordinationSettings, KEY_PREFIX_ENV, REDIS_URL_ENV, RateLimitSettings, RedisSettings,
};
