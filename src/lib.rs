//! # mallcoord
//!
//! Distributed coordination for horizontally scaled services: lease-based
//! locks and sliding-window admission control, all backed by one shared
//! Redis instance.
//!
//! Every operation reduces to one atomic script executed by an
//! [`AtomicScriptRunner`](store::AtomicScriptRunner). Locks and the rate
//! limiter are independent consumers of that runner.
//!
//! ## Failure policy
//!
//! - Locks fail closed: an unreachable store means "not acquired".
//! - The rate limiter fails open: an unreachable store means "allowed".
//!
//! ## Feature Flags
//!
//! - `redis-backend` (default) - [`RedisScriptRunner`](store::RedisScriptRunner)
//!   and [`Coordinator::connect`]
//!
//! ## Quick Example
//!
//! ```rust,no_run
//! use mallcoord::Coordinator;
//! use mallcoord::conf::CoordinationSettings;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = CoordinationSettings::from_file("mallcoord.toml")?.with_env_overrides();
//! let coordinator = Coordinator::connect(&settings).await?;
//!
//! // Gateway admission control
//! let decision = coordinator.limiter().check("/api/auth/login", "203.0.113.9").await?;
//! if !decision.allowed {
//!     return Ok(());
//! }
//!
//! // Exactly one node mutates order 42 at a time
//! coordinator
//!     .template()
//!     .execute("order:42", Duration::from_secs(10), Duration::from_millis(200), || async {
//!         // critical section
//!     })
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod conf;
pub mod coordinator;
pub mod locking;
pub mod store;
pub mod throttling;

pub use coordinator::Coordinator;

// Re-export the most commonly used types
pub use mallcoord_conf::{CoordinationSettings, SettingsError};
pub use mallcoord_locking::{
	AcquireFailure, AdvancedLockManager, CoordinatedLock, LockError, LockHandle, LockKind,
	LockOwner, LockResult, LockTemplate, SimpleLock,
};
pub use mallcoord_store::{AtomicScriptRunner, MemoryScriptRunner, StoreError};
pub use mallcoord_throttling::{RateDecision, RateLimitRule, RuleTable, SlidingWindowLimiter};

#[cfg(feature = "redis-backend")]
pub use mallcoord_store::RedisScriptRunner;
