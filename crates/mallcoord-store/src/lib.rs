//! # mallcoord-store
//!
//! Atomic script execution against the shared coordination store.
//!
//! Every coordination primitive in mallcoord reduces to a call of one named
//! script from the [`AtomicScript`] catalogue. Callers never issue a
//! check-then-act sequence outside a script.
//!
//! ## Runners
//!
//! - [`MemoryScriptRunner`]: in-process emulation with a pluggable [`Clock`]
//! - `RedisScriptRunner`: Redis via `EVALSHA` (feature `redis-backend`)
//!
//! ## Failure model
//!
//! Connectivity and script failures surface as the retryable
//! [`StoreError::Unavailable`]. This layer never decides between
//! fail-open and fail-closed; that is left to the caller.

pub mod clock;
pub mod error;
pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
pub mod runner;
pub mod script;

pub use clock::{Clock, MockClock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryScriptRunner;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisScriptRunner;
pub use runner::AtomicScriptRunner;
pub use script::{AtomicScript, ScriptArg, ScriptCall, ScriptReply};
