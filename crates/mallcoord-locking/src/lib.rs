//! # mallcoord-locking
//!
//! Lease-based distributed locks for horizontally scaled services.
//!
//! ## Locks
//!
//! - [`SimpleLock`]: single-owner lease lock with a unique owner token per
//!   acquisition
//! - [`LockTemplate`]: acquire, run a critical section, always release
//! - [`AdvancedLockManager`]: reentrant, fair and read/write locks with an
//!   optional watchdog that renews the lease while held
//!
//! ## Failure model
//!
//! Locks fail closed. If the store cannot be reached, acquisition reports
//! [`AcquireFailure::StoreUnavailable`] and callers must not assume mutual
//! exclusion. Releasing a lock that already lapsed is a logged warning,
//! never an error.
//!
//! Mutual exclusion holds only while the lease is live. No fencing token is
//! issued, so critical sections that may outlive their lease should keep
//! their writes idempotent.

pub mod advanced;
pub mod config;
pub mod error;
pub mod owner;
pub mod simple;
pub mod template;
mod watchdog;

pub use advanced::{AdvancedLockManager, CoordinatedLock, LockKind, ManagedLock, ReadWriteLock};
pub use config::{AdvancedLockConfig, LockConfig};
pub use error::{AcquireFailure, LockError, LockResult};
pub use owner::LockOwner;
pub use simple::{LockHandle, SimpleLock};
pub use template::LockTemplate;
