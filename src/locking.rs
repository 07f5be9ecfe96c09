//! Lease-based distributed locks.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mallcoord::locking::{LockTemplate, SimpleLock};
//! ```

pub use mallcoord_locking::*;
