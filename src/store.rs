//! Atomic script execution against the coordination store.
//!
//! # Examples
//!
//! ```rust,no_run
//! use mallcoord::store::{AtomicScript, ScriptCall};
//! ```

pub use mallcoord_store::*;
