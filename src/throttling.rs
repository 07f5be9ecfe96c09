//! Sliding-window admission control.

pub use mallcoord_throttling::*;
