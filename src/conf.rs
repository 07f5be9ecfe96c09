//! Settings loading.

pub use mallcoord_conf::*;
