//! # mallcoord-throttling
//!
//! Sliding-window admission control shared by every service instance
//! through the coordination store.
//!
//! Requests are classified by route into a [`RateLimitRule`] via a
//! [`RuleTable`]; each `(rule, client)` pair gets its own window in the
//! store. Denials are remembered in a process-local [`NegativeCache`] so a
//! client hammering a closed window does not cost a store round trip per
//! request.
//!
//! Unlike the locks, the limiter fails open: when the store is unreachable
//! requests are admitted and the error is logged.

pub mod cache;
pub mod error;
pub mod key_validation;
pub mod limiter;
pub mod rule;

pub use cache::NegativeCache;
pub use error::{ThrottleError, ThrottleResult};
pub use limiter::{DecisionSource, LimiterConfig, RateDecision, SlidingWindowLimiter};
pub use rule::{RateLimitRule, RouteBinding, RuleTable};
