//! Shared fixtures for container-backed tests.

#[cfg(feature = "redis-backend")]
pub mod redis_fixture;
