//! Shared test infrastructure.

mod redis;

pub use redis::TestRedis;
