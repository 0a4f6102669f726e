//! Broker-backed event bus implementations.
//!
//! The bus abstraction and the in-memory bus live in `aetos-events`; this
//! module adds the Redis Streams broker used in deployment.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::{RedisStreamsError, RedisStreamsEventBus};
