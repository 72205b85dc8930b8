//! Durable queue adapters.

pub mod redis_streams;

pub use redis_streams::{RedisQueueConfig, RedisStreamsTaskQueue};
