//! Infrastructure task queue implementations.
//!
//! The queue contract and the in-memory queue live in `docbatch-events`.
//! This module provides broker-backed implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsTaskQueue;
