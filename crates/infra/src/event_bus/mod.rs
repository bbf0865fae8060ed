//! Infrastructure event bus implementations.
//!
//! The bus abstraction lives in `complyflow-events` as pure mechanics.
//! This module provides the cross-instance transport (Redis pub/sub).

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::{RedisBusError, RedisPubSubProgressBus, partition_channel};
