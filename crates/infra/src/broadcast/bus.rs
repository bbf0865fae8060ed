//! The shared progress bus, selected at startup.

use std::sync::Arc;

use complyflow_events::{EventBus, InMemoryBusError, InMemoryEventBus, ProgressEvent, Subscription};

#[cfg(feature = "redis")]
use crate::event_bus::{RedisBusError, RedisPubSubProgressBus};

#[derive(Debug, thiserror::Error)]
pub enum ProgressBusError {
    #[error(transparent)]
    InProcess(#[from] InMemoryBusError),
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] RedisBusError),
}

/// Progress transport shared by workers (publishers) and hubs (subscribers).
///
/// `InProcess` only reaches hubs in the same process; multi-instance
/// deployments use `Redis`.
#[derive(Debug, Clone)]
pub enum ProgressBus {
    InProcess(Arc<InMemoryEventBus<ProgressEvent>>),
    #[cfg(feature = "redis")]
    Redis(Arc<RedisPubSubProgressBus>),
}

impl ProgressBus {
    pub fn in_process() -> Self {
        Self::InProcess(Arc::new(InMemoryEventBus::new()))
    }

    #[cfg(feature = "redis")]
    pub fn redis(redis_url: &str) -> Result<Self, RedisBusError> {
        Ok(Self::Redis(Arc::new(RedisPubSubProgressBus::new(redis_url)?)))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ProgressBus::InProcess(_) => "in_process",
            #[cfg(feature = "redis")]
            ProgressBus::Redis(_) => "redis",
        }
    }
}

impl EventBus<ProgressEvent> for ProgressBus {
    type Error = ProgressBusError;

    fn publish(&self, message: ProgressEvent) -> Result<(), Self::Error> {
        match self {
            ProgressBus::InProcess(bus) => Ok(bus.publish(message)?),
            #[cfg(feature = "redis")]
            ProgressBus::Redis(bus) => Ok(bus.publish(message)?),
        }
    }

    fn subscribe(&self) -> Subscription<ProgressEvent> {
        match self {
            ProgressBus::InProcess(bus) => bus.subscribe(),
            #[cfg(feature = "redis")]
            ProgressBus::Redis(bus) => bus.subscribe(),
        }
    }
}
