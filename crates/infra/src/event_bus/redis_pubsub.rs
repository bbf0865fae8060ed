//! Redis pub/sub-backed progress bus (optional).
//!
//! One channel per tenant partition (`<prefix>:<tenant_id>`). Every instance
//! pattern-subscribes to all partitions and filters locally in its hub.
//!
//! Pub/sub is not durable: a frame published while an instance is
//! disconnected is lost. That is acceptable for progress, because the
//! gateway re-syncs clients from the job record store on join.

use std::sync::mpsc;
use std::thread;

use redis::Commands;
use tokio::sync::mpsc as tokio_mpsc;
use tracing::{debug, warn};

use complyflow_core::TenantId;
use complyflow_events::{EventBus, ProgressEvent, Subscription, TenantScoped};

pub const DEFAULT_CHANNEL_PREFIX: &str = "complyflow:progress";

#[derive(Debug, thiserror::Error)]
pub enum RedisBusError {
    #[error("redis error: {0}")]
    Redis(String),
    #[error("failed to serialize progress event: {0}")]
    Serialize(String),
    #[error("redis publisher thread is gone")]
    Closed,
}

/// Channel carrying one tenant's progress events.
pub fn partition_channel(prefix: &str, tenant_id: TenantId) -> String {
    format!("{prefix}:{tenant_id}")
}

/// Redis pub/sub bus for progress events.
///
/// `publish` hands the frame to a background publisher thread and returns
/// immediately, so a slow or unreachable Redis never stalls a worker.
#[derive(Debug)]
pub struct RedisPubSubProgressBus {
    client: redis::Client,
    prefix: String,
    outbox: mpsc::Sender<(String, String)>,
}

impl RedisPubSubProgressBus {
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, RedisBusError> {
        Self::with_prefix(redis_url, DEFAULT_CHANNEL_PREFIX)
    }

    pub fn with_prefix(redis_url: impl AsRef<str>, prefix: impl Into<String>) -> Result<Self, RedisBusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(|e| RedisBusError::Redis(e.to_string()))?;

        let (outbox, rx) = mpsc::channel();
        let publisher = client.clone();
        thread::Builder::new()
            .name("redis-progress-publisher".to_string())
            .spawn(move || publisher_loop(publisher, rx))
            .map_err(|e| RedisBusError::Redis(format!("failed to spawn publisher thread: {e}")))?;

        Ok(Self {
            client,
            prefix: prefix.into(),
            outbox,
        })
    }
}

fn publisher_loop(client: redis::Client, rx: mpsc::Receiver<(String, String)>) {
    let mut conn: Option<redis::Connection> = None;

    for (channel, payload) in rx {
        if conn.is_none() {
            match client.get_connection() {
                Ok(c) => conn = Some(c),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "redis unavailable; dropping progress frame");
                    continue;
                }
            }
        }

        let Some(c) = conn.as_mut() else { continue };
        let published: redis::RedisResult<i64> = c.publish(&channel, payload);
        if let Err(e) = published {
            warn!(channel = %channel, error = %e, "redis publish failed; dropping progress frame");
            conn = None;
        }
    }
}

impl EventBus<ProgressEvent> for RedisPubSubProgressBus {
    type Error = RedisBusError;

    fn publish(&self, message: ProgressEvent) -> Result<(), Self::Error> {
        let channel = partition_channel(&self.prefix, message.tenant_id());
        let payload = serde_json::to_string(&message).map_err(|e| RedisBusError::Serialize(e.to_string()))?;
        self.outbox.send((channel, payload)).map_err(|_| RedisBusError::Closed)
    }

    fn subscribe(&self) -> Subscription<ProgressEvent> {
        let (tx, rx) = tokio_mpsc::unbounded_channel();

        let client = self.client.clone();
        let pattern = format!("{}:*", self.prefix);

        // Background thread that receives pub/sub messages and forwards them.
        let spawned = thread::Builder::new()
            .name("redis-progress-subscriber".to_string())
            .spawn(move || {
                let mut conn = match client.get_connection() {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "redis subscribe connection failed");
                        return;
                    }
                };

                let mut pubsub = conn.as_pubsub();
                if let Err(e) = pubsub.psubscribe(&pattern) {
                    warn!(pattern = %pattern, error = %e, "redis psubscribe failed");
                    return;
                }
                debug!(pattern = %pattern, "subscribed to progress partitions");

                loop {
                    let msg = match pubsub.get_message() {
                        Ok(m) => m,
                        Err(e) => {
                            warn!(error = %e, "redis subscription ended");
                            return;
                        }
                    };

                    let payload: String = match msg.get_payload() {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let event: ProgressEvent = match serde_json::from_str(&payload) {
                        Ok(e) => e,
                        Err(e) => {
                            warn!(error = %e, "discarding malformed progress frame");
                            continue;
                        }
                    };

                    if tx.send(event).is_err() {
                        return;
                    }
                }
            });

        if let Err(e) = spawned {
            warn!(error = %e, "failed to spawn redis subscriber thread");
        }

        Subscription::new(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_are_partitioned_by_tenant() {
        let a = TenantId::new();
        let b = TenantId::new();
        assert_ne!(partition_channel(DEFAULT_CHANNEL_PREFIX, a), partition_channel(DEFAULT_CHANNEL_PREFIX, b));
        assert!(partition_channel("p", a).starts_with("p:"));
    }

    #[test]
    fn construction_does_not_connect() {
        // `Client::open` only parses the URL.
        assert!(RedisPubSubProgressBus::new("redis://127.0.0.1:1/").is_ok());
        assert!(RedisPubSubProgressBus::new("not a url").is_err());
    }
}
