//! Per-instance progress fan-out.
//!
//! Each server instance owns one `ProgressHub`. The hub consumes the shared
//! progress bus and routes every event to the connections this instance
//! holds for the event's tenant. The registry is local: it only knows about
//! this instance's connections and is never treated as a global view.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use complyflow_core::TenantId;
use complyflow_events::{EventBus, ProgressEvent, Subscription, TenantScoped};

type Partition = HashMap<u64, mpsc::UnboundedSender<ProgressEvent>>;

#[derive(Debug, Default)]
struct Registry {
    partitions: RwLock<HashMap<TenantId, Partition>>,
    next_id: AtomicU64,
}

impl Registry {
    fn remove(&self, tenant_id: TenantId, id: u64) {
        if let Ok(mut partitions) = self.partitions.write() {
            if let Some(partition) = partitions.get_mut(&tenant_id) {
                partition.remove(&id);
                if partition.is_empty() {
                    partitions.remove(&tenant_id);
                }
            }
        }
    }
}

/// Local registry of tenant-scoped progress listeners.
#[derive(Debug, Clone, Default)]
pub struct ProgressHub {
    registry: Arc<Registry>,
}

impl ProgressHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start routing events from `bus` into this hub.
    ///
    /// The pump ends when the bus side of the subscription goes away or the
    /// returned task is aborted.
    pub fn attach<B>(&self, bus: &B) -> JoinHandle<()>
    where
        B: EventBus<ProgressEvent> + ?Sized,
    {
        self.attach_subscription(bus.subscribe())
    }

    pub fn attach_subscription(&self, mut subscription: Subscription<ProgressEvent>) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.recv().await {
                hub.dispatch(event);
            }
            info!("progress bus subscription closed; hub pump stopped");
        })
    }

    /// Deliver an event to every local listener of its tenant. Returns how
    /// many listeners received it. Closed listeners are pruned.
    pub fn dispatch(&self, event: ProgressEvent) -> usize {
        let tenant_id = event.tenant_id();
        let Ok(partitions) = self.registry.partitions.read() else {
            return 0;
        };
        let Some(partition) = partitions.get(&tenant_id) else {
            return 0;
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in partition {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                closed.push(*id);
            }
        }
        drop(partitions);

        for id in closed {
            self.registry.remove(tenant_id, id);
        }

        debug!(tenant_id = %tenant_id, job_id = %event.job_id, delivered, "progress dispatched");
        delivered
    }

    /// Register a listener on a tenant partition. Dropping the returned
    /// subscription deregisters it.
    pub fn subscribe(&self, tenant_id: TenantId) -> TenantSubscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);

        if let Ok(mut partitions) = self.registry.partitions.write() {
            partitions.entry(tenant_id).or_default().insert(id, tx);
        }

        TenantSubscription {
            tenant_id,
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Live listeners for a tenant on this instance.
    pub fn listener_count(&self, tenant_id: TenantId) -> usize {
        self.registry
            .partitions
            .read()
            .map(|p| p.get(&tenant_id).map_or(0, |part| part.len()))
            .unwrap_or(0)
    }

    /// Tenants with at least one listener on this instance.
    pub fn active_tenants(&self) -> Vec<TenantId> {
        self.registry
            .partitions
            .read()
            .map(|p| p.keys().copied().collect())
            .unwrap_or_default()
    }
}

/// A listener on one tenant partition of a [`ProgressHub`].
#[derive(Debug)]
pub struct TenantSubscription {
    tenant_id: TenantId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
    registry: Weak<Registry>,
}

impl TenantSubscription {
    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<ProgressEvent, TryRecvError> {
        self.receiver.try_recv()
    }
}

impl Drop for TenantSubscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.tenant_id, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use complyflow_core::JobId;
    use complyflow_events::InMemoryEventBus;

    use super::*;

    fn event(tenant_id: TenantId, progress: i16) -> ProgressEvent {
        ProgressEvent::new(JobId::new(), tenant_id, progress, "step")
    }

    #[test]
    fn events_reach_only_their_tenant() {
        let hub = ProgressHub::new();
        let a = TenantId::new();
        let b = TenantId::new();
        let mut sub_a = hub.subscribe(a);
        let mut sub_b = hub.subscribe(b);

        assert_eq!(hub.dispatch(event(a, 20)), 1);

        assert_eq!(sub_a.try_recv().unwrap().progress, 20);
        assert!(sub_b.try_recv().is_err());
    }

    #[test]
    fn dropping_a_subscription_deregisters_it() {
        let hub = ProgressHub::new();
        let tenant = TenantId::new();
        let keep = hub.subscribe(tenant);
        let gone = hub.subscribe(tenant);
        assert_eq!(hub.listener_count(tenant), 2);

        drop(gone);
        assert_eq!(hub.listener_count(tenant), 1);
        drop(keep);
        assert!(hub.active_tenants().is_empty());
    }

    #[tokio::test]
    async fn two_instances_on_one_bus_both_deliver() {
        let bus = Arc::new(InMemoryEventBus::<ProgressEvent>::new());
        let instance_a = ProgressHub::new();
        let instance_b = ProgressHub::new();
        let _pump_a = instance_a.attach(&bus);
        let _pump_b = instance_b.attach(&bus);

        let tenant = TenantId::new();
        let mut on_a = instance_a.subscribe(tenant);
        let mut on_b = instance_b.subscribe(tenant);

        let job = JobId::new();
        for p in [20, 40, 60] {
            bus.publish(ProgressEvent::new(job, tenant, p, "step")).unwrap();
        }

        for sub in [&mut on_a, &mut on_b] {
            for expected in [20, 40, 60] {
                let ev = tokio::time::timeout(Duration::from_secs(1), sub.recv())
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(ev.progress, expected);
            }
        }
    }
}
