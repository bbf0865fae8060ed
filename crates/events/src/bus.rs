//! Event publishing/subscription abstraction (mechanics only).
//!
//! The bus is the **distribution** layer for progress events. It makes few
//! assumptions:
//!
//! - **Transport-agnostic**: in-process channels, Redis pub/sub, etc.
//! - **Best-effort**: a subscriber may miss messages. Progress frames are
//!   advisory; the job record store is the source of truth and the realtime
//!   gateway re-syncs clients from it on (re)join.
//! - **Per-publisher ordering**: messages from one publisher reach a given
//!   subscriber in publish order. Nothing is promised across publishers.
//! - **Non-blocking publish**: `publish` must never wait on a slow consumer
//!   or a remote broker round-trip.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::mpsc::error::TryRecvError;

/// A subscription to an event stream.
///
/// Each subscription receives its own copy of every message published after
/// it was created (broadcast semantics). Dropping the subscription detaches
/// it from the bus; the bus prunes it on the next publish.
#[derive(Debug)]
pub struct Subscription<M> {
    receiver: UnboundedReceiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(receiver: UnboundedReceiver<M>) -> Self {
        Self { receiver }
    }

    /// Wait for the next message. `None` means the bus side has gone away.
    pub async fn recv(&mut self) -> Option<M> {
        self.receiver.recv().await
    }

    /// Try to receive a message without waiting.
    pub fn try_recv(&mut self) -> Result<M, TryRecvError> {
        self.receiver.try_recv()
    }

    pub fn into_inner(self) -> UnboundedReceiver<M> {
        self.receiver
    }
}

/// Domain-agnostic event bus (pub/sub abstraction).
///
/// ```text
/// Worker ── publish ──► EventBus ──► instance A subscription ──► local connections
///                                └─► instance B subscription ──► local connections
/// ```
///
/// A process-local implementation only reaches subscribers inside the same
/// process. Multi-instance deployments plug in a shared transport so that
/// every instance sees every publish.
///
/// `publish()` may fail (e.g. the transport is gone). Callers that treat
/// progress as advisory log and drop the error.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + core::fmt::Display + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
