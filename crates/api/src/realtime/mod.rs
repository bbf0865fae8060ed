//! Realtime progress channel.
//!
//! A connection authenticates once, then joins its tenant partition. On
//! join it gets a sync frame with the tenant's latest known status, followed
//! by live progress frames from the local [`ProgressHub`].
//!
//! [`ProgressHub`]: complyflow_infra::broadcast::ProgressHub

pub mod gateway;
pub mod protocol;

pub use gateway::{GatewayError, GatewaySession, JoinedPartition, RealtimeGateway};
pub use protocol::{ClientMessage, ServerMessage};
