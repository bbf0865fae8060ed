//! Progress broadcast: the shared bus between instances and the per-instance
//! hub that feeds local connections.

pub mod bus;
pub mod hub;

pub use bus::{ProgressBus, ProgressBusError};
pub use hub::{ProgressHub, TenantSubscription};
