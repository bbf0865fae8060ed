//! Progress events and the publish/subscribe mechanics that carry them.

pub mod bus;
pub mod in_memory_bus;
pub mod progress;
pub mod tenant;

pub use bus::{EventBus, Subscription};
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use progress::ProgressEvent;
pub use tenant::TenantScoped;
