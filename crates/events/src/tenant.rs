use complyflow_core::TenantId;

use crate::ProgressEvent;

/// Messages that belong to exactly one tenant.
///
/// Partitioned fan-out routes on this value; it is always taken from the
/// message the producer built, never from anything a client sent.
pub trait TenantScoped {
    fn tenant_id(&self) -> TenantId;
}

impl TenantScoped for ProgressEvent {
    fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }
}
