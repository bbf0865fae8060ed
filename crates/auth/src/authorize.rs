use thiserror::Error;

use complyflow_core::TenantId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthzError {
    #[error("tenant mismatch")]
    TenantMismatch,
}

/// The only authorization rule this system has: a session acts inside its
/// own tenant and nowhere else.
///
/// `authenticated` must come from validated claims; `requested` is whatever
/// the client asked for.
pub fn authorize_tenant(authenticated: TenantId, requested: TenantId) -> Result<(), AuthzError> {
    if authenticated == requested {
        Ok(())
    } else {
        Err(AuthzError::TenantMismatch)
    }
}
