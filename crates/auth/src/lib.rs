//! `complyflow-auth`: authentication and tenant-boundary checks.
//!
//! Decoupled from HTTP and storage: the API layer feeds tokens in and gets
//! a validated tenant identity out.

pub mod authorize;
pub mod claims;
pub mod entitlement;
pub mod jwt;

pub use authorize::{AuthzError, authorize_tenant};
pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use entitlement::{
    EntitlementError, EntitlementGate, InMemoryEntitlements, SubscriptionStatus, evaluate_entitlement,
};
pub use jwt::{Hs256JwtValidator, JwtValidator};
