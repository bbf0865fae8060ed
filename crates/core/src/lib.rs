//! `complyflow-core`: shared identifiers and the domain error model.
//!
//! Everything here is pure: no IO, no async, no infrastructure concerns.

pub mod error;
pub mod id;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, TenantId, UserId};
