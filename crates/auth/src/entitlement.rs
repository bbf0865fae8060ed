//! Billing entitlement gate.
//!
//! Answers one question: may this tenant start new analyses right now?

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use complyflow_core::TenantId;

/// Subscription state as reported by the billing provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Canceled,
    Incomplete,
}

impl SubscriptionStatus {
    pub fn is_entitled(self) -> bool {
        matches!(self, SubscriptionStatus::Active | SubscriptionStatus::Trialing)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Canceled => "canceled",
            SubscriptionStatus::Incomplete => "incomplete",
        }
    }
}

impl FromStr for SubscriptionStatus {
    type Err = EntitlementError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "canceled" => Ok(SubscriptionStatus::Canceled),
            "incomplete" => Ok(SubscriptionStatus::Incomplete),
            other => Err(EntitlementError::Lookup(format!("unknown subscription status '{other}'"))),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EntitlementError {
    #[error("subscription required (status: {})", .0.as_str())]
    NotEntitled(SubscriptionStatus),

    #[error("unknown tenant")]
    UnknownTenant,

    #[error("entitlement lookup failed: {0}")]
    Lookup(String),
}

/// Gate consulted before any job is created.
#[async_trait]
pub trait EntitlementGate: Send + Sync {
    async fn ensure_entitled(&self, tenant_id: TenantId) -> Result<(), EntitlementError>;
}

/// Apply the entitlement rule to a looked-up status (`None` when the tenant
/// has no subscription on file).
pub fn evaluate_entitlement(tenant_id: TenantId, status: Option<SubscriptionStatus>) -> Result<(), EntitlementError> {
    match status {
        Some(status) if status.is_entitled() => Ok(()),
        Some(status) => {
            tracing::warn!(tenant_id = %tenant_id, status = status.as_str(), "tenant not entitled");
            Err(EntitlementError::NotEntitled(status))
        }
        None => Err(EntitlementError::UnknownTenant),
    }
}

/// In-memory entitlement table for tests and local runs.
///
/// Tenants without an explicit entry fall back to `default_status`; when that
/// is `None` they are rejected as unknown.
#[derive(Debug)]
pub struct InMemoryEntitlements {
    statuses: RwLock<HashMap<TenantId, SubscriptionStatus>>,
    default_status: Option<SubscriptionStatus>,
}

impl InMemoryEntitlements {
    pub fn new(default_status: Option<SubscriptionStatus>) -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            default_status,
        }
    }

    /// Every tenant is entitled unless told otherwise.
    pub fn permissive() -> Self {
        Self::new(Some(SubscriptionStatus::Active))
    }

    pub fn set_status(&self, tenant_id: TenantId, status: SubscriptionStatus) {
        self.statuses
            .write()
            .expect("entitlements lock poisoned")
            .insert(tenant_id, status);
    }

    fn status_of(&self, tenant_id: TenantId) -> Option<SubscriptionStatus> {
        self.statuses
            .read()
            .expect("entitlements lock poisoned")
            .get(&tenant_id)
            .copied()
            .or(self.default_status)
    }
}

#[async_trait]
impl EntitlementGate for InMemoryEntitlements {
    async fn ensure_entitled(&self, tenant_id: TenantId) -> Result<(), EntitlementError> {
        evaluate_entitlement(tenant_id, self.status_of(tenant_id))
    }
}
