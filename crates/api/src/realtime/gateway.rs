use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use complyflow_auth::{AuthzError, JwtValidator, TokenValidationError, authorize_tenant};
use complyflow_core::TenantId;
use complyflow_infra::broadcast::{ProgressHub, TenantSubscription};
use complyflow_infra::jobs::{JobRecordStore, StoreError};

use super::protocol::{ClientMessage, ServerMessage};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] TokenValidationError),

    #[error("tenant mismatch")]
    TenantMismatch,

    #[error("status unavailable: {0}")]
    Store(#[from] StoreError),
}

impl From<AuthzError> for GatewayError {
    fn from(err: AuthzError) -> Self {
        match err {
            AuthzError::TenantMismatch => GatewayError::TenantMismatch,
        }
    }
}

/// A successful join: the sync frame to send first, then the live feed.
#[derive(Debug)]
pub struct JoinedPartition {
    pub sync: ServerMessage,
    pub subscription: TenantSubscription,
}

/// Per-instance entry point for realtime connections.
#[derive(Clone)]
pub struct RealtimeGateway {
    jwt: Arc<dyn JwtValidator>,
    records: Arc<dyn JobRecordStore>,
    hub: ProgressHub,
}

impl RealtimeGateway {
    pub fn new(jwt: Arc<dyn JwtValidator>, records: Arc<dyn JobRecordStore>, hub: ProgressHub) -> Self {
        Self { jwt, records, hub }
    }

    pub fn hub(&self) -> &ProgressHub {
        &self.hub
    }

    /// Validate a session token and return the only tenant identity the
    /// connection will ever act as.
    pub fn authenticate(&self, token: &str) -> Result<TenantId, GatewayError> {
        let claims = self.jwt.validate(token, Utc::now())?;
        Ok(claims.tenant_id)
    }

    /// Join `requested` on behalf of a connection authenticated as
    /// `authenticated`.
    ///
    /// A mismatch is rejected before anything is registered. The hub
    /// subscription is taken before the status read, so no frame emitted
    /// after the read can be missed.
    pub async fn join(&self, authenticated: TenantId, requested: TenantId) -> Result<JoinedPartition, GatewayError> {
        if let Err(e) = authorize_tenant(authenticated, requested) {
            warn!(
                authenticated_tenant = %authenticated,
                requested_tenant = %requested,
                "realtime join rejected: tenant mismatch"
            );
            return Err(e.into());
        }

        let subscription = self.hub.subscribe(authenticated);
        let latest = self.records.latest_for_tenant(authenticated).await?;

        debug!(
            tenant_id = %authenticated,
            job_id = ?latest.as_ref().map(|r| r.id),
            "realtime partition joined"
        );

        Ok(JoinedPartition {
            sync: ServerMessage::sync(latest.map(|r| r.snapshot())),
            subscription,
        })
    }
}

/// State of one authenticated connection, independent of the transport.
#[derive(Debug)]
pub struct GatewaySession {
    tenant_id: TenantId,
    subscription: Option<TenantSubscription>,
}

impl GatewaySession {
    pub fn new(tenant_id: TenantId) -> Self {
        Self {
            tenant_id,
            subscription: None,
        }
    }

    pub fn tenant_id(&self) -> TenantId {
        self.tenant_id
    }

    pub fn is_joined(&self) -> bool {
        self.subscription.is_some()
    }

    /// Handle one inbound text frame; returns the reply to send, if any.
    pub async fn on_text(&mut self, gateway: &RealtimeGateway, text: &str) -> Option<ServerMessage> {
        let message = match serde_json::from_str::<ClientMessage>(text) {
            Ok(m) => m,
            Err(e) => {
                debug!(tenant_id = %self.tenant_id, error = %e, "unparseable realtime frame");
                return Some(ServerMessage::error("invalid message"));
            }
        };

        match message {
            ClientMessage::Join { tenant_id } => match gateway.join(self.tenant_id, tenant_id).await {
                Ok(joined) => {
                    self.subscription = Some(joined.subscription);
                    Some(joined.sync)
                }
                Err(GatewayError::TenantMismatch) => Some(ServerMessage::error("tenant mismatch")),
                Err(e) => {
                    warn!(tenant_id = %self.tenant_id, error = %e, "realtime join failed");
                    Some(ServerMessage::error("status unavailable"))
                }
            },
            ClientMessage::Leave => {
                if self.subscription.take().is_some() {
                    info!(tenant_id = %self.tenant_id, "realtime partition left");
                }
                None
            }
        }
    }

    /// Next live frame for the joined partition. Pending forever while not
    /// joined.
    pub async fn next_frame(&mut self) -> Option<ServerMessage> {
        match self.subscription.as_mut() {
            Some(subscription) => match subscription.recv().await {
                Some(event) => Some(event.into()),
                None => {
                    self.subscription = None;
                    None
                }
            },
            None => std::future::pending().await,
        }
    }
}
