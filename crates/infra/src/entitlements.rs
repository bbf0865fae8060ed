//! Postgres-backed subscription table behind the entitlement gate.
//!
//! One row per tenant, written by billing (webhooks or back office) and read
//! on every submission. A tenant without a row is unknown and rejected.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::{PgPool, Row};
use tracing::instrument;

use complyflow_auth::{EntitlementError, EntitlementGate, SubscriptionStatus, evaluate_entitlement};
use complyflow_core::TenantId;

pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenant_subscriptions (
    tenant_id  UUID PRIMARY KEY,
    status     TEXT NOT NULL CHECK (status IN ('active', 'trialing', 'past_due', 'canceled', 'incomplete')),
    updated_at TIMESTAMPTZ NOT NULL
);
"#;

pub async fn ensure_schema(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PostgresEntitlements {
    pool: Arc<PgPool>,
}

impl PostgresEntitlements {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Arc::new(pool) }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn status_of(&self, tenant_id: TenantId) -> Result<Option<SubscriptionStatus>, EntitlementError> {
        let row = sqlx::query("SELECT status FROM tenant_subscriptions WHERE tenant_id = $1")
            .bind(*tenant_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| lookup_error("status_of", e))?;

        match row {
            Some(row) => {
                let status: String = row.try_get("status").map_err(|e| lookup_error("status_of", e))?;
                Ok(Some(status.parse()?))
            }
            None => Ok(None),
        }
    }

    /// Upsert the tenant's subscription status.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, status = status.as_str()), err)]
    pub async fn set_status(&self, tenant_id: TenantId, status: SubscriptionStatus) -> Result<(), EntitlementError> {
        sqlx::query(
            r#"
            INSERT INTO tenant_subscriptions (tenant_id, status, updated_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (tenant_id) DO UPDATE SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(*tenant_id.as_uuid())
        .bind(status.as_str())
        .bind(Utc::now())
        .execute(&*self.pool)
        .await
        .map_err(|e| lookup_error("set_status", e))?;
        Ok(())
    }
}

#[async_trait]
impl EntitlementGate for PostgresEntitlements {
    async fn ensure_entitled(&self, tenant_id: TenantId) -> Result<(), EntitlementError> {
        let status = self.status_of(tenant_id).await?;
        evaluate_entitlement(tenant_id, status)
    }
}

fn lookup_error(operation: &str, err: sqlx::Error) -> EntitlementError {
    match err {
        sqlx::Error::Database(db) => EntitlementError::Lookup(format!("database error in {operation}: {}", db.message())),
        sqlx::Error::PoolClosed => EntitlementError::Lookup(format!("connection pool closed in {operation}")),
        other => EntitlementError::Lookup(format!("sqlx error in {operation}: {other}")),
    }
}
