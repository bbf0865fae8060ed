use axum::{Json, extract::Extension, response::IntoResponse};

use crate::app::services::AppServices;
use crate::context::{PrincipalContext, TenantContext};

pub async fn health(Extension(services): Extension<AppServices>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "instance_id": services.instance_id,
        "progress_bus": services.bus.kind(),
    }))
}

pub async fn whoami(
    Extension(tenant): Extension<TenantContext>,
    Extension(principal): Extension<PrincipalContext>,
) -> impl IntoResponse {
    Json(serde_json::json!({
        "tenant_id": tenant.tenant_id().to_string(),
        "user_id": principal.user_id().to_string(),
    }))
}
