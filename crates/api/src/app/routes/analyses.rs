use std::str::FromStr;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use complyflow_core::JobId;
use complyflow_infra::jobs::StoreError;

use crate::app::dto::{AnalysisStatusResponse, StatsQuery, StatsResponse, SubmitAnalysisRequest, SubmitAnalysisResponse};
use crate::app::errors;
use crate::app::services::AppServices;
use crate::context::TenantContext;

const DEFAULT_RECENT: usize = 10;
const MAX_RECENT: usize = 50;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit))
        .route("/latest", get(latest))
        .route("/stats", get(stats))
        .route("/:id", get(status))
}

/// Accept a submission; execution continues on the worker pool.
pub async fn submit(
    Extension(services): Extension<AppServices>,
    Extension(tenant): Extension<TenantContext>,
    Json(req): Json<SubmitAnalysisRequest>,
) -> Response {
    let (input_ref, parameters) = match req.into_parts() {
        Ok(parts) => parts,
        Err(resp) => return resp,
    };

    match services.producer.submit(tenant.tenant_id(), input_ref, parameters).await {
        Ok(job_id) => (StatusCode::ACCEPTED, Json(SubmitAnalysisResponse::accepted(job_id))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

/// Polling view of one job; agrees with the last realtime frame.
pub async fn status(
    Extension(services): Extension<AppServices>,
    Extension(tenant): Extension<TenantContext>,
    Path(id): Path<String>,
) -> Response {
    let Ok(job_id) = JobId::from_str(&id) else {
        return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "analysis id must be a UUID");
    };

    match services.records.get_for_tenant(tenant.tenant_id(), job_id).await {
        Ok(Some(record)) => Json(AnalysisStatusResponse::from(record.snapshot())).into_response(),
        Ok(None) => errors::not_found(),
        // Another tenant's job is indistinguishable from a missing one.
        Err(StoreError::TenantIsolation) => {
            tracing::warn!(tenant_id = %tenant.tenant_id(), job_id = %job_id, "cross-tenant status lookup");
            errors::not_found()
        }
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn latest(Extension(services): Extension<AppServices>, Extension(tenant): Extension<TenantContext>) -> Response {
    match services.records.latest_for_tenant(tenant.tenant_id()).await {
        Ok(Some(record)) => Json(AnalysisStatusResponse::from(record.snapshot())).into_response(),
        Ok(None) => errors::not_found(),
        Err(e) => errors::store_error_to_response(e),
    }
}

pub async fn stats(
    Extension(services): Extension<AppServices>,
    Extension(tenant): Extension<TenantContext>,
    Query(query): Query<StatsQuery>,
) -> Response {
    let tenant_id = tenant.tenant_id();
    let limit = query.limit.unwrap_or(DEFAULT_RECENT).min(MAX_RECENT);

    let counts = match services.records.stats(tenant_id).await {
        Ok(c) => c,
        Err(e) => return errors::store_error_to_response(e),
    };
    let recent = match services.records.list_recent(tenant_id, limit).await {
        Ok(r) => r,
        Err(e) => return errors::store_error_to_response(e),
    };

    Json(StatsResponse::new(counts, &recent)).into_response()
}
