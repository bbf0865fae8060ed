use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use complyflow_analysis::InputError;
use complyflow_auth::EntitlementError;
use complyflow_infra::jobs::{StoreError, SubmitError};

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::NotEntitled(EntitlementError::Lookup(msg)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "entitlement_unavailable", msg)
        }
        SubmitError::NotEntitled(e) => json_error(StatusCode::PAYMENT_REQUIRED, "subscription_required", e.to_string()),
        SubmitError::Input(InputError::NotFound(input)) => json_error(
            StatusCode::BAD_REQUEST,
            "invalid_input_ref",
            format!("input '{input}' not found"),
        ),
        SubmitError::Input(e @ InputError::Unavailable(_)) => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "input_unavailable", e.to_string())
        }
        SubmitError::Store(e) => store_error_to_response(e),
        SubmitError::Enqueue { job_id, source } => {
            tracing::error!(job_id = %job_id, error = %source, "submission not enqueued");
            json_error(
                StatusCode::SERVICE_UNAVAILABLE,
                "enqueue_failed",
                "analysis could not be queued; please retry",
            )
        }
    }
}

pub fn store_error_to_response(err: StoreError) -> axum::response::Response {
    match err {
        StoreError::NotFound(_) => not_found(),
        StoreError::TenantIsolation => json_error(StatusCode::FORBIDDEN, "tenant_isolation", "tenant isolation violation"),
        other => {
            tracing::error!(error = %other, "job record store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", "job status unavailable")
        }
    }
}

pub fn not_found() -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", "analysis not found")
}

pub fn json_error(status: StatusCode, code: &'static str, message: impl Into<String>) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
