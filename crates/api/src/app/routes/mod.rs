use axum::{Router, routing::get};

pub mod analyses;
pub mod realtime;
pub mod system;

/// Router for all authenticated (tenant-scoped) endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/analyses", analyses::router())
}
