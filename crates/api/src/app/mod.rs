//! HTTP API application wiring (Axum router + service wiring).
//!
//! - `services.rs`: backend selection (memory, Postgres, Redis), producer, hub, gateway
//! - `routes/`: HTTP routes + handlers
//! - `dto.rs`: request/response DTOs
//! - `errors.rs`: consistent error responses

use axum::{Extension, Router, routing::get};
use tower::ServiceBuilder;

use crate::middleware;

pub mod dto;
pub mod errors;
pub mod routes;
pub mod services;

pub use services::{AppServices, Backends};

/// Build the full HTTP router (public entrypoint used by `main.rs`).
pub fn build_app(services: AppServices) -> Router {
    let auth_state = middleware::AuthState {
        jwt: services.jwt.clone(),
    };

    // Protected routes: require auth + tenant context.
    let protected = routes::router().layer(axum::middleware::from_fn_with_state(
        auth_state,
        middleware::auth_middleware,
    ));

    Router::new()
        .route("/health", get(routes::system::health))
        // Authenticates on its own: the token may arrive as a query parameter.
        .route("/realtime", get(routes::realtime::connect))
        .merge(protected)
        .layer(ServiceBuilder::new().layer(Extension(services)))
}
