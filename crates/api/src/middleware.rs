use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode, Uri},
    middleware::Next,
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;

use complyflow_auth::JwtValidator;

use crate::context::{PrincipalContext, TenantContext};

#[derive(Clone)]
pub struct AuthState {
    pub jwt: Arc<dyn JwtValidator>,
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = extract_token(req.headers(), req.uri()).ok_or(StatusCode::UNAUTHORIZED)?;

    let claims = state.jwt.validate(&token, Utc::now()).map_err(|e| {
        tracing::debug!(error = %e, "rejected bearer token");
        StatusCode::UNAUTHORIZED
    })?;

    req.extensions_mut().insert(TenantContext::new(claims.tenant_id));
    req.extensions_mut().insert(PrincipalContext::new(claims.sub));

    Ok(next.run(req).await)
}

/// `Authorization: Bearer <token>`, falling back to a `token` query parameter
/// (browsers cannot set headers on a WebSocket upgrade).
pub fn extract_token(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    if let Some(token) = extract_bearer(headers) {
        return Some(token.to_string());
    }

    Query::<TokenQuery>::try_from_uri(uri)
        .ok()
        .and_then(|Query(q)| q.token)
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    let header = headers.get(axum::http::header::AUTHORIZATION)?;
    let header = header.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token)
}

#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn header_wins_over_query() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer abc"));
        let uri: Uri = "/realtime?token=xyz".parse().unwrap();
        assert_eq!(extract_token(&headers, &uri).as_deref(), Some("abc"));
    }

    #[test]
    fn query_token_is_accepted() {
        let uri: Uri = "/realtime?token=xyz".parse().unwrap();
        assert_eq!(extract_token(&HeaderMap::new(), &uri).as_deref(), Some("xyz"));
    }

    #[test]
    fn missing_or_blank_tokens_are_rejected() {
        let mut headers = HeaderMap::new();
        headers.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(extract_token(&headers, &"/whoami".parse().unwrap()), None);
        assert_eq!(extract_token(&HeaderMap::new(), &"/realtime?token=".parse().unwrap()), None);
        assert_eq!(extract_token(&HeaderMap::new(), &"/realtime".parse().unwrap()), None);
    }
}
