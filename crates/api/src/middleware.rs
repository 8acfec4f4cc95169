use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::Response,
};
use chrono::Utc;

use audioflow_auth::{AuthError, Credentials, IdentityResolver};

use crate::app::errors::json_error;
use crate::context::PrincipalContext;

/// Header carrying a client-held guest identifier.
pub const GUEST_ID_HEADER: &str = "x-guest-id";

#[derive(Clone)]
pub struct AuthState {
    pub resolver: Arc<IdentityResolver>,
}

/// Resolve the caller from `Authorization: Bearer` and/or `X-Guest-Id`.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: Next,
) -> Response {
    let credentials = extract_credentials(req.headers());

    let principal = match state.resolver.resolve(&credentials, Utc::now()).await {
        Ok(p) => p,
        Err(e) => return auth_error_to_response(e),
    };

    req.extensions_mut().insert(PrincipalContext::new(principal));
    next.run(req).await
}

fn auth_error_to_response(err: AuthError) -> Response {
    match err {
        AuthError::Unauthenticated => json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing or invalid credentials"),
        AuthError::GuestExpired => json_error(StatusCode::UNAUTHORIZED, "guest_expired", "guest session has expired"),
        AuthError::InvalidGuestId(msg) => json_error(StatusCode::UNAUTHORIZED, "invalid_guest_id", msg),
        AuthError::Registry(e) => {
            tracing::error!(error = %e, "guest registry unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "identity backend unavailable")
        }
    }
}

fn extract_credentials(headers: &HeaderMap) -> Credentials {
    Credentials {
        bearer: extract_bearer(headers),
        guest_id: header_str(headers, GUEST_ID_HEADER).map(str::to_string),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    let header = header_str(headers, axum::http::header::AUTHORIZATION.as_str())?;
    let token = header.strip_prefix("Bearer ")?.trim();
    if token.is_empty() {
        return None;
    }
    Some(token.to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}
