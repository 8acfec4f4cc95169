//! Guest session routes.

use std::sync::Arc;

use axum::{
    extract::Extension,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::Utc;

use audioflow_auth::{AuthError, TokenClaims, TokenKind};
use audioflow_core::GuestId;

use crate::app::dto::{ClaimGuestRequest, GuestSessionResponse};
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

/// POST /guest/session - open a guest session (no credentials needed)
pub async fn start_session(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let now = Utc::now();
    let guest = match services.resolver.start_guest_session(now).await {
        Ok(g) => g,
        Err(AuthError::Registry(e)) => {
            tracing::error!(error = %e, "failed to persist guest session");
            return errors::json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "identity backend unavailable");
        }
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "guest_session_failed", e.to_string()),
    };

    let claims = TokenClaims::new(
        guest.guest_id.as_str(),
        TokenKind::Guest,
        Vec::new(),
        now,
        services.resolver.guest_ttl(),
    );
    let token = match services.tokens.issue(&claims) {
        Ok(t) => t,
        Err(e) => return errors::json_error(StatusCode::INTERNAL_SERVER_ERROR, "token_error", e.to_string()),
    };

    (
        StatusCode::CREATED,
        Json(GuestSessionResponse {
            guest_id: guest.guest_id,
            token,
            expires_at: guest.expires_at,
        }),
    )
        .into_response()
}

/// POST /guest/claim - attach a guest's history to the authenticated user
pub async fn claim(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Json(body): Json<ClaimGuestRequest>,
) -> axum::response::Response {
    let guest_id = match GuestId::parse(body.guest_id) {
        Ok(id) => id,
        Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", e.to_string()),
    };

    match services.pipeline.claim_guest(principal.principal(), &guest_id).await {
        Ok(guest) => Json(guest).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
