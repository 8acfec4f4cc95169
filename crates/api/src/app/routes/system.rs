use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};

use crate::context::PrincipalContext;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn whoami(Extension(principal): Extension<PrincipalContext>) -> impl IntoResponse {
    let p = principal.principal();
    Json(serde_json::json!({
        "owner": principal.owner(),
        "is_guest": p.is_guest(),
        "roles": p.roles().iter().map(|r| r.as_str()).collect::<Vec<_>>(),
    }))
}
