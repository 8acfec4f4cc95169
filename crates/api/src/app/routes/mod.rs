use axum::{
    Router,
    routing::{get, post},
};

pub mod admin;
pub mod guest;
pub mod jobs;
pub mod system;
pub mod usage;

/// Router for all endpoints that need a resolved principal.
pub fn router() -> Router {
    Router::new()
        .route("/whoami", get(system::whoami))
        .nest("/jobs", jobs::router())
        .nest("/usage", usage::router())
        .route("/guest/claim", post(guest::claim))
        .nest("/admin", admin::router())
}
