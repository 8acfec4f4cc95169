use std::sync::Arc;

use axum::{
    extract::Extension,
    response::IntoResponse,
    routing::get,
    Json, Router,
};

use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(usage))
        .route("/limits", get(limits))
}

/// GET /usage - counters and derived metrics for the caller
pub async fn usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match services.pipeline.usage(principal.principal()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /usage/limits - every limit with current value and threshold
pub async fn limits(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match services.pipeline.check_limits(principal.principal()).await {
        Ok(checks) => Json(checks).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
