use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use audioflow_infra::service::PipelineError;

pub fn pipeline_error_to_response(err: PipelineError) -> axum::response::Response {
    match err {
        PipelineError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        PipelineError::Unauthenticated => {
            json_error(StatusCode::UNAUTHORIZED, "unauthenticated", "missing or invalid credentials")
        }
        PipelineError::Forbidden(e) => json_error(StatusCode::FORBIDDEN, "forbidden", e.to_string()),
        PipelineError::NotFound(id) => json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found")),
        PipelineError::NotReady { job_id, status } => json_error(
            StatusCode::CONFLICT,
            "not_ready",
            format!("job {job_id} is not ready for download (status: {status})"),
        ),
        PipelineError::LimitExceeded(msg) => json_error(StatusCode::TOO_MANY_REQUESTS, "limit_exceeded", msg),
        PipelineError::Storage(msg) => {
            tracing::error!(error = %msg, "storage failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "storage failure")
        }
        PipelineError::Unavailable(msg) => {
            tracing::warn!(error = %msg, "backend unavailable");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "unavailable", "service temporarily unavailable")
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}

/// Parse a path segment into a typed id, or a 400.
pub fn parse_id<T: std::str::FromStr>(raw: &str, what: &'static str) -> Result<T, axum::response::Response> {
    raw.parse::<T>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", format!("malformed {what}: '{raw}'")))
}
