//! Owner-facing job routes: upload, list, status, download.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Extension, Multipart, Path, Query},
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tokio_util::io::ReaderStream;

use audioflow_core::JobId;
use audioflow_infra::service::Upload;

use crate::app::dto::PageQuery;
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs).post(upload))
        .route("/:id", get(get_job))
        .route("/:id/download", get(download))
}

#[derive(Debug, Default, Deserialize)]
pub struct UploadQuery {
    pub processing_type: Option<String>,
}

/// POST /jobs - multipart upload with a `file` part and a `processing_type`
/// part (or query parameter).
pub async fn upload(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<UploadQuery>,
    mut multipart: Multipart,
) -> axum::response::Response {
    let mut file: Option<(String, Vec<u8>)> = None;
    let mut processing_type = query.processing_type;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()),
        };

        match field.name() {
            Some("file") => {
                let filename = field.file_name().unwrap_or_default().to_string();
                match field.bytes().await {
                    Ok(bytes) => file = Some((filename, bytes.to_vec())),
                    Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()),
                }
            }
            Some("processing_type") => match field.text().await {
                Ok(text) => processing_type = Some(text.trim().to_string()),
                Err(e) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()),
            },
            _ => {}
        }
    }

    let Some((filename, bytes)) = file else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "missing 'file' part");
    };
    let Some(processing_type) = processing_type else {
        return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", "missing 'processing_type'");
    };

    let upload = Upload {
        filename,
        processing_type,
        bytes,
    };
    match services.pipeline.upload(principal.principal(), upload).await {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /jobs - the caller's own jobs, newest first
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(page): Query<PageQuery>,
) -> axum::response::Response {
    match services
        .pipeline
        .list_own_jobs(principal.principal(), page.skip(), page.limit())
        .await
    {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /jobs/:id
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.pipeline.get_status(principal.principal(), job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /jobs/:id/download - stream the processed artifact
pub async fn download(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    let download = match services.pipeline.download(principal.principal(), job_id).await {
        Ok(d) => d,
        Err(e) => return errors::pipeline_error_to_response(e),
    };

    let disposition = format!("attachment; filename=\"{}\"", download.filename.replace('"', ""));
    let body = Body::from_stream(ReaderStream::new(download.file));
    (
        [
            (header::CONTENT_TYPE, download.content_type),
            (header::CONTENT_DISPOSITION, disposition),
            (header::CONTENT_LENGTH, download.size.to_string()),
        ],
        body,
    )
        .into_response()
}
