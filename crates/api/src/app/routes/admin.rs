//! Admin routes: cross-owner job management, sweeps, and aggregate reads.
//!
//! Every handler requires the `admin` role; the check happens in the
//! pipeline facade so it cannot be skipped by a new route.

use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use audioflow_core::{GuestId, JobId, UserId};
use audioflow_jobs::Owner;

use crate::app::dto::{AdminJobsQuery, PageQuery};
use crate::app::{errors, services::AppServices};
use crate::context::PrincipalContext;

// ─────────────────────────────────────────────────────────────────────────────
// Router
// ─────────────────────────────────────────────────────────────────────────────

pub fn router() -> Router {
    Router::new()
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job).delete(delete_job))
        .route("/sweep", post(sweep_now))
        .route("/overview", get(overview))
        .route("/usage/users/:id", get(user_usage))
        .route("/usage/guests/:id", get(guest_usage))
        .route("/guests", get(list_guests))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// GET /admin/jobs - filter by status/user/guest, newest first
pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(query): Query<AdminJobsQuery>,
) -> axum::response::Response {
    let filter = match query.into_filter() {
        Ok(f) => f,
        Err(msg) => return errors::json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
    };

    match services.pipeline.admin_list_jobs(principal.principal(), &filter).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/jobs/:id - includes operator error detail
pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.pipeline.admin_get_job(principal.principal(), job_id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// DELETE /admin/jobs/:id - force-delete row and artifacts
pub async fn delete_job(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match errors::parse_id(&id, "job id") {
        Ok(id) => id,
        Err(res) => return res,
    };

    match services.pipeline.admin_delete_job(principal.principal(), job_id).await {
        Ok(deleted) => Json(deleted).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// POST /admin/sweep - run one expiry pass now
pub async fn sweep_now(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match services.pipeline.admin_sweep_now(principal.principal()).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/overview
pub async fn overview(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
) -> axum::response::Response {
    match services.pipeline.admin_overview(principal.principal()).await {
        Ok(overview) => Json(overview).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/usage/users/:id
pub async fn user_usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let user_id: UserId = match errors::parse_id(&id, "user id") {
        Ok(id) => id,
        Err(res) => return res,
    };
    owner_usage(&services, &principal, Owner::User(user_id)).await
}

/// GET /admin/usage/guests/:id
pub async fn guest_usage(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let guest_id: GuestId = match errors::parse_id(&id, "guest id") {
        Ok(id) => id,
        Err(res) => return res,
    };
    owner_usage(&services, &principal, Owner::Guest(guest_id)).await
}

async fn owner_usage(services: &AppServices, principal: &PrincipalContext, owner: Owner) -> axum::response::Response {
    match services.pipeline.admin_usage_for(principal.principal(), &owner).await {
        Ok(report) => Json(report).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}

/// GET /admin/guests
pub async fn list_guests(
    Extension(services): Extension<Arc<AppServices>>,
    Extension(principal): Extension<PrincipalContext>,
    Query(page): Query<PageQuery>,
) -> axum::response::Response {
    match services
        .pipeline
        .admin_list_guests(principal.principal(), page.skip(), page.limit())
        .await
    {
        Ok(guests) => Json(guests).into_response(),
        Err(e) => errors::pipeline_error_to_response(e),
    }
}
