use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    response::IntoResponse,
    routing::{get, post},
};

use atelier_core::{JobId, OwnerRef};

use crate::app::{dto, errors, services::AppServices};

const DEFAULT_LIST_LIMIT: usize = 50;
const MAX_LIST_LIMIT: usize = 500;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_jobs))
        .route("/stats", get(job_stats))
        .route("/summary", post(summarize_jobs))
        .route("/:job_id", get(get_job))
}

pub async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id: JobId = match dto::parse_id(&job_id, "invalid_job_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.status.get_status(job_id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

pub async fn list_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<dto::ListJobsQuery>,
) -> axum::response::Response {
    let owner = OwnerRef::from_parts(query.owner_kind, query.owner_ref);
    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    match services.status.list_for_owner(owner, limit).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

pub async fn summarize_jobs(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SummaryRequest>,
) -> axum::response::Response {
    match services.status.summarize(&body.job_ids).await {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}

pub async fn job_stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.status.stats().await {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => errors::status_error_to_response(e),
    }
}
