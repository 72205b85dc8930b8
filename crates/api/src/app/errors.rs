use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use atelier_infra::pipeline::{StatusError, SubmitError};

use crate::app::dto::SubmittedJobResponse;

pub fn submit_error_to_response(err: SubmitError) -> axum::response::Response {
    match err {
        SubmitError::OwnerNotFound { .. } => json_error(StatusCode::NOT_FOUND, "owner_not_found", err.to_string()),
        SubmitError::NothingToGenerate(_) => {
            json_error(StatusCode::UNPROCESSABLE_ENTITY, "nothing_to_generate", err.to_string())
        }
        SubmitError::Store(_) | SubmitError::Queue(_) | SubmitError::Marketplace(_) => {
            tracing::error!(error = %err, "submission failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "submission_failed", err.to_string())
        }
        SubmitError::Partial { .. } => {
            tracing::error!(error = %err, "submission partially failed");
            let submitted: Vec<SubmittedJobResponse> = err.submitted().iter().map(SubmittedJobResponse::from).collect();
            (
                StatusCode::SERVICE_UNAVAILABLE,
                axum::Json(json!({
                    "error": "submission_failed",
                    "message": err.to_string(),
                    "submitted": submitted,
                })),
            )
                .into_response()
        }
    }
}

pub fn status_error_to_response(err: StatusError) -> axum::response::Response {
    match err {
        StatusError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        StatusError::TooManyIds { .. } => json_error(StatusCode::BAD_REQUEST, "too_many_job_ids", err.to_string()),
        StatusError::Store(_) => {
            tracing::error!(error = %err, "job store lookup failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "store_unavailable", err.to_string())
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
