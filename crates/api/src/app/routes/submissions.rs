//! Submission endpoints. Both answer 202 as soon as every job is queued.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
};

use atelier_core::{ArtistId, ProductId};
use atelier_infra::pipeline::BackgroundParams;

use crate::app::{dto, errors, services::AppServices};

pub async fn submit_background(
    Extension(services): Extension<Arc<AppServices>>,
    Path(artist_id): Path<String>,
    body: Option<Json<BackgroundParams>>,
) -> axum::response::Response {
    let artist_id: ArtistId = match dto::parse_id(&artist_id, "invalid_artist_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let params = body.map(|Json(p)| p).unwrap_or_default();

    match services.producer.submit_background(artist_id, params).await {
        Ok(jobs) => (StatusCode::ACCEPTED, Json(dto::SubmissionResponse::new(&jobs))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}

pub async fn submit_professional_shoot(
    Extension(services): Extension<Arc<AppServices>>,
    Path(product_id): Path<String>,
) -> axum::response::Response {
    let product_id: ProductId = match dto::parse_id(&product_id, "invalid_product_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.producer.submit_professional_shoot(product_id).await {
        Ok(jobs) => (StatusCode::ACCEPTED, Json(dto::SubmissionResponse::new(&jobs))).into_response(),
        Err(e) => errors::submit_error_to_response(e),
    }
}
