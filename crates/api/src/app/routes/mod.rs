use axum::{
    Router,
    routing::{get, post},
};

pub mod jobs;
pub mod submissions;
pub mod system;

/// Router for submission and status endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/profiles/:artist_id/background", post(submissions::submit_background))
        .route(
            "/products/:product_id/professional-shoot",
            post(submissions::submit_professional_shoot),
        )
        .nest("/jobs", jobs::router())
}
