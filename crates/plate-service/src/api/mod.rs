pub mod error;
pub mod routes;

pub use error::ApiError;

use crate::state::PlateServiceState;
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

/// Default request body limit; base64 inflates images by a third
pub const DEFAULT_MAX_BODY_BYTES: usize = 16 * 1024 * 1024;

/// Build the API router
pub fn router(state: PlateServiceState, max_body_bytes: usize) -> Router {
    Router::new()
        // Health and metrics endpoints
        .route("/healthz", get(routes::healthz))
        .route("/readyz", get(routes::readyz))
        .route("/metrics", get(routes::metrics))
        // Recognition endpoints
        .route("/v1/pipeline", get(routes::pipeline_info))
        .route("/v1/plates/recognize", post(routes::recognize))
        .route("/v1/plates/batch", post(routes::recognize_batch))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
