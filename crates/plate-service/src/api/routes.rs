use super::ApiError;
use crate::state::PlateServiceState;
use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use base64::Engine;
use common::plate_tasks::{
    BatchRecognizeRequest, BatchRecognizeResponse, ImageResult, PipelineInfo, RecognizeRequest,
};
use serde_json::json;

fn decode_image(data: &str) -> Result<Vec<u8>, ApiError> {
    let bytes = base64::prelude::BASE64_STANDARD.decode(data.trim())?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("image data is empty"));
    }
    Ok(bytes)
}

/// Recognize plates in one image
pub async fn recognize(
    State(state): State<PlateServiceState>,
    Json(request): Json<RecognizeRequest>,
) -> Result<Json<ImageResult>, ApiError> {
    let image = decode_image(&request.image)?;
    let thresholds = state.thresholds(request.plate_conf_threshold, request.char_conf_threshold);

    let result = state.recognize(image, thresholds).await?;
    Ok(Json(result))
}

/// Recognize plates in an ordered batch of images
pub async fn recognize_batch(
    State(state): State<PlateServiceState>,
    Json(request): Json<BatchRecognizeRequest>,
) -> Result<Json<BatchRecognizeResponse>, ApiError> {
    if request.images.is_empty() {
        return Err(ApiError::bad_request("batch contains no images"));
    }

    let images = request
        .images
        .iter()
        .enumerate()
        .map(|(i, data)| {
            decode_image(data).map_err(|e| ApiError::bad_request(format!("image {}: {}", i, e)))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let thresholds = state.thresholds(request.plate_conf_threshold, request.char_conf_threshold);
    thresholds.validate()?;

    let results = state.recognize_batch(images, thresholds).await?;
    Ok(Json(BatchRecognizeResponse { results }))
}

/// Describe the loaded pipeline
pub async fn pipeline_info(State(state): State<PlateServiceState>) -> Json<PipelineInfo> {
    Json(state.pipeline_info())
}

/// Health check endpoint
pub async fn healthz(State(state): State<PlateServiceState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "plate-service",
            "node_id": state.node_id(),
        })),
    )
}

/// Readiness check endpoint
pub async fn readyz(State(state): State<PlateServiceState>) -> impl IntoResponse {
    let ready = state.is_ready();
    let info = state.pipeline_info();
    let pool = state.pool();
    let body = json!({
        "status": if ready { "ready" } else { "not ready" },
        "detectors": {
            info.plate_detector.id.clone(): info.plate_detector.healthy,
            info.char_detector.id.clone(): info.char_detector.healthy,
        },
        "pool": {
            "workers": pool.workers(),
            "active": pool.active(),
            "waiting": pool.waiting(),
            "queue_depth": pool.queue_depth(),
        },
    });

    if ready {
        (StatusCode::OK, Json(body))
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, Json(body))
    }
}

/// Metrics endpoint (Prometheus format)
pub async fn metrics() -> impl IntoResponse {
    match telemetry::metrics::encode_metrics() {
        Ok(body) => body.into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response()
        }
    }
}
