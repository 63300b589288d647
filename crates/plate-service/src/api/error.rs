use crate::error::{PipelineError, PoolError};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            ApiError::BadRequest(msg) | ApiError::Unavailable(msg) | ApiError::Internal(msg) => msg,
        };

        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), "{}", message);
        }

        (status, Json(json!({ "error": message }))).into_response()
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        if err.is_client_error() {
            ApiError::bad_request(err.to_string())
        } else {
            ApiError::internal(err.to_string())
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Pipeline(e) => e.into(),
            PoolError::Saturated { .. } | PoolError::Closed => ApiError::unavailable(err.to_string()),
            PoolError::Worker(_) => ApiError::internal(err.to_string()),
        }
    }
}

impl From<base64::DecodeError> for ApiError {
    fn from(err: base64::DecodeError) -> Self {
        ApiError::bad_request(format!("invalid base64 image data: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_errors_map_to_status() {
        let saturated: ApiError = PoolError::Saturated {
            workers: 2,
            queued: 8,
        }
        .into();
        assert_eq!(saturated.status(), StatusCode::SERVICE_UNAVAILABLE);

        let closed: ApiError = PoolError::Closed.into();
        assert_eq!(closed.status(), StatusCode::SERVICE_UNAVAILABLE);

        let worker: ApiError = PoolError::Worker("panicked".to_string()).into();
        assert_eq!(worker.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_pipeline_errors_map_to_status() {
        let threshold: ApiError = PipelineError::InvalidThreshold {
            name: "plate",
            value: 3.0,
        }
        .into();
        assert_eq!(threshold.status(), StatusCode::BAD_REQUEST);

        let mismatch: ApiError = PoolError::Pipeline(PipelineError::AlphabetMismatch {
            class_id: 99,
            alphabet_len: 35,
            version: "v5".to_string(),
        })
        .into();
        assert_eq!(mismatch.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
