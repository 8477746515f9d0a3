//! Mapping of lifecycle errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use modelplane_core::{ErrorKind, ModelPlaneError};
use serde::Serialize;
use thiserror::Error;

/// Error returned by every handler
#[derive(Debug, Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub ModelPlaneError);

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    retryable: bool,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            ModelPlaneError::SizeLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ModelPlaneError::VersionConflict(_) | ModelPlaneError::DuplicateTask(_) => {
                StatusCode::CONFLICT
            }
            e => match e.kind() {
                ErrorKind::Validation => StatusCode::BAD_REQUEST,
                ErrorKind::ResourceNotFound => StatusCode::NOT_FOUND,
                ErrorKind::LimitExceeded => StatusCode::TOO_MANY_REQUESTS,
                ErrorKind::Integrity => StatusCode::UNPROCESSABLE_ENTITY,
                ErrorKind::TransientInfra => StatusCode::SERVICE_UNAVAILABLE,
                ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: self.0.to_string(),
            retryable: self.0.is_retryable(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let status = |e: ModelPlaneError| ApiError(e).status();
        assert_eq!(status(ModelPlaneError::validation("bad")), StatusCode::BAD_REQUEST);
        assert_eq!(status(ModelPlaneError::not_found("m1")), StatusCode::NOT_FOUND);
        assert_eq!(
            status(ModelPlaneError::SizeLimitExceeded { size: 2, limit: 1 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status(ModelPlaneError::limit_exceeded("throttled")),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            status(ModelPlaneError::VersionConflict("g1".to_string())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status(ModelPlaneError::Integrity("hash".to_string())),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status(ModelPlaneError::TransientInfra("down".to_string())),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status(ModelPlaneError::NoEligibleNodes("none".to_string())),
            StatusCode::BAD_REQUEST
        );
    }
}
