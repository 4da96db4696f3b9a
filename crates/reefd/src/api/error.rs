//! API error type and JSON error responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use reef_cluster::ClusterError;
use reef_reconcile::VolumeError;
use serde::Serialize;

/// Errors returned by API handlers.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// An error from the volume service.
    #[error(transparent)]
    Volume(#[from] VolumeError),

    /// An error from the node registry.
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    /// Malformed or unsupported request.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Description of the problem.
        message: String,
    },
}

/// JSON body of an error response.
#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Map to an HTTP status code.
    fn status_code(&self) -> StatusCode {
        match self {
            Self::Volume(e) => match e {
                VolumeError::NotFound(_) => StatusCode::NOT_FOUND,
                VolumeError::Conflict { .. } => StatusCode::CONFLICT,
                VolumeError::NodeUnreachable(_) => StatusCode::SERVICE_UNAVAILABLE,
                VolumeError::InsufficientPools { .. } => StatusCode::INSUFFICIENT_STORAGE,
                VolumeError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Cluster(ClusterError::NodeNotFound(_)) => StatusCode::NOT_FOUND,
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable machine-readable error code.
    fn code(&self) -> &'static str {
        match self {
            Self::Volume(e) => match e {
                VolumeError::NotFound(_) => "NotFound",
                VolumeError::Conflict { .. } => "Conflict",
                VolumeError::NodeUnreachable(_) => "NodeUnreachable",
                VolumeError::InsufficientPools { .. } => "InsufficientPools",
                VolumeError::InvalidArgument(_) => "InvalidArgument",
                _ => "Internal",
            },
            Self::Cluster(ClusterError::NodeNotFound(_)) => "NodeNotFound",
            Self::InvalidRequest { .. } => "InvalidRequest",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        }
        let body = ErrorBody {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
