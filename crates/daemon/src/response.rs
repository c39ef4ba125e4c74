//! Response envelope shared by every endpoint

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use hearth_cluster::ErrorKind;
use hearth_instances::InstanceError;
use hearth_network::NetworkError;
use hearth_operations::{Operation, OperationError};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::error;

/// A successful response
#[derive(Debug)]
pub enum ApiResponse {
    /// Immediate result
    Sync(Value),
    /// Background operation to poll
    Async(Operation),
}

impl ApiResponse {
    /// Sync response carrying `metadata`
    pub fn sync(metadata: impl Serialize) -> Result<Self, ApiError> {
        serde_json::to_value(metadata)
            .map(Self::Sync)
            .map_err(|e| ApiError::new(ErrorKind::Internal, format!("Failed to encode response: {e}")))
    }
}

impl IntoResponse for ApiResponse {
    fn into_response(self) -> Response {
        match self {
            Self::Sync(metadata) => (
                StatusCode::OK,
                Json(json!({
                    "type": "sync",
                    "status": "Success",
                    "status_code": 200,
                    "metadata": metadata,
                })),
            )
                .into_response(),
            Self::Async(operation) => {
                let url = operation.url();
                (
                    StatusCode::ACCEPTED,
                    [(axum::http::header::LOCATION, url.clone())],
                    Json(json!({
                        "type": "async",
                        "status": "Operation created",
                        "status_code": 100,
                        "operation": url,
                        "metadata": operation,
                    })),
                )
                    .into_response()
            }
        }
    }
}

/// An error response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    kind: ErrorKind,
    message: String,
}

impl ApiError {
    /// Create an error of `kind`
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Bad request
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    /// Error kind
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// HTTP status for the error kind
    pub fn status(&self) -> StatusCode {
        match self.kind {
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Forbidden => StatusCode::FORBIDDEN,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::InvalidArgument | ErrorKind::InvalidToken => StatusCode::BAD_REQUEST,
            ErrorKind::Unavailable => StatusCode::SERVICE_UNAVAILABLE,
            ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ErrorKind::Internal | ErrorKind::NotLeader => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.message);
        }

        (
            status,
            Json(json!({
                "type": "error",
                "error": self.message,
                "error_code": status.as_u16(),
            })),
        )
            .into_response()
    }
}

impl From<hearth_cluster::Error> for ApiError {
    fn from(e: hearth_cluster::Error) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<NetworkError> for ApiError {
    fn from(e: NetworkError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<InstanceError> for ApiError {
    fn from(e: InstanceError) -> Self {
        Self::new(e.kind(), e.to_string())
    }
}

impl From<OperationError> for ApiError {
    fn from(e: OperationError) -> Self {
        let kind = match &e {
            OperationError::NotFound(_) => ErrorKind::NotFound,
            OperationError::Unavailable(_) => ErrorKind::Unavailable,
            OperationError::InvalidState(_) => ErrorKind::Conflict,
            OperationError::Timeout { .. } => ErrorKind::Timeout,
        };
        Self::new(kind, e.to_string())
    }
}

/// Result type for handlers
pub type ApiResult = Result<ApiResponse, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ErrorKind::NotFound, 404),
            (ErrorKind::Forbidden, 403),
            (ErrorKind::Conflict, 409),
            (ErrorKind::InvalidArgument, 400),
            (ErrorKind::InvalidToken, 400),
            (ErrorKind::Unavailable, 503),
            (ErrorKind::Timeout, 504),
            (ErrorKind::Internal, 500),
            (ErrorKind::NotLeader, 500),
        ];
        for (kind, code) in cases {
            assert_eq!(ApiError::new(kind, "x").status().as_u16(), code, "{kind:?}");
        }
    }

    #[test]
    fn test_operation_timeout_is_gateway_timeout() {
        let err = ApiError::from(OperationError::Timeout {
            id: "abc".to_string(),
            waited: std::time::Duration::from_secs(1),
        });
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    }
}
