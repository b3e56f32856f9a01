//! HTTP error responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_core::{ErrorCategory, FerryError};

/// An error answered before any response body was streamed.
///
/// Docker clients print the body verbatim, so it is plain text.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_IMPLEMENTED, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }

    /// Prefix the message with what was being attempted.
    pub fn context(mut self, action: &str) -> Self {
        self.message = format!("{}: {}", action, self.message);
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

/// Map a ferry error to the status its category is answered with.
pub fn status_for(err: &FerryError) -> StatusCode {
    match (err.category(), err) {
        (_, FerryError::NotImplemented(_)) => StatusCode::NOT_IMPLEMENTED,
        (ErrorCategory::Validation, _) => StatusCode::BAD_REQUEST,
        (_, FerryError::WorkloadNotFound(_)) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<FerryError> for ApiError {
    fn from(err: FerryError) -> Self {
        let status = status_for(&err);
        if status.is_server_error() {
            tracing::error!(error = %err, "Request failed");
        }
        Self::new(status, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_maps_to_bad_request() {
        let err = ApiError::from(FerryError::invalid_parameter("cpushares", "512", "expected 0"));
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("cpushares"));
    }

    #[test]
    fn test_not_implemented() {
        let err = ApiError::from(FerryError::NotImplemented("platform".to_string()));
        assert_eq!(err.status, StatusCode::NOT_IMPLEMENTED);
        assert_eq!(err.message, "platform is not supported");
    }

    #[test]
    fn test_credentials_and_transfer_are_internal() {
        assert_eq!(
            status_for(&FerryError::Credentials("bad base64".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            status_for(&FerryError::MissingChunk("ab".to_string())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_context_prefix() {
        let err = ApiError::internal("boom").context("restore context");
        assert_eq!(err.message, "restore context: boom");
    }
}
