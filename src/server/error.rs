//! Mapping of ledger errors to HTTP responses.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ledger::core::errors::LedgerError;

/// JSON error body: `{ "error": kind, "message": text }`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    /// Stable error kind.
    pub error: &'static str,
    /// Human-readable description.
    pub message: String,
}

/// Ledger error returned from a handler.
#[derive(Debug)]
pub struct ApiError(pub LedgerError);

impl From<LedgerError> for ApiError {
    fn from(error: LedgerError) -> Self {
        Self(error)
    }
}

/// Result type of the route handlers.
pub type ApiResult<T> = Result<T, ApiError>;

/// HTTP status for a ledger error.
#[must_use]
pub const fn status_for(error: &LedgerError) -> StatusCode {
    match error {
        LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
        LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
        LedgerError::Protected(_) => StatusCode::FORBIDDEN,
        LedgerError::Configuration(_) => StatusCode::PRECONDITION_FAILED,
        LedgerError::Busy(_) => StatusCode::CONFLICT,
        LedgerError::Auth(_) => StatusCode::UNAUTHORIZED,
        LedgerError::RateLimit(_) => StatusCode::TOO_MANY_REQUESTS,
        LedgerError::Network(_) => StatusCode::GATEWAY_TIMEOUT,
        LedgerError::Provider(_) => StatusCode::BAD_GATEWAY,
        LedgerError::InvalidConfig(_)
        | LedgerError::Storage(_)
        | LedgerError::Sqlite(_)
        | LedgerError::Serialization(_)
        | LedgerError::Url(_)
        | LedgerError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() && !self.0.is_gateway_error() {
            tracing::error!("Request failed: {}", self.0);
        }
        let body = ErrorBody {
            error: self.0.kind(),
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (LedgerError::Validation(String::new()), 400),
            (LedgerError::not_found("chat", "1"), 404),
            (LedgerError::Protected(String::new()), 403),
            (LedgerError::Configuration(String::new()), 412),
            (LedgerError::Busy("1".to_string()), 409),
            (LedgerError::Auth(String::new()), 401),
            (LedgerError::RateLimit(String::new()), 429),
            (LedgerError::Network(String::new()), 504),
            (LedgerError::Provider(String::new()), 502),
            (LedgerError::InvalidConfig(String::new()), 500),
        ];
        for (error, code) in cases {
            assert_eq!(status_for(&error).as_u16(), code, "{error}");
        }
    }
}
