use crate::auth::BearerError;
use crate::error::{ErrorKind, Failure};
use crate::provider::Provider;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;

/// Error response
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct OperationFailure {
    success: bool,
    error: Failure,
}

#[derive(Serialize)]
struct TokenUnavailable {
    connected: bool,
    error: Failure,
}

/// Application error types for provider endpoints
#[derive(Debug)]
pub(crate) enum AppError {
    BadRequest(String),
    Unauthorized(String),
    NotFound(String),
    ServerError(String),
    /// Failed credential operation: `{success: false, error}`
    Operation(Failure),
    /// No usable token: `{connected: false, error}`
    TokenUnavailable(Failure),
}

impl AppError {
    pub(crate) fn unauthenticated(e: BearerError) -> Self {
        AppError::Operation(Failure::new(ErrorKind::NoAuthenticatedUser, e.to_string()))
    }
}

pub(crate) fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::NoAuthenticatedUser | ErrorKind::RefreshTokenMissing => StatusCode::UNAUTHORIZED,
        ErrorKind::NoProviderTokenFound => StatusCode::NOT_FOUND,
        ErrorKind::CodeExchangeFailed | ErrorKind::RefreshFailed => StatusCode::BAD_GATEWAY,
        ErrorKind::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ErrorKind::StorageFailed | ErrorKind::DisconnectFailed => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::ServerError(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
            AppError::Operation(failure) => {
                let body = OperationFailure {
                    success: false,
                    error: failure,
                };
                return (status_for(body.error.kind), Json(body)).into_response();
            }
            AppError::TokenUnavailable(failure) => {
                let body = TokenUnavailable {
                    connected: false,
                    error: failure,
                };
                return (status_for(body.error.kind), Json(body)).into_response();
            }
        };

        let body = Json(ErrorResponse {
            error: error_message,
        });

        (status, body).into_response()
    }
}

/// Parses the `:provider` path segment. Callers pick the body shape the
/// failure is reported in.
pub(crate) fn parse_provider(name: &str) -> Result<Provider, Failure> {
    name.parse().map_err(|_| {
        Failure::new(
            ErrorKind::NoProviderTokenFound,
            format!("Provider '{}' not found", name),
        )
    })
}
