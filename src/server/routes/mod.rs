//! Gateway routes

use super::{ErrorBody, GatewayState};
use crate::error::{Error, ErrorCategory};
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};

pub mod health;
pub mod predict;

pub fn create_router() -> Router<GatewayState> {
    Router::new()
        .route("/predict", post(predict::predict))
        .route("/health", get(health::health))
}

/// HTTP status for a library error, chosen so the caller can tell rejected
/// input from an unreachable or slow backend.
pub fn status_for(err: &Error) -> StatusCode {
    match (err, err.category()) {
        (Error::Rpc { .. }, _) => StatusCode::BAD_GATEWAY,
        (_, ErrorCategory::InputRejected) => StatusCode::UNPROCESSABLE_ENTITY,
        (_, ErrorCategory::Unreachable) => StatusCode::SERVICE_UNAVAILABLE,
        (_, ErrorCategory::Transient) => StatusCode::GATEWAY_TIMEOUT,
        (_, ErrorCategory::Fatal) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn error_response(err: Error) -> Response {
    let status = status_for(&err);
    let body = ErrorBody {
        kind: Some(err.category().as_str().to_string()),
        error: err.to_string(),
    };
    (status, Json(body)).into_response()
}
