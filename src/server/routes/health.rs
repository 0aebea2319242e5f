//! `GET /health`

use super::error_response;
use crate::server::GatewayState;
use axum::{
    extract::State,
    response::{IntoResponse, Response},
    Json,
};

/// 200 when the upstream host is live and the configured model is ready.
pub async fn health(State(state): State<GatewayState>) -> Response {
    match state.client.health().await {
        Ok(()) => {
            let config = state.client.config();
            Json(serde_json::json!({
                "status": "healthy",
                "backend": state.client.backend_name(),
                "model": config.model_name,
                "version": config.model_version,
            }))
            .into_response()
        }
        Err(e) => error_response(e),
    }
}
