//! JSON/REST gateway in front of a tensor RPC backend.
//!
//! - `POST /predict` takes `{"state": [...], "image": nested array}` in HWC or CHW
//! - `GET /health` is 200 only when the upstream host is live and the model ready
//! - `GET /` reports the service banner

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit, http::StatusCode, response::IntoResponse, routing::get, Json,
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;

pub mod routes;
pub mod state;

pub use state::GatewayState;

/// Body of `POST /predict`. Both fields are nested JSON arrays.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub state: serde_json::Value,
    pub image: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictResponse {
    pub action: Vec<f32>,
}

/// Error body returned with every non-2xx answer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(default)]
    pub kind: Option<String>,
}

/// Create the gateway router
pub fn create_app(state: GatewayState) -> Router {
    let timeout = state.settings.request_timeout();
    let body_limit = state.settings.max_body_bytes;

    Router::new()
        .route("/", get(banner))
        .merge(routes::create_router())
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TimeoutLayer::with_status_code(StatusCode::GATEWAY_TIMEOUT, timeout))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn banner() -> impl IntoResponse {
    Json(serde_json::json!({
        "service": "policyserve-gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": ["/predict", "/health"]
    }))
}

/// Start the gateway and run until `shutdown` resolves.
pub async fn start_server<F>(addr: SocketAddr, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, shutdown).await
}

/// Serve on an already-bound listener.
pub async fn serve<F>(listener: TcpListener, state: GatewayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = create_app(state);
    info!("Starting gateway on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    info!("Gateway stopped");
    Ok(())
}
