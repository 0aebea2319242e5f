//! `POST /predict`

use super::error_response;
use crate::error::{Error, Result};
use crate::normalize::Observation;
use crate::server::{GatewayState, PredictRequest, PredictResponse};
use crate::tensor::{HostTensor, ImageData};
use axum::{
    extract::{Json, State},
    response::{IntoResponse, Response},
};
use tracing::debug;

/// Build an observation from the JSON body. Layout detection and scaling are
/// left to the shared encoder.
pub fn parse_observation(body: &PredictRequest) -> Result<Observation> {
    let state = HostTensor::<f32>::from_nested_json(&body.state)
        .map_err(|e| Error::shape(format!("state: {}", e)))?;
    let image = ImageData::from_nested_json(&body.image)
        .map_err(|e| Error::shape(format!("image: {}", e)))?;
    Ok(Observation { state, image })
}

pub async fn predict(
    State(state): State<GatewayState>,
    Json(body): Json<PredictRequest>,
) -> Response {
    let observation = match parse_observation(&body) {
        Ok(observation) => observation,
        Err(e) => return error_response(e),
    };
    debug!(
        state = ?observation.state.shape(),
        image = ?observation.image.shape(),
        dtype = observation.image.dtype(),
        "Gateway predict"
    );

    match state.client.predict(&observation).await {
        Ok(action) => Json(PredictResponse {
            action: action.into_vec(),
        })
        .into_response(),
        Err(e) => error_response(e),
    }
}
