//! Arrow Flight front end for a [`ServingHost`].
//!
//! - `Handshake` answers liveness
//! - `GetFlightInfo` on `[model, version]` answers readiness
//! - `DoExchange` carries request batches in and one response batch per request out
//! - `DoAction` serves `health` and `model_metadata`

use super::host::{InferenceRequest, ServingHost};
use crate::constants::defaults;
use crate::constants::protocol::{HEALTH_ACTION, METADATA_ACTION};
use crate::wire::{self, ModelMetadata, TensorNames};
use arrow::ipc::writer::IpcWriteOptions;
use arrow_flight::{
    decode::FlightRecordBatchStream,
    encode::FlightDataEncoderBuilder,
    error::FlightError,
    flight_service_server::{FlightService, FlightServiceServer},
    Action as FlightAction, ActionType, Criteria, Empty, FlightData, FlightDescriptor, FlightInfo,
    HandshakeRequest, HandshakeResponse, PollInfo, PutResult, Result as FlightResult, SchemaAsIpc,
    SchemaResult, Ticket,
};
use arrow::record_batch::RecordBatch;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use std::sync::Arc;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, warn};

/// Flight service answering inference requests for one model.
#[derive(Clone)]
pub struct PolicyFlightService {
    host: Arc<ServingHost>,
    names: Arc<TensorNames>,
}

impl PolicyFlightService {
    pub fn new(host: Arc<ServingHost>, names: TensorNames) -> Self {
        Self {
            host,
            names: Arc::new(names),
        }
    }

    pub fn host(&self) -> &Arc<ServingHost> {
        &self.host
    }

    pub fn into_server(self) -> FlightServiceServer<Self> {
        FlightServiceServer::new(self)
            .max_decoding_message_size(defaults::RPC_MAX_MESSAGE_BYTES)
            .max_encoding_message_size(defaults::RPC_MAX_MESSAGE_BYTES)
    }

    /// Model metadata as reported by the `model_metadata` action.
    pub fn metadata(&self) -> ModelMetadata {
        let policy = self.host.policy();
        let pipeline = policy.pipeline();
        ModelMetadata::describe(
            &self.names,
            self.host.model_name(),
            self.host.model_version(),
            policy.device(),
            self.host.is_ready(),
            pipeline.state_dim(),
            pipeline.image_hw(),
            policy.action_dim(),
        )
    }

    /// Check that a descriptor names the served model and version.
    fn check_descriptor(&self, descriptor: &FlightDescriptor) -> Result<(), Status> {
        match descriptor.path.as_slice() {
            [name, version] if self.host.serves(name, version) => Ok(()),
            [name, version] => Err(Status::not_found(format!(
                "Model {} version {} is not served here",
                name, version
            ))),
            other => Err(Status::invalid_argument(format!(
                "Descriptor path must be [model, version], got {:?}",
                other
            ))),
        }
    }

    fn action_result(body: serde_json::Value) -> Result<FlightResult, Status> {
        let body = serde_json::to_vec(&body)
            .map_err(|e| Status::internal(format!("Failed to serialize action result: {}", e)))?;
        Ok(FlightResult { body: body.into() })
    }

    fn encode_results(&self, requests: Vec<InferenceRequest>) -> Result<Vec<RecordBatch>, Status> {
        let results = self.host.process_batch(requests);
        results
            .into_iter()
            .map(|result| match result {
                Ok(response) => wire::encode_action(&self.names, response.action.into_vec()),
                Err(err) => wire::encode_failure(&self.names, err.kind.row_status(), &err.message),
            })
            .collect::<crate::Result<Vec<_>>>()
            .map_err(Status::from)
    }
}

#[tonic::async_trait]
impl FlightService for PolicyFlightService {
    type HandshakeStream = BoxStream<'static, Result<HandshakeResponse, Status>>;
    type ListFlightsStream = BoxStream<'static, Result<FlightInfo, Status>>;
    type DoGetStream = BoxStream<'static, Result<FlightData, Status>>;
    type DoPutStream = BoxStream<'static, Result<PutResult, Status>>;
    type DoActionStream = BoxStream<'static, Result<FlightResult, Status>>;
    type ListActionsStream = BoxStream<'static, Result<ActionType, Status>>;
    type DoExchangeStream = BoxStream<'static, Result<FlightData, Status>>;

    async fn handshake(
        &self,
        request: Request<Streaming<HandshakeRequest>>,
    ) -> Result<Response<Self::HandshakeStream>, Status> {
        let mut stream = request.into_inner();
        let response_stream = async_stream::try_stream! {
            while let Some(request) = stream.next().await {
                let request = request?;
                yield HandshakeResponse {
                    protocol_version: request.protocol_version,
                    payload: request.payload,
                };
            }
        };
        Ok(Response::new(Box::pin(response_stream)))
    }

    async fn list_flights(
        &self,
        _request: Request<Criteria>,
    ) -> Result<Response<Self::ListFlightsStream>, Status> {
        let descriptor = FlightDescriptor::new_path(vec![
            self.host.model_name().to_string(),
            self.host.model_version().to_string(),
        ]);
        let info = FlightInfo::new()
            .try_with_schema(&wire::request_schema(&self.names))
            .map_err(|e| Status::internal(format!("Failed to set schema: {}", e)))?
            .with_descriptor(descriptor);
        Ok(Response::new(Box::pin(stream::iter(vec![Ok(info)]))))
    }

    async fn get_flight_info(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<FlightInfo>, Status> {
        let descriptor = request.into_inner();
        self.check_descriptor(&descriptor)?;
        if !self.host.is_ready() {
            return Err(Status::unavailable(format!(
                "Model {} version {} is not ready",
                self.host.model_name(),
                self.host.model_version()
            )));
        }

        let info = FlightInfo::new()
            .try_with_schema(&wire::request_schema(&self.names))
            .map_err(|e| Status::internal(format!("Failed to set schema: {}", e)))?
            .with_descriptor(descriptor);
        Ok(Response::new(info))
    }

    async fn poll_flight_info(
        &self,
        _request: Request<FlightDescriptor>,
    ) -> Result<Response<PollInfo>, Status> {
        Err(Status::unimplemented("poll_flight_info is not supported"))
    }

    async fn get_schema(
        &self,
        request: Request<FlightDescriptor>,
    ) -> Result<Response<SchemaResult>, Status> {
        self.check_descriptor(request.get_ref())?;
        let schema = wire::request_schema(&self.names);
        let options = IpcWriteOptions::default();
        let result = SchemaResult::try_from(SchemaAsIpc::new(&schema, &options))
            .map_err(|e| Status::internal(format!("Failed to encode schema: {}", e)))?;
        Ok(Response::new(result))
    }

    async fn do_get(
        &self,
        _request: Request<Ticket>,
    ) -> Result<Response<Self::DoGetStream>, Status> {
        Err(Status::unimplemented("use DoExchange for inference"))
    }

    async fn do_put(
        &self,
        _request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoPutStream>, Status> {
        Err(Status::unimplemented("use DoExchange for inference"))
    }

    async fn do_exchange(
        &self,
        request: Request<Streaming<FlightData>>,
    ) -> Result<Response<Self::DoExchangeStream>, Status> {
        let mut stream = request.into_inner();
        let first = stream
            .message()
            .await?
            .ok_or_else(|| Status::invalid_argument("Empty exchange"))?;
        let descriptor = first
            .flight_descriptor
            .clone()
            .ok_or_else(|| Status::invalid_argument("First message must carry a flight descriptor"))?;
        self.check_descriptor(&descriptor)?;

        let input = stream::once(async move { Ok::<_, Status>(first) })
            .chain(stream)
            .map_err(FlightError::from);
        let batches: Vec<RecordBatch> = FlightRecordBatchStream::new_from_flight_data(input)
            .try_collect()
            .await
            .map_err(Status::from)?;

        let mut requests = Vec::new();
        for batch in &batches {
            let rows = wire::decode_requests(&self.names, batch).map_err(Status::from)?;
            requests.extend(rows.into_iter().map(InferenceRequest::from));
        }
        debug!(requests = requests.len(), "Exchange received");

        let service = self.clone();
        let responses = tokio::task::spawn_blocking(move || service.encode_results(requests))
            .await
            .map_err(|e| Status::internal(format!("Batch worker failed: {}", e)))??;

        let output = FlightDataEncoderBuilder::new()
            .with_schema(wire::response_schema(&self.names))
            .build(stream::iter(responses.into_iter().map(Ok)))
            .map_err(Status::from);
        Ok(Response::new(Box::pin(output)))
    }

    async fn do_action(
        &self,
        request: Request<FlightAction>,
    ) -> Result<Response<Self::DoActionStream>, Status> {
        let action = request.into_inner();
        let result = match action.r#type.as_str() {
            HEALTH_ACTION => Self::action_result(json!({
                "live": true,
                "ready": self.host.is_ready(),
                "model": self.host.model_name(),
                "version": self.host.model_version(),
            }))?,
            METADATA_ACTION => {
                let metadata = serde_json::to_value(self.metadata())
                    .map_err(|e| Status::internal(format!("Failed to serialize metadata: {}", e)))?;
                Self::action_result(metadata)?
            }
            other => {
                warn!(action = other, "Unknown action");
                return Err(Status::invalid_argument(format!("Unknown action: {}", other)));
            }
        };
        Ok(Response::new(Box::pin(stream::iter(vec![Ok(result)]))))
    }

    async fn list_actions(
        &self,
        _request: Request<Empty>,
    ) -> Result<Response<Self::ListActionsStream>, Status> {
        let actions = vec![
            Ok(ActionType {
                r#type: HEALTH_ACTION.to_string(),
                description: "Host liveness and model readiness".to_string(),
            }),
            Ok(ActionType {
                r#type: METADATA_ACTION.to_string(),
                description: "Served model name, version, tensors and device".to_string(),
            }),
        ];
        Ok(Response::new(Box::pin(stream::iter(actions))))
    }
}

