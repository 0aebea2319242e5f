//! Tensor RPC backend speaking Arrow Flight to a remote serving host.

use super::{InferenceBackend, Lifecycle};
use crate::config::BackendConfig;
use crate::constants::{defaults, protocol::METADATA_ACTION};
use crate::error::{Error, Result};
use crate::normalize::{decode, Action, NormalizationPipeline, Observation};
use crate::tensor::HostTensor;
use crate::wire::{self, ModelMetadata, TensorNames};
use arrow::record_batch::RecordBatch;
use arrow_flight::{
    decode::FlightRecordBatchStream, encode::FlightDataEncoderBuilder, error::FlightError,
    flight_service_client::FlightServiceClient, Action as FlightAction, FlightData,
    FlightDescriptor, HandshakeRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, TryStreamExt};
use std::future::Future;
use std::time::{Duration, Instant};
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint};
use tracing::{debug, info};

/// Client side of the tensor RPC contract.
///
/// Observations are encoded locally, the host denormalizes, so responses
/// are decoded without stats.
pub struct FlightBackend {
    client: FlightServiceClient<Channel>,
    endpoint: String,
    model_name: String,
    model_version: String,
    names: TensorNames,
    pipeline: NormalizationPipeline,
    timeout: Duration,
    lifecycle: Lifecycle,
}

impl std::fmt::Debug for FlightBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlightBackend")
            .field("endpoint", &self.endpoint)
            .field("model_name", &self.model_name)
            .field("model_version", &self.model_version)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn endpoint_uri(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{}", addr)
    }
}

impl FlightBackend {
    /// Connect and prove the host live and the model ready before returning.
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        let addr = config
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("tensor RPC backend requires an endpoint".into()))?;
        let uri = endpoint_uri(addr);
        let timeout = config.timeout();

        debug!(uri = %uri, "Connecting to tensor RPC server");
        let mut endpoint = Endpoint::from_shared(uri.clone())
            .map_err(|e| Error::Config(format!("invalid endpoint '{}': {}", uri, e)))?
            .connect_timeout(timeout);

        if let Some(ca_path) = &config.tls_ca {
            let ca = std::fs::read(ca_path)?;
            let tls = ClientTlsConfig::new().ca_certificate(Certificate::from_pem(ca));
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|e| Error::Config(format!("invalid TLS configuration: {}", e)))?;
        }

        let channel = endpoint.connect().await.map_err(|e| Error::Connection {
            endpoint: uri.clone(),
            source: Box::new(e),
        })?;

        let backend = Self {
            client: FlightServiceClient::new(channel)
                .max_decoding_message_size(defaults::RPC_MAX_MESSAGE_BYTES)
                .max_encoding_message_size(defaults::RPC_MAX_MESSAGE_BYTES),
            endpoint: uri,
            model_name: config.model_name.clone(),
            model_version: config.model_version.clone(),
            names: config.tensor_names.clone(),
            pipeline: config.pipeline(),
            timeout,
            lifecycle: Lifecycle::default(),
        };
        backend.check_live().await?;
        backend.check_ready().await?;

        info!(
            endpoint = %backend.endpoint,
            model = %backend.model_name,
            version = %backend.model_version,
            "Tensor RPC backend ready"
        );
        Ok(backend)
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn descriptor(&self) -> FlightDescriptor {
        FlightDescriptor::new_path(vec![self.model_name.clone(), self.model_version.clone()])
    }

    async fn deadline<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::time::timeout(self.timeout, call)
            .await
            .map_err(|_| Error::Timeout {
                operation,
                after: self.timeout,
            })?
    }

    async fn check_live(&self) -> Result<()> {
        let mut client = self.client.clone();
        let connection_err = |source: tonic::Status| Error::Connection {
            endpoint: self.endpoint.clone(),
            source: Box::new(source),
        };
        self.deadline("handshake", async {
            let request = stream::iter(vec![HandshakeRequest {
                protocol_version: 0,
                payload: Bytes::new(),
            }]);
            let mut responses = client
                .handshake(request)
                .await
                .map_err(connection_err)?
                .into_inner();
            responses.message().await.map_err(connection_err)?;
            Ok(())
        })
        .await
    }

    async fn check_ready(&self) -> Result<()> {
        let mut client = self.client.clone();
        let descriptor = self.descriptor();
        self.deadline("readiness check", async {
            client
                .get_flight_info(descriptor)
                .await
                .map_err(|status| Error::NotReady {
                    model: self.model_name.clone(),
                    version: self.model_version.clone(),
                    reason: status.message().to_string(),
                })?;
            Ok(())
        })
        .await
    }

    /// Fetch the served model's declared inputs, outputs and device.
    pub async fn model_metadata(&self) -> Result<ModelMetadata> {
        self.lifecycle.ensure_open("tensor_rpc")?;
        let mut client = self.client.clone();
        self.deadline("model metadata", async {
            let action = FlightAction {
                r#type: METADATA_ACTION.to_string(),
                body: Bytes::new(),
            };
            let mut results = client.do_action(action).await?.into_inner();
            let result = results
                .message()
                .await?
                .ok_or_else(|| Error::Serialization("empty model metadata response".into()))?;
            Ok(serde_json::from_slice(&result.body)?)
        })
        .await
    }

    async fn exchange(&self, batch: RecordBatch) -> Result<HostTensor<f32>> {
        let request: Vec<FlightData> = FlightDataEncoderBuilder::new()
            .with_flight_descriptor(Some(self.descriptor()))
            .build(stream::iter(vec![Ok(batch)]))
            .try_collect()
            .await
            .map_err(|e| Error::rpc("Failed to encode request", e))?;

        let mut client = self.client.clone();
        let response = client.do_exchange(stream::iter(request)).await?.into_inner();
        let batches: Vec<RecordBatch> =
            FlightRecordBatchStream::new_from_flight_data(response.map_err(FlightError::from))
                .try_collect()
                .await
                .map_err(|e| Error::rpc("Failed to read response", e))?;

        let batch = batches
            .first()
            .ok_or_else(|| Error::Serialization("response carried no batches".into()))?;
        wire::decode_response(&self.names, batch)
    }
}

#[async_trait]
impl InferenceBackend for FlightBackend {
    fn name(&self) -> &'static str {
        "tensor_rpc"
    }

    async fn predict(&self, observation: &Observation) -> Result<Action> {
        self.lifecycle.ensure_open(self.name())?;
        let encoded = self.pipeline.encode(observation)?;
        let batch = wire::encode_requests(&self.names, vec![encoded])?;

        let start = Instant::now();
        let raw = self.deadline("tensor RPC predict", self.exchange(batch)).await?;
        debug!(elapsed_ms = start.elapsed().as_millis() as u64, "Exchange complete");
        decode(raw, None)
    }

    async fn health(&self) -> Result<()> {
        self.lifecycle.ensure_open(self.name())?;
        self.check_live().await?;
        self.check_ready().await
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.close() {
            debug!(endpoint = %self.endpoint, "Tensor RPC backend closed");
        }
        Ok(())
    }
}
