//! JSON/REST gateway backend.

use super::{InferenceBackend, Lifecycle};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::normalize::{Action, Observation};
use crate::server::{ErrorBody, PredictResponse};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Posts raw observations to a gateway that fronts a tensor RPC backend.
///
/// The image is sent in whatever layout the caller holds; the gateway runs
/// the shared normalization on its side.
#[derive(Debug)]
pub struct GatewayBackend {
    client: Client,
    base_url: String,
    timeout: Duration,
    lifecycle: Lifecycle,
}

impl GatewayBackend {
    /// Build the HTTP client and probe `/health`. An unhealthy or absent
    /// gateway only logs a warning, since it may come up after the caller.
    pub async fn connect(config: &BackendConfig) -> Result<Self> {
        let endpoint = config
            .endpoint
            .as_deref()
            .ok_or_else(|| Error::Config("gateway backend requires an endpoint".into()))?;
        let base_url = if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
            endpoint.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", endpoint.trim_end_matches('/'))
        };
        let timeout = config.timeout();
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to build HTTP client: {}", e)))?;

        let backend = Self {
            client,
            base_url,
            timeout,
            lifecycle: Lifecycle::default(),
        };
        match backend.check_health().await {
            Ok(()) => info!(url = %backend.base_url, "Gateway backend ready"),
            Err(e) => warn!(url = %backend.base_url, error = %e, "Gateway health check failed, continuing"),
        }
        Ok(backend)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn transport_error(&self, operation: &'static str, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            return Error::Timeout {
                operation,
                after: self.timeout,
            };
        }
        Error::Gateway {
            status: e.status().map(|s| s.as_u16()),
            message: e.to_string(),
            source: Some(Box::new(e)),
        }
    }

    /// Turn a non-2xx answer into a gateway error carrying the status code.
    async fn reject(response: Response) -> Error {
        let status = response.status();
        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("unexpected response")
                .to_string(),
        };
        Error::Gateway {
            status: Some(status.as_u16()),
            message,
            source: None,
        }
    }

    async fn check_health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map_err(|e| self.transport_error("gateway health check", e))?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }
        Ok(())
    }
}

#[async_trait]
impl InferenceBackend for GatewayBackend {
    fn name(&self) -> &'static str {
        "gateway"
    }

    async fn predict(&self, observation: &Observation) -> Result<Action> {
        self.lifecycle.ensure_open(self.name())?;
        let body = json!({
            "state": observation.state.to_nested_json(),
            "image": observation.image.to_nested_json(),
        });

        let response = self
            .client
            .post(format!("{}/predict", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error("gateway predict", e))?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }

        let parsed: PredictResponse = response
            .json()
            .await
            .map_err(|e| self.transport_error("gateway predict", e))?;
        debug!(action_dim = parsed.action.len(), "Gateway prediction received");
        Ok(Action::new(parsed.action))
    }

    async fn health(&self) -> Result<()> {
        self.lifecycle.ensure_open(self.name())?;
        self.check_health().await
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.close() {
            debug!(url = %self.base_url, "Gateway backend closed");
        }
        Ok(())
    }
}
