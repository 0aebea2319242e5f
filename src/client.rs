//! Client facade over a configured inference backend.
//!
//! Callers hold one [`InferenceClient`] per backend and call
//! [`InferenceClient::predict`] once per control step. The synchronous
//! [`BlockingInferenceClient`] wraps the same facade for simulation loops and
//! robot bridges that do not run inside an async runtime.

use crate::backend::{BackendFactory, InferenceBackend};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::normalize::{Action, NormalizationPipeline, Observation};
use std::time::Instant;
use tokio::runtime::Runtime;
use tracing::{debug, info};

/// Observation-to-action client bound to exactly one backend.
pub struct InferenceClient {
    backend: Box<dyn InferenceBackend>,
    config: BackendConfig,
}

impl std::fmt::Debug for InferenceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceClient")
            .field("backend", &self.backend.name())
            .field("config", &self.config)
            .finish()
    }
}

impl InferenceClient {
    /// Build the backend selected by `config`. Fails if the backend cannot be
    /// constructed or does not pass its construction-time check.
    pub async fn connect(config: BackendConfig) -> Result<Self> {
        let backend = BackendFactory::create(&config).await?;
        info!(backend = backend.name(), "Inference client ready");
        Ok(Self { backend, config })
    }

    /// Wrap an already-constructed backend.
    pub fn with_backend(backend: Box<dyn InferenceBackend>, config: BackendConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn pipeline(&self) -> NormalizationPipeline {
        self.config.pipeline()
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Run one observation through the backend and wait for the action.
    pub async fn predict(&self, observation: &Observation) -> Result<Action> {
        let start = Instant::now();
        let result = self.backend.predict(observation).await;
        debug!(
            backend = self.backend.name(),
            latency_ms = start.elapsed().as_secs_f64() * 1000.0,
            ok = result.is_ok(),
            "predict"
        );
        result
    }

    pub async fn health(&self) -> Result<()> {
        self.backend.health().await
    }

    /// Tear the backend down. The client cannot be used afterwards.
    pub async fn close(self) -> Result<()> {
        info!(backend = self.backend.name(), "Closing inference client");
        self.backend.close().await
    }
}

/// Synchronous wrapper that owns its own tokio runtime.
pub struct BlockingInferenceClient {
    inner: InferenceClient,
    runtime: Runtime,
}

impl BlockingInferenceClient {
    pub fn connect(config: BackendConfig) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("policyserve-client")
            .enable_all()
            .build()
            .map_err(Error::Io)?;
        let inner = runtime.block_on(InferenceClient::connect(config))?;
        Ok(Self { inner, runtime })
    }

    pub fn config(&self) -> &BackendConfig {
        self.inner.config()
    }

    pub fn predict(&self, observation: &Observation) -> Result<Action> {
        self.runtime.block_on(self.inner.predict(observation))
    }

    pub fn health(&self) -> Result<()> {
        self.runtime.block_on(self.inner.health())
    }

    pub fn close(self) -> Result<()> {
        let Self { inner, runtime } = self;
        runtime.block_on(inner.close())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl InferenceBackend for CountingBackend {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn predict(&self, observation: &Observation) -> Result<Action> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Action::new(observation.state.data().to_vec()))
        }

        async fn health(&self) -> Result<()> {
            Ok(())
        }

        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_predict_delegates_to_backend() {
        let calls = Arc::new(AtomicUsize::new(0));
        let client = InferenceClient::with_backend(
            Box::new(CountingBackend {
                calls: calls.clone(),
            }),
            BackendConfig::default(),
        );

        let image = crate::tensor::HostTensor::new(vec![4, 4, 3], vec![0u8; 48]).unwrap();
        let obs = Observation::new(vec![1.0, 2.0], image);
        let action = client.predict(&obs).await.unwrap();
        assert_eq!(&action[..], &[1.0, 2.0]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(client.backend_name(), "counting");
        client.close().await.unwrap();
    }
}
