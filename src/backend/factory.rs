//! Resolve a [`BackendConfig`] into a constructed, health-checked backend.

use super::{FlightBackend, GatewayBackend, InferenceBackend, LocalBackend};
use crate::config::{BackendConfig, BackendKind};
use crate::error::{Error, Result};
use tracing::info;

pub struct BackendFactory;

impl BackendFactory {
    /// Validate `config` and build the selected backend. Each variant runs its
    /// construction-time check before this returns.
    pub async fn create(config: &BackendConfig) -> Result<Box<dyn InferenceBackend>> {
        config.validate()?;
        info!(
            kind = %config.kind,
            model = %config.model_name,
            version = %config.model_version,
            "Creating inference backend"
        );

        let backend: Box<dyn InferenceBackend> = match config.kind {
            BackendKind::Local => {
                let config = config.clone();
                let backend = tokio::task::spawn_blocking(move || LocalBackend::load(&config))
                    .await
                    .map_err(|e| Error::Load(format!("model loading task failed: {}", e)))??;
                Box::new(backend)
            }
            BackendKind::TensorRpc => Box::new(FlightBackend::connect(config).await?),
            BackendKind::Gateway => Box::new(GatewayBackend::connect(config).await?),
        };
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_config_fails_before_construction() {
        let config = BackendConfig {
            kind: BackendKind::TensorRpc,
            endpoint: None,
            ..Default::default()
        };
        assert!(matches!(
            BackendFactory::create(&config).await,
            Err(Error::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_checkpoint_is_load_error() {
        let config = BackendConfig {
            kind: BackendKind::Local,
            checkpoint_dir: Some("/nonexistent/checkpoint".into()),
            ..Default::default()
        };
        assert!(matches!(
            BackendFactory::create(&config).await,
            Err(Error::Load(_))
        ));
    }
}
