//! In-process backend.

use super::{InferenceBackend, Lifecycle};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::model::LoadedPolicy;
use crate::normalize::{Action, Observation};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

/// Runs the policy inside the calling process.
///
/// The forward pass runs on the blocking pool so async callers are not stalled.
#[derive(Debug)]
pub struct LocalBackend {
    policy: Arc<LoadedPolicy>,
    lifecycle: Lifecycle,
}

impl LocalBackend {
    /// Load weights and stats from the configured checkpoint onto the selected device.
    pub fn load(config: &BackendConfig) -> Result<Self> {
        let dir = config
            .checkpoint_dir
            .as_ref()
            .ok_or_else(|| Error::Config("local backend requires a checkpoint directory".into()))?;
        let policy = LoadedPolicy::load(dir, &config.stats_file, config.device, config.pipeline())?;
        info!(checkpoint = %dir.display(), device = policy.device(), "Local backend ready");
        Ok(Self::from_policy(policy))
    }

    pub fn from_policy(policy: LoadedPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn policy(&self) -> &LoadedPolicy {
        &self.policy
    }
}

#[async_trait]
impl InferenceBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn predict(&self, observation: &Observation) -> Result<Action> {
        self.lifecycle.ensure_open(self.name())?;
        let encoded = self.policy.pipeline().encode(observation)?;
        let policy = Arc::clone(&self.policy);
        tokio::task::spawn_blocking(move || policy.infer(&encoded))
            .await
            .map_err(|e| Error::Inference(format!("inference task failed: {}", e)))?
    }

    async fn health(&self) -> Result<()> {
        self.lifecycle.ensure_open(self.name())?;
        if self.policy.is_loaded() {
            Ok(())
        } else {
            Err(Error::Cancelled("model has been released".into()))
        }
    }

    async fn close(&self) -> Result<()> {
        if self.lifecycle.close() {
            let policy = Arc::clone(&self.policy);
            tokio::task::spawn_blocking(move || policy.release())
                .await
                .map_err(|e| Error::Inference(format!("release task failed: {}", e)))?;
            debug!("Local backend closed");
        }
        Ok(())
    }
}
