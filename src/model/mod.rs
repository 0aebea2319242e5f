//! Policy models and the artifacts they are loaded from.

mod checkpoint;
mod device;
mod linear;

pub use checkpoint::Checkpoint;
pub use device::{device_label, select_device, DevicePreference};
pub use linear::LinearPolicy;

use crate::error::{Error, Result};
use crate::normalize::{decode, Action, EncodedTensor, NormalizationPipeline, NormalizationStats};
use crate::tensor::HostTensor;
use parking_lot::Mutex;
use std::path::Path;
use tracing::info;

/// A model that maps one encoded observation to a raw `[1, A]` output.
///
/// Implementations are not assumed to tolerate concurrent forward passes,
/// hence `&mut self`.
pub trait PolicyModel: Send {
    fn forward(&mut self, input: &EncodedTensor) -> Result<HostTensor<f32>>;

    fn state_dim(&self) -> usize;

    fn action_dim(&self) -> usize;
}

/// A model instance together with the statistics it was trained with.
///
/// The mutex admits one forward pass at a time. Stats never change after load.
pub struct LoadedPolicy {
    model: Mutex<Option<Box<dyn PolicyModel>>>,
    stats: Option<NormalizationStats>,
    pipeline: NormalizationPipeline,
    action_dim: usize,
    device: &'static str,
}

impl std::fmt::Debug for LoadedPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedPolicy")
            .field("pipeline", &self.pipeline)
            .field("action_dim", &self.action_dim)
            .field("device", &self.device)
            .field("has_stats", &self.stats.is_some())
            .finish()
    }
}

impl LoadedPolicy {
    pub fn new(
        model: Box<dyn PolicyModel>,
        stats: Option<NormalizationStats>,
        pipeline: NormalizationPipeline,
        device: &'static str,
    ) -> Result<Self> {
        if model.state_dim() != pipeline.state_dim() {
            return Err(Error::Load(format!(
                "model expects {} state dimensions, pipeline is configured for {}",
                model.state_dim(),
                pipeline.state_dim()
            )));
        }
        if let Some(stats) = &stats {
            if stats.action_dim() != model.action_dim() {
                return Err(Error::Load(format!(
                    "stats describe {} action dimensions, model produces {}",
                    stats.action_dim(),
                    model.action_dim()
                )));
            }
        }
        Ok(Self {
            action_dim: model.action_dim(),
            model: Mutex::new(Some(model)),
            stats,
            pipeline,
            device,
        })
    }

    /// Load the reference [`LinearPolicy`] and its stats from a checkpoint directory.
    pub fn load(
        dir: impl AsRef<Path>,
        stats_file: &str,
        preference: DevicePreference,
        pipeline: NormalizationPipeline,
    ) -> Result<Self> {
        let checkpoint = Checkpoint::open_with_stats(dir, stats_file)?;
        let device = select_device(preference)?;
        let model = LinearPolicy::load(&checkpoint, &device)?;
        let stats = checkpoint.load_stats()?;
        info!(
            checkpoint = %checkpoint.dir().display(),
            device = device_label(&device),
            state_dim = model.state_dim(),
            action_dim = model.action_dim(),
            stats = stats.is_some(),
            "Loaded policy"
        );
        Self::new(Box::new(model), stats, pipeline, device_label(&device))
    }

    pub fn pipeline(&self) -> &NormalizationPipeline {
        &self.pipeline
    }

    pub fn stats(&self) -> Option<&NormalizationStats> {
        self.stats.as_ref()
    }

    pub fn action_dim(&self) -> usize {
        self.action_dim
    }

    pub fn device(&self) -> &'static str {
        self.device
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().is_some()
    }

    /// Check encoded tensors against the configured shapes.
    pub fn validate(&self, input: &EncodedTensor) -> Result<()> {
        self.pipeline.validate(input)
    }

    /// Run one forward pass, waiting for any pass already in progress.
    pub fn forward(&self, input: &EncodedTensor) -> Result<HostTensor<f32>> {
        let mut guard = self.model.lock();
        let model = guard
            .as_mut()
            .ok_or_else(|| Error::Cancelled("model has been released".into()))?;
        model.forward(input)
    }

    pub fn postprocess(&self, raw: HostTensor<f32>) -> Result<Action> {
        decode(raw, self.stats.as_ref())
    }

    /// validate, forward, decode
    pub fn infer(&self, input: &EncodedTensor) -> Result<Action> {
        self.validate(input)?;
        let raw = self.forward(input)?;
        self.postprocess(raw)
    }

    /// Drop the model once any running forward pass has finished.
    /// Returns false when it was already released.
    pub fn release(&self) -> bool {
        self.model.lock().take().is_some()
    }
}
