//! Checkpoint directory produced by training.
//!
//! A checkpoint is a directory holding `model.safetensors` and, optionally, the
//! normalizer statistics file written by the training preprocessor.

use crate::constants::artifact::{ACTION_MEAN_KEY, ACTION_STD_KEY, STATS_FILE, WEIGHTS_FILE};
use crate::error::{Error, Result};
use crate::normalize::NormalizationStats;
use candle_core::{DType, Device, Tensor};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct Checkpoint {
    dir: PathBuf,
    weights: PathBuf,
    stats: PathBuf,
}

impl Checkpoint {
    /// Open a checkpoint directory using the default stats file name.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_stats(dir, STATS_FILE)
    }

    pub fn open_with_stats(dir: impl AsRef<Path>, stats_file: &str) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(Error::Load(format!(
                "checkpoint directory {} does not exist",
                dir.display()
            )));
        }
        let weights = dir.join(WEIGHTS_FILE);
        if !weights.is_file() {
            return Err(Error::Load(format!(
                "weights file {} is missing",
                weights.display()
            )));
        }
        let stats = dir.join(stats_file);
        Ok(Self {
            dir,
            weights,
            stats,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn weights_path(&self) -> &Path {
        &self.weights
    }

    pub fn stats_path(&self) -> &Path {
        &self.stats
    }

    /// Load every tensor in the weights file onto `device`.
    pub fn load_weights(&self, device: &Device) -> Result<HashMap<String, Tensor>> {
        let tensors = candle_core::safetensors::load(&self.weights, device).map_err(|e| {
            Error::Load(format!(
                "Failed to load weights from {}: {}",
                self.weights.display(),
                e
            ))
        })?;
        debug!(path = %self.weights.display(), tensors = tensors.len(), "Loaded weights");
        Ok(tensors)
    }

    /// Read action statistics. A missing file means the model emits physical
    /// units already; a file without both keys is corrupt.
    pub fn load_stats(&self) -> Result<Option<NormalizationStats>> {
        if !self.stats.is_file() {
            warn!(
                path = %self.stats.display(),
                "No normalization stats found, actions will not be denormalized"
            );
            return Ok(None);
        }

        let tensors = candle_core::safetensors::load(&self.stats, &Device::Cpu).map_err(|e| {
            Error::Load(format!(
                "Failed to load stats from {}: {}",
                self.stats.display(),
                e
            ))
        })?;
        let mean = stats_vector(&tensors, ACTION_MEAN_KEY, &self.stats)?;
        let std = stats_vector(&tensors, ACTION_STD_KEY, &self.stats)?;
        NormalizationStats::new(mean, std).map(Some)
    }
}

fn stats_vector(tensors: &HashMap<String, Tensor>, key: &str, path: &Path) -> Result<Vec<f32>> {
    let tensor = tensors.get(key).ok_or_else(|| {
        Error::Load(format!("stats file {} has no '{}' entry", path.display(), key))
    })?;
    tensor
        .to_dtype(DType::F32)
        .and_then(|t| t.flatten_all())
        .and_then(|t| t.to_vec1::<f32>())
        .map_err(|e| Error::Load(format!("invalid '{}' in {}: {}", key, path.display(), e)))
}
