//! Shared observation and action normalization.
//!
//! Every path that turns an observation into model input goes through [`encode`]
//! and every path that turns model output into an action goes through [`decode`].
//! The in-process backend, the tensor RPC client, the JSON gateway and the
//! serving host all call these functions, so the constants and branch logic
//! exist exactly once.

use crate::constants::imagenet::{MEAN, PIXEL_SCALE, STD};
use crate::error::{Error, Result};
use crate::tensor::{HostTensor, ImageData};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Sensor snapshot handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Joint state, rank 1 of length S
    pub state: HostTensor<f32>,
    /// Camera frame in HWC or CHW layout, optionally with a leading batch of 1
    pub image: ImageData,
}

impl Observation {
    pub fn new(state: Vec<f32>, image: impl Into<ImageData>) -> Self {
        Self {
            state: HostTensor::vector(state),
            image: image.into(),
        }
    }
}

/// Model-ready tensors: state `[1, S]`, image `[1, 3, H, W]`, ImageNet-normalized.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedTensor {
    pub state: HostTensor<f32>,
    pub image: HostTensor<f32>,
}

impl EncodedTensor {
    pub fn state_dim(&self) -> usize {
        self.state.shape().last().copied().unwrap_or(0)
    }

    /// Spatial size `(H, W)` of the encoded image.
    pub fn image_hw(&self) -> (usize, usize) {
        match self.image.shape() {
            [_, _, h, w] => (*h, *w),
            _ => (0, 0),
        }
    }
}

/// Per-dimension action statistics recorded at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizationStats {
    action_mean: Vec<f32>,
    action_std: Vec<f32>,
}

impl NormalizationStats {
    pub fn new(action_mean: Vec<f32>, action_std: Vec<f32>) -> Result<Self> {
        if action_mean.len() != action_std.len() {
            return Err(Error::Load(format!(
                "action mean has {} entries but std has {}",
                action_mean.len(),
                action_std.len()
            )));
        }
        Ok(Self {
            action_mean,
            action_std,
        })
    }

    pub fn action_dim(&self) -> usize {
        self.action_mean.len()
    }

    pub fn action_mean(&self) -> &[f32] {
        &self.action_mean
    }

    pub fn action_std(&self) -> &[f32] {
        &self.action_std
    }

    /// Map a physical action back into the normalized space the model was trained on.
    pub fn normalize(&self, action: &[f32]) -> Result<Vec<f32>> {
        self.check_dim(action.len())?;
        Ok(action
            .iter()
            .zip(self.action_mean.iter().zip(&self.action_std))
            .map(|(a, (m, s))| (a - m) / s)
            .collect())
    }

    fn check_dim(&self, len: usize) -> Result<()> {
        if len != self.action_dim() {
            return Err(Error::shape(format!(
                "action has {} dimensions but stats describe {}",
                len,
                self.action_dim()
            )));
        }
        Ok(())
    }
}

/// Predicted control target for one observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Action(Vec<f32>);

impl Action {
    pub fn new(values: Vec<f32>) -> Self {
        Self(values)
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.0
    }
}

impl Deref for Action {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        &self.0
    }
}

impl From<Vec<f32>> for Action {
    fn from(values: Vec<f32>) -> Self {
        Self(values)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Chw,
    Hwc,
}

/// Work out the layout and spatial size of a rank-3 (or batched rank-4) image.
fn image_geometry(shape: &[usize]) -> Result<(Layout, usize, usize)> {
    let dims = match shape {
        [1, a, b, c] => [*a, *b, *c],
        [n, _, _, _] => {
            return Err(Error::shape(format!(
                "image batch dimension must be 1, got {}",
                n
            )))
        }
        [a, b, c] => [*a, *b, *c],
        other => {
            return Err(Error::shape(format!(
                "image must be rank 3 or 4, got shape {:?}",
                other
            )))
        }
    };

    let (layout, h, w) = match dims {
        [3, _, 3] => {
            return Err(Error::shape(format!(
                "ambiguous image layout {:?}: both first and last axes have size 3",
                shape
            )))
        }
        [3, h, w] => (Layout::Chw, h, w),
        [h, w, 3] => (Layout::Hwc, h, w),
        _ => return Err(Error::shape("unexpected image layout")),
    };
    if h == 0 || w == 0 {
        return Err(Error::shape(format!("image {:?} has no pixels", shape)));
    }
    Ok((layout, h, w))
}

/// Write `pixels` into a channel-first buffer, scaling and normalizing per channel.
fn normalize_pixels<T>(pixels: &[T], layout: Layout, h: usize, w: usize, scale: f32) -> Vec<f32>
where
    T: Copy + Into<f32> + Sync,
{
    let plane = h * w;
    let mut out = vec![0.0f32; 3 * plane];
    out.par_chunks_mut(plane).enumerate().for_each(|(c, dst)| {
        let (mean, std) = (MEAN[c], STD[c]);
        for (i, v) in dst.iter_mut().enumerate() {
            let src = match layout {
                Layout::Chw => c * plane + i,
                Layout::Hwc => i * 3 + c,
            };
            let x: f32 = pixels[src].into();
            *v = (x / scale - mean) / std;
        }
    });
    out
}

/// Turn a raw observation into `[1, S]` state and `[1, 3, H, W]` image tensors.
///
/// Integer pixels are always scaled from 0..=255. Float pixels are scaled only
/// when their maximum exceeds 1.0, since callers send both ranges.
pub fn encode(
    obs: &Observation,
    state_dim: usize,
    image_hw: Option<(usize, usize)>,
) -> Result<EncodedTensor> {
    if obs.state.rank() != 1 {
        return Err(Error::shape(format!(
            "state must be rank 1, got shape {:?}",
            obs.state.shape()
        )));
    }
    if obs.state.len() != state_dim {
        return Err(Error::shape(format!(
            "state has {} dimensions, expected {}",
            obs.state.len(),
            state_dim
        )));
    }

    let (layout, h, w) = image_geometry(obs.image.shape())?;
    if let Some((eh, ew)) = image_hw {
        if (h, w) != (eh, ew) {
            return Err(Error::shape(format!(
                "image is {}x{}, expected {}x{}",
                h, w, eh, ew
            )));
        }
    }

    let pixels = match &obs.image {
        ImageData::U8(t) => normalize_pixels(t.data(), layout, h, w, PIXEL_SCALE),
        ImageData::F32(t) => {
            let max = t.data().iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let scale = if max > 1.0 { PIXEL_SCALE } else { 1.0 };
            normalize_pixels(t.data(), layout, h, w, scale)
        }
    };

    Ok(EncodedTensor {
        state: HostTensor::new(vec![1, state_dim], obs.state.data().to_vec())?,
        image: HostTensor::new(vec![1, 3, h, w], pixels)?,
    })
}

/// Apply `raw * std + mean` elementwise.
pub fn denormalize(raw: Vec<f32>, stats: &NormalizationStats) -> Result<Vec<f32>> {
    stats.check_dim(raw.len())?;
    let mut out = raw;
    for (v, (m, s)) in out
        .iter_mut()
        .zip(stats.action_mean.iter().zip(&stats.action_std))
    {
        *v = *v * s + m;
    }
    Ok(out)
}

/// Turn a `[1, A]` model output into an action, denormalizing when stats are known.
pub fn decode(raw: HostTensor<f32>, stats: Option<&NormalizationStats>) -> Result<Action> {
    match raw.shape() {
        [1, _] => {}
        [n, _] => {
            return Err(Error::shape(format!(
                "batched decode is not supported, leading dimension is {}",
                n
            )))
        }
        other => {
            return Err(Error::shape(format!(
                "model output must be [1, A], got {:?}",
                other
            )))
        }
    }

    let values = raw.into_data();
    let values = match stats {
        Some(stats) => denormalize(values, stats)?,
        None => values,
    };
    Ok(Action(values))
}

/// Check that already-encoded tensors have the canonical shapes.
pub fn validate_encoded(
    encoded: &EncodedTensor,
    state_dim: usize,
    image_hw: Option<(usize, usize)>,
) -> Result<()> {
    if encoded.state.shape() != [1, state_dim] {
        return Err(Error::shape(format!(
            "state must be [1, {}], got {:?}",
            state_dim,
            encoded.state.shape()
        )));
    }
    match (encoded.image.shape(), image_hw) {
        ([1, 3, h, w], Some((eh, ew))) if (*h, *w) != (eh, ew) => Err(Error::shape(format!(
            "image is {}x{}, expected {}x{}",
            h, w, eh, ew
        ))),
        ([1, 3, h, w], _) if *h == 0 || *w == 0 => {
            Err(Error::shape(format!("image {}x{} has no pixels", h, w)))
        }
        ([1, 3, _, _], _) => Ok(()),
        (other, _) => Err(Error::shape(format!(
            "image must be [1, 3, H, W], got {:?}",
            other
        ))),
    }
}

/// Encode/decode bound to one deployment's state size and frame size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizationPipeline {
    state_dim: usize,
    image_hw: Option<(usize, usize)>,
}

impl NormalizationPipeline {
    pub fn new(state_dim: usize, image_hw: Option<(usize, usize)>) -> Self {
        Self {
            state_dim,
            image_hw,
        }
    }

    pub fn state_dim(&self) -> usize {
        self.state_dim
    }

    pub fn image_hw(&self) -> Option<(usize, usize)> {
        self.image_hw
    }

    pub fn encode(&self, obs: &Observation) -> Result<EncodedTensor> {
        encode(obs, self.state_dim, self.image_hw)
    }

    pub fn decode(
        &self,
        raw: HostTensor<f32>,
        stats: Option<&NormalizationStats>,
    ) -> Result<Action> {
        decode(raw, stats)
    }

    pub fn validate(&self, encoded: &EncodedTensor) -> Result<()> {
        validate_encoded(encoded, self.state_dim, self.image_hw)
    }
}
