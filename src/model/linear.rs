//! Reference policy: pooled image features concatenated with state, then one affine layer.

use super::{Checkpoint, PolicyModel};
use crate::constants::artifact::{POLICY_BIAS_KEY, POLICY_WEIGHT_KEY};
use crate::error::{Error, Result};
use crate::normalize::EncodedTensor;
use crate::tensor::HostTensor;
use candle_core::{DType, Device, Tensor};

fn forward_err(e: candle_core::Error) -> Error {
    Error::Inference(e.to_string())
}

/// `action = W · [state, mean_hw(image)] + b`
///
/// `W` is `[A, S + 3]` and `b` is `[A]`.
#[derive(Debug)]
pub struct LinearPolicy {
    /// Transposed weight, `[S + 3, A]`
    weight_t: Tensor,
    bias: Tensor,
    device: Device,
    state_dim: usize,
    action_dim: usize,
}

impl LinearPolicy {
    pub fn new(weight: Tensor, bias: Tensor) -> Result<Self> {
        let load_err = |e: candle_core::Error| Error::Load(format!("invalid policy weights: {}", e));

        let (action_dim, in_dim) = weight.dims2().map_err(load_err)?;
        if in_dim <= 3 {
            return Err(Error::Load(format!(
                "policy weight takes {} inputs, needs state plus 3 image channels",
                in_dim
            )));
        }
        let bias_dim = bias.dims1().map_err(load_err)?;
        if bias_dim != action_dim {
            return Err(Error::Load(format!(
                "policy bias has {} entries, weight produces {}",
                bias_dim, action_dim
            )));
        }

        let device = weight.device().clone();
        let weight_t = weight
            .to_dtype(DType::F32)
            .and_then(|w| w.t())
            .and_then(|w| w.contiguous())
            .map_err(load_err)?;
        let bias = bias.to_dtype(DType::F32).map_err(load_err)?;

        Ok(Self {
            weight_t,
            bias,
            device,
            state_dim: in_dim - 3,
            action_dim,
        })
    }

    /// Load `policy.weight` and `policy.bias` from a checkpoint onto `device`.
    pub fn load(checkpoint: &Checkpoint, device: &Device) -> Result<Self> {
        let mut tensors = checkpoint.load_weights(device)?;
        let mut take = |key: &str| {
            tensors.remove(key).ok_or_else(|| {
                Error::Load(format!(
                    "weights file {} has no '{}' tensor",
                    checkpoint.weights_path().display(),
                    key
                ))
            })
        };
        let weight = take(POLICY_WEIGHT_KEY)?;
        let bias = take(POLICY_BIAS_KEY)?;
        Self::new(weight, bias)
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl PolicyModel for LinearPolicy {
    fn forward(&mut self, input: &EncodedTensor) -> Result<HostTensor<f32>> {
        let (h, w) = input.image_hw();
        let image = Tensor::from_slice(input.image.data(), (1, 3, h, w), &self.device)
            .map_err(forward_err)?;
        let state = Tensor::from_slice(input.state.data(), (1, self.state_dim), &self.device)
            .map_err(forward_err)?;

        let pooled = image.flatten_from(2).and_then(|t| t.mean(2)).map_err(forward_err)?;
        let features = Tensor::cat(&[&state, &pooled], 1).map_err(forward_err)?;
        let values = features
            .matmul(&self.weight_t)
            .and_then(|y| y.broadcast_add(&self.bias))
            .and_then(|y| y.to_device(&Device::Cpu))
            .and_then(|y| y.flatten_all())
            .and_then(|y| y.to_vec1::<f32>())
            .map_err(forward_err)?;

        HostTensor::new(vec![1, self.action_dim], values)
    }

    fn state_dim(&self) -> usize {
        self.state_dim
    }

    fn action_dim(&self) -> usize {
        self.action_dim
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_matches_hand_computation() {
        // two state dims, one action: a = s0 + 2*s1 + r + g + b + 0.5
        let weight = Tensor::from_vec(vec![1.0f32, 2.0, 1.0, 1.0, 1.0], (1, 5), &Device::Cpu).unwrap();
        let bias = Tensor::from_vec(vec![0.5f32], 1, &Device::Cpu).unwrap();
        let mut policy = LinearPolicy::new(weight, bias).unwrap();
        assert_eq!(policy.state_dim(), 2);

        let input = EncodedTensor {
            state: HostTensor::new(vec![1, 2], vec![1.0, 1.0]).unwrap(),
            image: HostTensor::new(vec![1, 3, 1, 2], vec![0.0, 2.0, 1.0, 1.0, -1.0, -3.0]).unwrap(),
        };
        let out = policy.forward(&input).unwrap();
        assert_eq!(out.shape(), &[1, 1]);
        // 1 + 2 + (1 + 1 - 2) + 0.5
        assert!((out.data()[0] - 3.5).abs() < 1e-6);
    }

    #[test]
    fn test_bias_mismatch_rejected() {
        let weight = Tensor::zeros((2, 5), DType::F32, &Device::Cpu).unwrap();
        let bias = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(LinearPolicy::new(weight, bias), Err(Error::Load(_))));
    }
}
