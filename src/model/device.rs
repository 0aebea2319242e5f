//! Compute device selection.

use crate::error::{Error, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::{info, warn};

/// Requested compute device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DevicePreference {
    /// CUDA when available, otherwise CPU
    #[default]
    Auto,
    Cpu,
    #[serde(alias = "gpu")]
    Cuda,
    /// Accepted for compatibility with desktop setups; always served on CPU
    #[serde(alias = "mps")]
    Metal,
}

impl FromStr for DevicePreference {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(DevicePreference::Auto),
            "cpu" => Ok(DevicePreference::Cpu),
            "cuda" | "gpu" => Ok(DevicePreference::Cuda),
            "metal" | "mps" => Ok(DevicePreference::Metal),
            other => Err(Error::Config(format!("unknown device preference '{}'", other))),
        }
    }
}

impl fmt::Display for DevicePreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DevicePreference::Auto => "auto",
            DevicePreference::Cpu => "cpu",
            DevicePreference::Cuda => "cuda",
            DevicePreference::Metal => "metal",
        };
        f.write_str(s)
    }
}

/// Pick the device a model is loaded onto.
///
/// Metal is never selected, even when present: it is not a serving target,
/// so a Metal request degrades to CPU.
pub fn select_device(preference: DevicePreference) -> Result<Device> {
    match preference {
        DevicePreference::Cpu => Ok(Device::Cpu),
        DevicePreference::Metal => {
            warn!("Metal is not supported for serving, falling back to CPU");
            Ok(Device::Cpu)
        }
        DevicePreference::Auto | DevicePreference::Cuda => {
            if candle_core::utils::cuda_is_available() {
                let device = Device::new_cuda(0)
                    .map_err(|e| Error::Load(format!("Failed to open CUDA device: {}", e)))?;
                info!("Using CUDA device 0");
                Ok(device)
            } else {
                if preference == DevicePreference::Cuda {
                    warn!("CUDA requested but not available, falling back to CPU");
                } else if candle_core::utils::metal_is_available() {
                    info!("Metal is available but not used for serving");
                }
                Ok(Device::Cpu)
            }
        }
    }
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metal_degrades_to_cpu() {
        let device = select_device(DevicePreference::Metal).unwrap();
        assert!(matches!(device, Device::Cpu));
    }

    #[test]
    fn test_parse_preference() {
        assert_eq!("MPS".parse::<DevicePreference>().unwrap(), DevicePreference::Metal);
        assert_eq!("gpu".parse::<DevicePreference>().unwrap(), DevicePreference::Cuda);
        assert!("tpu".parse::<DevicePreference>().is_err());
    }
}
