use std::fmt;
use std::str::FromStr;

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing::warn;

use crate::error::{CoreError, CoreResult};

/// Which class of compute unit the pipeline should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// General-purpose CPU.
    #[default]
    Cpu,
    /// CUDA or Metal, whichever the binary was compiled with.
    Accelerated,
}

impl FromStr for DeviceKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" | "general-purpose" => Ok(Self::Cpu),
            "accelerated" | "gpu" | "cuda" | "metal" => Ok(Self::Accelerated),
            other => Err(CoreError::InvalidHyperparameter {
                name: "device".to_string(),
                reason: format!("unknown device '{other}', expected 'cpu' or 'accelerated'"),
            }),
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// Selects the compute device for `kind`.
///
/// When the `cuda` feature is enabled and an accelerated device is requested,
/// attempts to acquire CUDA device `ordinal`. Falls back to CPU on any error.
pub fn select_device(kind: DeviceKind, #[allow(unused_variables)] ordinal: usize) -> CoreResult<Device> {
    let prefer_gpu = kind == DeviceKind::Accelerated;

    #[cfg(feature = "cuda")]
    if prefer_gpu {
        match Device::new_cuda(ordinal) {
            Ok(dev) => {
                info!(ordinal, "Using CUDA device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "CUDA unavailable, falling back to CPU");
            }
        }
    }

    #[cfg(feature = "metal")]
    if prefer_gpu {
        match Device::new_metal(ordinal) {
            Ok(dev) => {
                info!("Using Metal device");
                return Ok(dev);
            }
            Err(e) => {
                warn!(error = %e, "Metal unavailable, falling back to CPU");
            }
        }
    }

    info!("Using CPU device");
    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    if prefer_gpu {
        warn!(
            "accelerated device requested but this binary was built without GPU support; \
             rebuild with `--features cuda` or `--features metal`"
        );
    }
    Ok(Device::Cpu)
}

/// Returns a human-readable description of a device.
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "CPU",
        Device::Cuda(_) => "CUDA",
        Device::Metal(_) => "Metal",
    }
}

/// Fails with [`CoreError::DevicePlacementMismatch`] unless both devices are
/// the same physical unit. Tensors are never migrated implicitly.
pub fn ensure_same_device(left: &Device, right: &Device) -> CoreResult<()> {
    if left.same_device(right) {
        Ok(())
    } else {
        Err(CoreError::DevicePlacementMismatch {
            left: format!("{left:?}"),
            right: format!("{right:?}"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_cpu_returns_cpu() {
        let device = select_device(DeviceKind::Cpu, 0).unwrap();
        assert!(
            matches!(device, Device::Cpu),
            "DeviceKind::Cpu must always return CPU"
        );
    }

    #[test]
    fn test_select_device_accelerated_without_gpu_feature() {
        #[cfg(not(any(feature = "cuda", feature = "metal")))]
        {
            let device = select_device(DeviceKind::Accelerated, 0).unwrap();
            assert!(matches!(device, Device::Cpu));
        }
    }

    #[test]
    fn test_device_name_cpu() {
        assert_eq!(device_name(&Device::Cpu), "CPU");
    }

    #[test]
    fn test_device_kind_parse() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("general-purpose".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("Accelerated".parse::<DeviceKind>().unwrap(), DeviceKind::Accelerated);
        assert!("tpu".parse::<DeviceKind>().is_err());
    }

    #[test]
    fn test_same_cpu_device_passes() {
        assert!(ensure_same_device(&Device::Cpu, &Device::Cpu).is_ok());
    }
}
