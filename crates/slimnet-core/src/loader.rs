use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::info;

use crate::{
    artifact::{read_artifact, ArtifactFormat},
    error::CoreResult,
    model::{Classifier, Sequential},
    quantized::QuantizedModel,
};

/// A model read back from an artifact, in whichever form it was saved.
///
/// The artifact header decides the variant:
/// 1. `slimnet.format = "float"` → [`DeployedModel::Float`]
/// 2. `slimnet.format = "quantized"` → [`DeployedModel::Quantized`]
pub enum DeployedModel {
    Float(Sequential),
    Quantized(QuantizedModel),
}

impl DeployedModel {
    pub fn load(path: &Path, device: &Device) -> CoreResult<Self> {
        let raw = read_artifact(path, device)?;
        let model = match raw.format {
            ArtifactFormat::Float => Self::Float(Sequential::from_parts(&raw.architecture, raw.tensors, device)?),
            ArtifactFormat::Quantized => {
                Self::Quantized(QuantizedModel::from_parts(&raw.architecture, raw.tensors, device)?)
            }
        };
        info!(path = %path.display(), format = %model.format(), classes = model.num_classes(), "Model loaded");
        Ok(model)
    }

    pub fn format(&self) -> ArtifactFormat {
        match self {
            Self::Float(_) => ArtifactFormat::Float,
            Self::Quantized(_) => ArtifactFormat::Quantized,
        }
    }
}

impl std::fmt::Debug for DeployedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Float(m) => write!(f, "DeployedModel::Float({} layers)", m.layers().len()),
            Self::Quantized(m) => write!(f, "DeployedModel::Quantized({} layers)", m.layers().len()),
        }
    }
}

impl Classifier for DeployedModel {
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
        match self {
            Self::Float(m) => m.logits(images),
            Self::Quantized(m) => m.logits(images),
        }
    }

    fn num_classes(&self) -> usize {
        match self {
            Self::Float(m) => m.num_classes(),
            Self::Quantized(m) => m.num_classes(),
        }
    }

    fn device(&self) -> &Device {
        match self {
            Self::Float(m) => m.device(),
            Self::Quantized(m) => m.device(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use tempfile::TempDir;

    #[test]
    fn dispatches_on_float_format() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("float.safetensors");
        crate::model::tests::tiny_model().save(&path).unwrap();

        let model = DeployedModel::load(&path, &Device::Cpu).unwrap();
        assert_eq!(model.format(), ArtifactFormat::Float);
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn garbage_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("junk.safetensors");
        std::fs::write(&path, b"not a safetensors file").unwrap();
        assert!(matches!(
            DeployedModel::load(&path, &Device::Cpu),
            Err(CoreError::SerializationFailure { .. })
        ));
    }
}
