use std::collections::{HashMap, HashSet};
use std::path::Path;

use candle_core::{Device, Tensor};
use tracing::info;

use crate::{
    artifact::{read_artifact, write_artifact, ArtifactFormat},
    error::{CoreError, CoreResult},
    layers::{Layer, LayerSpec, NamedLayer},
};

/// Anything that maps a batch of images to class scores.
///
/// Teacher, student, and every deployed form of the student implement this,
/// so evaluation and benchmarking do not care which phase a model is in.
pub trait Classifier {
    /// `images`: `[batch, channels, height, width]` → logits `[batch, classes]`.
    ///
    /// Must not mutate the model or track gradients.
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor>;

    /// Size of the output dimension.
    fn num_classes(&self) -> usize;

    /// Device holding the model's tensors.
    fn device(&self) -> &Device;
}

/// An ordered stack of named layers in full precision.
///
/// This is the frozen form of a network: it is what the teacher runs, what a
/// trained student becomes, and what the pruner and quantizer transform.
#[derive(Debug, Clone)]
pub struct Sequential {
    layers: Vec<NamedLayer>,
    device: Device,
}

impl Sequential {
    /// Build a model from `layers`.
    ///
    /// The stack must be non-empty, names must be unique, and the final layer
    /// must be a [`Layer::Linear`] classifier head.
    pub fn new(layers: Vec<NamedLayer>, device: Device) -> CoreResult<Self> {
        let mut seen = HashSet::new();
        for l in &layers {
            if !seen.insert(l.name.as_str()) {
                return Err(CoreError::ModelShapeMismatch(format!("duplicate layer name '{}'", l.name)));
            }
        }
        match layers.last() {
            Some(NamedLayer { layer: Layer::Linear(_), .. }) => {}
            Some(other) => {
                return Err(CoreError::ModelShapeMismatch(format!(
                    "last layer '{}' is {}, expected a linear classifier head",
                    other.name,
                    other.layer.kind().as_str()
                )))
            }
            None => return Err(CoreError::ModelShapeMismatch("model has no layers".to_string())),
        }
        Ok(Self { layers, device })
    }

    pub fn layers(&self) -> &[NamedLayer] {
        &self.layers
    }

    /// Mutable access for in-place transformations such as pruning.
    pub fn layers_mut(&mut self) -> &mut [NamedLayer] {
        &mut self.layers
    }

    pub fn into_layers(self) -> Vec<NamedLayer> {
        self.layers
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.layers.iter().position(|l| l.name == name)
    }

    pub fn forward(&self, x: &Tensor) -> CoreResult<Tensor> {
        let mut x = x.clone();
        for l in &self.layers {
            x = l.layer.forward(&x)?;
        }
        Ok(x)
    }

    /// Total number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.layers.iter().map(|l| l.layer.parameter_count()).sum()
    }

    pub fn to_device(&self, device: &Device) -> CoreResult<Self> {
        let layers = self.layers.iter().map(|l| l.to_device(device)).collect::<CoreResult<Vec<_>>>()?;
        Ok(Self { layers, device: device.clone() })
    }

    /// Persist as a float artifact.
    pub fn save(&self, path: &Path) -> CoreResult<()> {
        let mut tensors = HashMap::new();
        for l in &self.layers {
            l.collect_tensors(&mut tensors);
        }
        let specs: Vec<LayerSpec> = self.layers.iter().map(NamedLayer::spec).collect();
        write_artifact(path, &tensors, ArtifactFormat::Float, serde_json::to_string(&specs)?)?;
        info!(path = %path.display(), layers = self.layers.len(), "Float model saved");
        Ok(())
    }

    /// Load a float artifact written by [`Sequential::save`].
    pub fn load(path: &Path, device: &Device) -> CoreResult<Self> {
        let raw = read_artifact(path, device)?;
        if raw.format != ArtifactFormat::Float {
            return Err(CoreError::serialization(path, format!("expected a float artifact, found {}", raw.format)));
        }
        Self::from_parts(&raw.architecture, raw.tensors, device)
    }

    pub(crate) fn from_parts(
        architecture: &str,
        mut tensors: HashMap<String, Tensor>,
        device: &Device,
    ) -> CoreResult<Self> {
        let specs: Vec<LayerSpec> = serde_json::from_str(architecture)?;
        let layers = specs
            .iter()
            .map(|s| NamedLayer::from_spec(s, &mut tensors))
            .collect::<CoreResult<Vec<_>>>()?;
        Self::new(layers, device.clone())
    }
}

impl Classifier for Sequential {
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
        self.forward(images)
    }

    fn num_classes(&self) -> usize {
        match self.layers.last() {
            Some(NamedLayer { layer: Layer::Linear(l), .. }) => l.out_features(),
            _ => 0,
        }
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::layers::{BatchNormLayer, Conv2dLayer, LinearLayer};
    use candle_core::DType;
    use tempfile::TempDir;

    /// conv(3→4) → bn → relu → maxpool → gap → linear(4→2)
    pub(crate) fn tiny_model() -> Sequential {
        let dev = Device::Cpu;
        let weight = Tensor::arange(0f32, 108.0, &dev)
            .unwrap()
            .affine(0.01, -0.5)
            .unwrap()
            .reshape((4, 3, 3, 3))
            .unwrap();
        let layers = vec![
            NamedLayer::new(
                "features.0",
                Layer::Conv2d(Conv2dLayer {
                    weight,
                    bias: Some(Tensor::new(&[0.1f32, -0.1, 0.2, 0.0], &dev).unwrap()),
                    stride: 1,
                    padding: 1,
                    fused_relu: false,
                }),
            ),
            NamedLayer::new(
                "features.1",
                Layer::BatchNorm2d(BatchNormLayer {
                    gamma: Tensor::new(&[1.0f32, 0.5, 2.0, 1.5], &dev).unwrap(),
                    beta: Tensor::new(&[0.0f32, 0.1, -0.1, 0.2], &dev).unwrap(),
                    running_mean: Tensor::new(&[0.2f32, -0.3, 0.1, 0.0], &dev).unwrap(),
                    running_var: Tensor::new(&[1.0f32, 2.0, 0.5, 1.5], &dev).unwrap(),
                    eps: 1e-5,
                }),
            ),
            NamedLayer::new("features.2", Layer::Relu),
            NamedLayer::new("features.3", Layer::MaxPool2d { kernel: 2 }),
            NamedLayer::new("pool", Layer::GlobalAvgPool),
            NamedLayer::new(
                "classifier",
                Layer::Linear(LinearLayer {
                    weight: Tensor::new(&[[0.5f32, -0.2, 0.3, 0.1], [-0.4, 0.6, -0.1, 0.2]], &dev).unwrap(),
                    bias: Some(Tensor::new(&[0.0f32, 0.05], &dev).unwrap()),
                }),
            ),
        ];
        Sequential::new(layers, dev).unwrap()
    }

    #[test]
    fn forward_produces_class_scores() {
        let model = tiny_model();
        let x = Tensor::ones((2, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let y = model.logits(&x).unwrap();
        assert_eq!(y.dims(), &[2, 2]);
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn rejects_duplicate_names() {
        let mut layers = tiny_model().into_layers();
        layers[1].name = "features.0".to_string();
        assert!(matches!(
            Sequential::new(layers, Device::Cpu),
            Err(CoreError::ModelShapeMismatch(_))
        ));
    }

    #[test]
    fn rejects_missing_classifier_head() {
        let mut layers = tiny_model().into_layers();
        layers.pop();
        assert!(Sequential::new(layers, Device::Cpu).is_err());
    }

    #[test]
    fn save_and_load_produce_identical_logits() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("float.safetensors");
        let model = tiny_model();
        model.save(&path).unwrap();
        let loaded = Sequential::load(&path, &Device::Cpu).unwrap();

        let x = Tensor::ones((1, 3, 8, 8), DType::F32, &Device::Cpu).unwrap();
        let a = model.logits(&x).unwrap().to_vec2::<f32>().unwrap();
        let b = loaded.logits(&x).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        assert_eq!(loaded.parameter_count(), model.parameter_count());
    }
}
