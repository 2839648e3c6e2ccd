//! Trainable student network.
//!
//! The student is a small convolutional classifier whose parameters live in a
//! [`candle_nn::VarMap`] so they receive gradients and can be updated by an
//! optimiser. Once training is over, [`TrainableStudent::freeze`] copies the
//! parameters into a plain-tensor [`Sequential`] which the pruner and the
//! quantizer work on.
//!
//! Layer names follow the frozen model's convention so tensor names match
//! across phases:
//!
//! | Stage `i` layer | Name                  |
//! |-----------------|-----------------------|
//! | Conv2d 3x3      | `features.{4i}`       |
//! | BatchNorm2d     | `features.{4i + 1}`   |
//! | Relu            | `features.{4i + 2}`   |
//! | MaxPool2d(2)    | `features.{4i + 3}`   |
//! | GlobalAvgPool   | `pool`                |
//! | Linear          | `classifier`          |

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, Linear, Module, ModuleT, VarBuilder, VarMap};
use tracing::info;

use slimnet_core::{
    layers::{BatchNormLayer, Conv2dLayer, Layer, LinearLayer, NamedLayer},
    Classifier, CoreError, CoreResult, Sequential,
};

use crate::presets::ConvNetConfig;

const KERNEL: usize = 3;
const POOL: usize = 2;

struct ConvStage {
    conv: Conv2d,
    bn: BatchNorm,
}

/// A convolutional classifier whose parameters are held in a [`VarMap`].
pub struct TrainableStudent {
    stages: Vec<ConvStage>,
    head: Linear,
    varmap: VarMap,
    config: ConvNetConfig,
    device: Device,
}

impl TrainableStudent {
    /// Create a network with freshly initialised weights matching `config`.
    pub fn new(config: &ConvNetConfig, device: &Device) -> CoreResult<Self> {
        config.validate()?;

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let conv_cfg = Conv2dConfig { padding: 1, stride: 1, dilation: 1, groups: 1 };
        let mut stages = Vec::with_capacity(config.widths.len());
        let mut c_in = config.in_channels;
        for (i, &width) in config.widths.iter().enumerate() {
            let conv = candle_nn::conv2d(c_in, width, KERNEL, conv_cfg, vb.pp(format!("features.{}", 4 * i)))?;
            let bn = candle_nn::batch_norm(width, BatchNormConfig::default(), vb.pp(format!("features.{}", 4 * i + 1)))?;
            stages.push(ConvStage { conv, bn });
            c_in = width;
        }
        let head = candle_nn::linear(config.feature_width(), config.num_classes, vb.pp("classifier"))?;

        info!(
            widths = ?config.widths,
            classes = config.num_classes,
            params = config.approx_params(),
            "Initialised trainable network"
        );

        Ok(Self { stages, head, varmap, config: config.clone(), device: device.clone() })
    }

    /// Forward pass. `train = true` uses batch statistics in batch norm and
    /// updates its running averages.
    pub fn forward_t(&self, x: &Tensor, train: bool) -> CoreResult<Tensor> {
        let mut x = x.clone();
        for stage in &self.stages {
            x = stage.conv.forward(&x)?;
            x = stage.bn.forward_t(&x, train)?;
            x = x.relu()?.max_pool2d(POOL)?;
        }
        let x = x.mean((2, 3))?;
        Ok(self.head.forward(&x)?)
    }

    /// All variables the optimiser updates.
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn config(&self) -> &ConvNetConfig {
        &self.config
    }

    /// Copy the current parameters into a frozen [`Sequential`].
    ///
    /// The copy owns its storage, so further training of `self` does not leak
    /// into the frozen model.
    pub fn freeze(&self) -> CoreResult<Sequential> {
        let mut layers = Vec::with_capacity(self.stages.len() * 4 + 2);
        for (i, stage) in self.stages.iter().enumerate() {
            let base = 4 * i;
            layers.push(NamedLayer::new(
                format!("features.{base}"),
                Layer::Conv2d(Conv2dLayer {
                    weight: stage.conv.weight().copy()?,
                    bias: stage.conv.bias().map(Tensor::copy).transpose()?,
                    stride: 1,
                    padding: 1,
                    fused_relu: false,
                }),
            ));
            layers.push(NamedLayer::new(format!("features.{}", base + 1), Layer::BatchNorm2d(freeze_bn(&stage.bn)?)));
            layers.push(NamedLayer::new(format!("features.{}", base + 2), Layer::Relu));
            layers.push(NamedLayer::new(format!("features.{}", base + 3), Layer::MaxPool2d { kernel: POOL }));
        }
        layers.push(NamedLayer::new("pool", Layer::GlobalAvgPool));
        layers.push(NamedLayer::new(
            "classifier",
            Layer::Linear(LinearLayer {
                weight: self.head.weight().copy()?,
                bias: self.head.bias().map(Tensor::copy).transpose()?,
            }),
        ));
        Sequential::new(layers, self.device.clone())
    }
}

fn freeze_bn(bn: &BatchNorm) -> CoreResult<BatchNormLayer> {
    let (gamma, beta) = match bn.weight_and_bias() {
        Some((w, b)) => (w.copy()?, b.copy()?),
        None => {
            let c = bn.running_mean().dim(0)?;
            let dev = bn.running_mean().device();
            (Tensor::ones(c, DType::F32, dev)?, Tensor::zeros(c, DType::F32, dev)?)
        }
    };
    let running_var = bn.running_var().copy()?;
    if running_var.min(0)?.to_scalar::<f32>()? < 0.0 {
        return Err(CoreError::ModelShapeMismatch("batch norm running variance is negative".to_string()));
    }
    Ok(BatchNormLayer { gamma, beta, running_mean: bn.running_mean().copy()?, running_var, eps: bn.eps() })
}

impl Classifier for TrainableStudent {
    /// Eval-mode forward with the result detached from the graph.
    fn logits(&self, images: &Tensor) -> CoreResult<Tensor> {
        Ok(self.forward_t(images, false)?.detach())
    }

    fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    fn device(&self) -> &Device {
        &self.device
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::presets::ArchPreset;

    fn student() -> TrainableStudent {
        TrainableStudent::new(&ArchPreset::Tiny.config(3, 4), &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_shape() {
        let s = student();
        let x = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        assert_eq!(s.forward_t(&x, true).unwrap().dims(), &[2, 4]);
        assert_eq!(s.logits(&x).unwrap().dims(), &[2, 4]);
    }

    #[test]
    fn frozen_model_matches_eval_forward() {
        let s = student();
        let x = Tensor::rand(0f32, 1.0, (2, 3, 8, 8), &Device::Cpu).unwrap();
        let frozen = s.freeze().unwrap();
        let a = s.logits(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = frozen.logits(&x).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-5, "{x} vs {y}");
        }
    }

    #[test]
    fn frozen_layer_names_follow_convention() {
        let frozen = student().freeze().unwrap();
        let names: Vec<&str> = frozen.layers().iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names[0], "features.0");
        assert_eq!(names[5], "features.5");
        assert_eq!(names[names.len() - 2], "pool");
        assert_eq!(names[names.len() - 1], "classifier");
        assert_eq!(frozen.num_classes(), 4);
    }

    #[test]
    fn exposes_trainable_vars() {
        assert!(!student().trainable_vars().is_empty());
    }
}
